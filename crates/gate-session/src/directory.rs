//! Session directory: registry of live agents and remote-control operations.
//!
//! The directory is the only way backend logic reaches a live connection.
//! Registry-level synchronization covers lookups only; each session's own
//! lock is held for the whole mutate-then-persist sequence, so storage
//! round trips never block the registry.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use gate_core::{
    GateError, MergeOutcome, Result, Session, SessionId, SessionLearner, SessionStorage, Settings,
    SharedSession,
};
use tracing::{debug, warn};

use crate::{Agent, AgentLearner};

/// Registry of live agents keyed by session id.
pub struct SessionDirectory {
    agents: DashMap<SessionId, Arc<Agent>>,
    storage: Option<Arc<dyn SessionStorage>>,
    session_learner: Option<Arc<dyn SessionLearner>>,
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDirectory {
    /// Create a directory without persistence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            storage: None,
            session_learner: None,
        }
    }

    /// Persist bound sessions through `storage`.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Forward session-level connect/disconnect events to `learner`.
    #[must_use]
    pub fn with_session_learner(mut self, learner: Arc<dyn SessionLearner>) -> Self {
        self.session_learner = Some(learner);
        self
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The agent registered under `session_id`.
    ///
    /// # Errors
    /// Returns not-found if no agent is registered under that id.
    pub fn agent(&self, session_id: &str) -> Result<Arc<Agent>> {
        self.agents
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GateError::NotFound(format!("no agent found for session {session_id}")))
    }

    fn live_session(&self, session_id: &str) -> Result<SharedSession> {
        self.live_agent(session_id).map(|(_, state)| state)
    }

    fn live_agent(&self, session_id: &str) -> Result<(Arc<Agent>, SharedSession)> {
        let agent = self.agent(session_id)?;
        let state = agent
            .session()
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("session {session_id} not realized")))?;
        Ok((agent, state))
    }

    fn registered(&self) -> Vec<Arc<Agent>> {
        self.agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn persist_if_bound(&self, session: &Session) {
        let Some(storage) = &self.storage else {
            return;
        };
        if !session.is_bound() {
            return;
        }
        if let Err(e) = storage.store(session.user_id(), session).await {
            warn!(
                session_id = %session.session_id(),
                user_id = %session.user_id(),
                error = %e,
                "failed to persist session"
            );
        }
    }

    /// Current state of a session.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub async fn update(&self, session_id: &str) -> Result<Session> {
        let state = self.live_session(session_id)?;
        let session = state.lock().await;
        Ok(session.clone())
    }

    /// Bind a user id to a session, seeding settings from storage.
    ///
    /// Persisted settings fill in keys the live session lacks; the merged
    /// result is written back. Query failures or absent data leave the
    /// settings untouched.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub async fn bind(&self, session_id: &str, user_id: &str) -> Result<Session> {
        let (agent, state) = self.live_agent(session_id)?;
        let mut session = state.lock().await;
        session.set_user_id(user_id);
        agent.set_user_id(user_id);

        let Some(storage) = &self.storage else {
            return Ok(session.clone());
        };
        if !session.is_bound() {
            return Ok(session.clone());
        }

        let data = match storage.query(user_id).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(session.clone()),
            Err(e) => {
                warn!(session_id, user_id, error = %e, "failed to query persisted session");
                return Ok(session.clone());
            }
        };
        let persisted = match Session::from_bytes(&data) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(session_id, user_id, error = %e, "discarding unreadable persisted session");
                return Ok(session.clone());
            }
        };

        if session.merge_persisted(persisted) == MergeOutcome::Merged {
            self.persist_if_bound(&session).await;
        }
        Ok(session.clone())
    }

    /// Clear a session's user id. Never touches storage.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub async fn unbind(&self, session_id: &str) -> Result<Session> {
        let (agent, state) = self.live_agent(session_id)?;
        let mut session = state.lock().await;
        session.set_user_id("");
        agent.set_user_id("");
        Ok(session.clone())
    }

    /// Replace a session's settings wholesale.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub async fn push(&self, session_id: &str, settings: Settings) -> Result<Session> {
        let state = self.live_session(session_id)?;
        let mut session = state.lock().await;
        session.set_settings(settings);
        self.persist_if_bound(&session).await;
        Ok(session.clone())
    }

    /// Upsert one setting.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub async fn set(&self, session_id: &str, key: &str, value: &str) -> Result<Session> {
        let state = self.live_session(session_id)?;
        let mut session = state.lock().await;
        session.set(key, value);
        self.persist_if_bound(&session).await;
        Ok(session.clone())
    }

    /// Delete one setting; absent keys are not an error.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub async fn remove(&self, session_id: &str, key: &str) -> Result<Session> {
        let state = self.live_session(session_id)?;
        let mut session = state.lock().await;
        session.remove(key);
        self.persist_if_bound(&session).await;
        Ok(session.clone())
    }

    /// Write a pre-encoded payload to one session.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub fn send(&self, session_id: &str, data: Bytes) -> Result<()> {
        let agent = self.agent(session_id)?;
        agent.write_msg_bytes(vec![data]);
        Ok(())
    }

    /// Write to every known session in a comma-separated id list.
    ///
    /// Unknown ids are skipped. Returns the number of agents written to.
    #[must_use]
    pub fn send_batch(&self, session_ids: &str, data: &Bytes) -> usize {
        let mut count = 0;
        for id in session_ids.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            if let Ok(agent) = self.agent(id) {
                agent.write_msg_bytes(vec![data.clone()]);
                count += 1;
            }
        }
        count
    }

    /// Write to every registered session. Returns the number written to.
    #[must_use]
    pub fn broadcast(&self, data: &Bytes) -> usize {
        let agents = self.registered();
        for agent in &agents {
            agent.write_msg_bytes(vec![data.clone()]);
        }
        agents.len()
    }

    /// Whether `user_id` has a live session on this node.
    ///
    /// Only local sessions are scanned; multi-node fan-out is the caller's
    /// job.
    ///
    /// # Errors
    /// Returns not-found if no local session is bound to `user_id`.
    pub fn is_connect(&self, user_id: &str) -> Result<bool> {
        for agent in self.registered() {
            if !user_id.is_empty() && agent.user_id() == user_id {
                return Ok(!agent.is_closed());
            }
        }
        Err(GateError::NotFound(format!(
            "userId {user_id} not found on this gateway node"
        )))
    }

    /// Close a session's connection.
    ///
    /// # Errors
    /// Returns not-found for unknown session ids.
    pub fn close(&self, session_id: &str) -> Result<()> {
        let agent = self.agent(session_id)?;
        agent.close();
        Ok(())
    }

    /// Extend the persisted image's lifetime for a connected user.
    pub async fn heartbeat(&self, user_id: &str) {
        if let Some(storage) = &self.storage {
            storage.heartbeat(user_id).await;
        }
    }

    /// Delete a user's persisted image.
    ///
    /// # Errors
    /// Returns a persistence error if storage rejects the delete.
    pub async fn evict(&self, user_id: &str) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.delete(user_id).await?;
        }
        Ok(())
    }

    /// Close every registered agent and clear the registry.
    pub fn on_destroy(&self) {
        for agent in self.registered() {
            agent.close();
        }
        self.agents.clear();
    }
}

#[async_trait]
impl AgentLearner for SessionDirectory {
    async fn connect(&self, agent: &Arc<Agent>) {
        let (Some(session_id), Some(state)) = (agent.session_id(), agent.session()) else {
            return;
        };
        self.agents.insert(session_id.to_string(), Arc::clone(agent));
        debug!(session_id, "session connected");

        if let Some(learner) = &self.session_learner {
            let snapshot = state.lock().await.clone();
            learner.connect(&snapshot);
        }
    }

    async fn disconnect(&self, agent: &Arc<Agent>) {
        let (Some(session_id), Some(state)) = (agent.session_id(), agent.session()) else {
            return;
        };
        self.agents.remove(session_id);
        debug!(session_id, "session disconnected");

        if let Some(learner) = &self.session_learner {
            let snapshot = state.lock().await.clone();
            learner.disconnect(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr, SocketAddrV4},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    };

    use gate_core::StorageError;

    use super::*;
    use crate::{MemoryConn, MemoryPeer, storage::MemoryStorage};

    /// Storage double that records every `store` and `heartbeat` call.
    #[derive(Default)]
    struct RecordingStorage {
        persisted: Mutex<Option<Vec<u8>>>,
        stores: Mutex<Vec<(String, Session)>>,
        heartbeats: AtomicUsize,
        query_delay: Option<Duration>,
        fail_store: bool,
        fail_query: bool,
    }

    impl RecordingStorage {
        fn with_persisted(session: &Session) -> Self {
            Self {
                persisted: Mutex::new(Some(session.to_bytes().unwrap())),
                ..Self::default()
            }
        }

        fn store_count(&self) -> usize {
            self.stores.lock().unwrap().len()
        }

        fn last_stored(&self) -> Session {
            self.stores.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl SessionStorage for RecordingStorage {
        async fn store(
            &self,
            user_id: &str,
            session: &Session,
        ) -> std::result::Result<(), StorageError> {
            self.stores
                .lock()
                .unwrap()
                .push((user_id.to_string(), session.clone()));
            if self.fail_store {
                return Err(StorageError::Internal("disk full".to_string()));
            }
            Ok(())
        }

        async fn delete(&self, _user_id: &str) -> std::result::Result<(), StorageError> {
            Ok(())
        }

        async fn query(
            &self,
            _user_id: &str,
        ) -> std::result::Result<Option<Vec<u8>>, StorageError> {
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_query {
                return Err(StorageError::Internal("timeout".to_string()));
            }
            Ok(self.persisted.lock().unwrap().clone())
        }

        async fn heartbeat(&self, _user_id: &str) {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingSessionLearner {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl SessionLearner for CountingSessionLearner {
        fn connect(&self, _session: &Session) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnect(&self, _session: &Session) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    /// Register a fresh agent the way its first message would.
    async fn connect_agent(directory: &Arc<SessionDirectory>) -> (Arc<Agent>, MemoryPeer, String) {
        let (conn, peer) = MemoryConn::pair(addr(3563), addr(50000));
        let agent = Agent::new(conn, None, Arc::clone(directory) as Arc<dyn AgentLearner>);
        let task = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.run().await }
        });
        peer.tx.send(Bytes::from_static(b"hello")).unwrap();
        while !agent
            .session_id()
            .is_some_and(|id| directory.agent(id).is_ok())
        {
            tokio::task::yield_now().await;
        }
        // Keep the receive loop alive in the background.
        drop(task);
        let session_id = agent.session_id().unwrap().to_string();
        (agent, peer, session_id)
    }

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let directory = SessionDirectory::new();
        assert!(directory.update("nope").await.unwrap_err().is_not_found());
        assert!(directory.bind("nope", "u").await.unwrap_err().is_not_found());
        assert!(directory.unbind("nope").await.unwrap_err().is_not_found());
        assert!(directory.set("nope", "k", "v").await.unwrap_err().is_not_found());
        assert!(directory.send("nope", Bytes::new()).unwrap_err().is_not_found());
        assert!(directory.close("nope").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_connect_registers_and_disconnect_removes() {
        let learner = Arc::new(CountingSessionLearner::default());
        let directory = Arc::new(
            SessionDirectory::new()
                .with_session_learner(Arc::clone(&learner) as Arc<dyn SessionLearner>),
        );
        let (agent, peer, session_id) = connect_agent(&directory).await;

        assert_eq!(directory.len(), 1);
        let session = directory.update(&session_id).await.unwrap();
        assert_eq!(session.session_id(), session_id);
        assert_eq!(learner.connects.load(Ordering::SeqCst), 1);

        drop(peer);
        while !directory.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(agent.is_closed());
        assert_eq!(learner.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bind_merge_keeps_live_values_and_persists_once() {
        let mut persisted = Session::default();
        persisted.set_settings(settings(&[("a", "2"), ("b", "2")]));
        let storage = Arc::new(RecordingStorage::with_persisted(&persisted));
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;

        // Guest settings are not persisted.
        directory.set(&session_id, "a", "1").await.unwrap();
        assert_eq!(storage.store_count(), 0);

        let session = directory.bind(&session_id, "u-1").await.unwrap();
        assert_eq!(session.user_id(), "u-1");
        assert_eq!(session.settings(), Some(&settings(&[("a", "1"), ("b", "2")])));
        assert_eq!(storage.store_count(), 1);
        assert_eq!(storage.last_stored().settings(), session.settings());
    }

    #[tokio::test]
    async fn test_bind_without_persisted_data_leaves_settings() {
        let storage = Arc::new(RecordingStorage::default());
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;
        directory.set(&session_id, "a", "1").await.unwrap();

        let session = directory.bind(&session_id, "u-1").await.unwrap();
        assert_eq!(session.settings(), Some(&settings(&[("a", "1")])));
        assert_eq!(storage.store_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_query_failure_is_not_fatal() {
        let storage = Arc::new(RecordingStorage {
            fail_query: true,
            ..RecordingStorage::default()
        });
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;

        let session = directory.bind(&session_id, "u-1").await.unwrap();
        assert_eq!(session.user_id(), "u-1");
        assert_eq!(storage.store_count(), 0);
    }

    #[tokio::test]
    async fn test_unbind_never_persists() {
        let storage = Arc::new(RecordingStorage::default());
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;

        directory.bind(&session_id, "u-1").await.unwrap();
        directory.set(&session_id, "k", "v").await.unwrap();
        assert_eq!(storage.store_count(), 1);

        let session = directory.unbind(&session_id).await.unwrap();
        assert!(!session.is_bound());
        assert_eq!(storage.store_count(), 1);

        directory.set(&session_id, "k", "w").await.unwrap();
        assert_eq!(storage.store_count(), 1);
    }

    #[tokio::test]
    async fn test_push_and_remove_persist_when_bound() {
        let storage = Arc::new(RecordingStorage::default());
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;
        directory.bind(&session_id, "u-1").await.unwrap();

        let pushed = directory
            .push(&session_id, settings(&[("x", "1"), ("y", "2")]))
            .await
            .unwrap();
        assert_eq!(pushed.settings(), Some(&settings(&[("x", "1"), ("y", "2")])));

        let removed = directory.remove(&session_id, "x").await.unwrap();
        assert_eq!(removed.settings(), Some(&settings(&[("y", "2")])));
        directory.remove(&session_id, "absent").await.unwrap();

        assert_eq!(storage.store_count(), 3);
        assert_eq!(storage.last_stored().settings(), Some(&settings(&[("y", "2")])));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_mutation() {
        let storage = Arc::new(RecordingStorage {
            fail_store: true,
            ..RecordingStorage::default()
        });
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;
        directory.bind(&session_id, "u-1").await.unwrap();

        let session = directory.set(&session_id, "k", "v").await.unwrap();
        assert_eq!(session.get("k"), "v");
        assert_eq!(directory.update(&session_id).await.unwrap().get("k"), "v");
    }

    #[tokio::test]
    async fn test_concurrent_sets_are_serialized() {
        let storage = Arc::new(RecordingStorage::default());
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_agent, _peer, session_id) = connect_agent(&directory).await;
        directory.bind(&session_id, "u-1").await.unwrap();

        let first = tokio::spawn({
            let directory = Arc::clone(&directory);
            let session_id = session_id.clone();
            async move { directory.set(&session_id, "k", "v1").await }
        });
        let second = tokio::spawn({
            let directory = Arc::clone(&directory);
            let session_id = session_id.clone();
            async move { directory.set(&session_id, "k", "v2").await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(storage.store_count(), 2);
        let last = storage.last_stored();
        let current = directory.update(&session_id).await.unwrap();
        assert_eq!(current.get("k"), last.get("k"));
        assert!(["v1", "v2"].contains(&current.get("k")));
        assert_eq!(current.settings().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_batch_skips_unknown_ids() {
        let directory = Arc::new(SessionDirectory::new());
        let (_a, mut peer_a, id_a) = connect_agent(&directory).await;
        let (_b, mut peer_b, id_b) = connect_agent(&directory).await;

        let data = Bytes::from_static(b"tick");
        let count = directory.send_batch(&format!("{id_a},{id_b},missing"), &data);
        assert_eq!(count, 2);
        assert_eq!(peer_a.rx.recv().await.unwrap(), vec![data.clone()]);
        assert_eq!(peer_b.rx.recv().await.unwrap(), vec![data]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session_once() {
        let directory = Arc::new(SessionDirectory::new());
        let mut peers = Vec::new();
        let mut agents = Vec::new();
        for _ in 0..3 {
            let (agent, peer, _) = connect_agent(&directory).await;
            agents.push(agent);
            peers.push(peer);
        }

        let data = Bytes::from_static(b"all");
        assert_eq!(directory.broadcast(&data), directory.len());
        for peer in &mut peers {
            assert_eq!(peer.rx.recv().await.unwrap(), vec![data.clone()]);
            assert!(peer.rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_send_writes_payload() {
        let directory = Arc::new(SessionDirectory::new());
        let (_agent, mut peer, session_id) = connect_agent(&directory).await;

        directory.send(&session_id, Bytes::from_static(b"direct")).unwrap();
        assert_eq!(peer.rx.recv().await.unwrap(), vec![Bytes::from_static(b"direct")]);
    }

    #[tokio::test]
    async fn test_is_connect() {
        let directory = Arc::new(SessionDirectory::new());
        let (_agent, _peer, session_id) = connect_agent(&directory).await;
        directory.bind(&session_id, "u-1").await.unwrap();

        assert!(directory.is_connect("u-1").unwrap());
        assert!(directory.is_connect("u-2").unwrap_err().is_not_found());
        assert!(directory.is_connect("").unwrap_err().is_not_found());

        directory.unbind(&session_id).await.unwrap();
        assert!(directory.is_connect("u-1").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_is_connect_not_blocked_by_slow_storage() {
        let storage = Arc::new(RecordingStorage {
            query_delay: Some(Duration::from_secs(2)),
            ..RecordingStorage::default()
        });
        let directory = Arc::new(
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>),
        );
        let (_slow, _slow_peer, slow_id) = connect_agent(&directory).await;
        let (_idle, _idle_peer, _) = connect_agent(&directory).await;

        let binding = tokio::spawn({
            let directory = Arc::clone(&directory);
            async move { directory.bind(&slow_id, "slow").await }
        });
        while directory.is_connect("slow").is_err() {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        assert!(directory.is_connect("nobody").unwrap_err().is_not_found());
        assert!(directory.is_connect("slow").unwrap());
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!binding.is_finished());
        binding.abort();
    }

    #[tokio::test]
    async fn test_close_twice_is_harmless() {
        let directory = Arc::new(SessionDirectory::new());
        let (agent, peer, session_id) = connect_agent(&directory).await;

        directory.close(&session_id).unwrap();
        while !directory.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(agent.is_closed());
        assert!(peer.is_closed());
        assert!(directory.close(&session_id).unwrap_err().is_not_found());
        agent.close();
        agent.destroy();
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn test_on_destroy_closes_everything() {
        let directory = Arc::new(SessionDirectory::new());
        let (_a, peer_a, _) = connect_agent(&directory).await;
        let (_b, peer_b, _) = connect_agent(&directory).await;

        directory.on_destroy();
        assert!(directory.is_empty());
        assert!(peer_a.is_closed());
        assert!(peer_b.is_closed());
    }

    #[tokio::test]
    async fn test_evict_and_heartbeat_reach_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let directory =
            SessionDirectory::new().with_storage(Arc::clone(&storage) as Arc<dyn SessionStorage>);
        let mut session = Session::new("tcp", "ip");
        session.set_user_id("u-1");
        storage.store("u-1", &session).await.unwrap();

        directory.heartbeat("u-1").await;
        directory.evict("u-1").await.unwrap();
        assert!(storage.query("u-1").await.unwrap().is_none());

        let recording = Arc::new(RecordingStorage::default());
        let directory = SessionDirectory::new()
            .with_storage(Arc::clone(&recording) as Arc<dyn SessionStorage>);
        directory.heartbeat("u-1").await;
        assert_eq!(recording.heartbeats.load(Ordering::SeqCst), 1);
    }
}

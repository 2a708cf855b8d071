//! Gateway composition root.
//!
//! A [`Gate`] owns the session directory and its bus, and runs the
//! configured listeners until told to stop.

use std::{future::Future, sync::Arc};

use gate_core::{Conn, GateConfig, GateError, Result, SessionLearner, SessionStorage};
use gate_session::{Agent, AgentLearner, DirectoryBus, Processor, SessionDirectory, SessionHandle};
use tokio::{
    net::TcpListener,
    sync::{Semaphore, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::tcp::{self, Framing};

/// Turns accepted connections into running agents.
#[derive(Clone)]
pub(crate) struct AgentSpawner {
    processor: Option<Arc<dyn Processor>>,
    directory: Arc<SessionDirectory>,
    server_id: String,
    new_agent: Option<mpsc::UnboundedSender<Arc<Agent>>>,
}

impl AgentSpawner {
    pub(crate) fn new(
        processor: Option<Arc<dyn Processor>>,
        directory: Arc<SessionDirectory>,
        server_id: impl Into<String>,
        new_agent: Option<mpsc::UnboundedSender<Arc<Agent>>>,
    ) -> Self {
        Self {
            processor,
            directory,
            server_id: server_id.into(),
            new_agent,
        }
    }

    /// Create the agent for `conn` and announce it.
    pub(crate) fn agent(&self, conn: Arc<dyn Conn>) -> Arc<Agent> {
        let agent = Agent::with_server_id(
            conn,
            self.processor.clone(),
            Arc::clone(&self.directory) as Arc<dyn AgentLearner>,
            self.server_id.clone(),
        );
        if let Some(new_agent) = &self.new_agent {
            if new_agent.send(Arc::clone(&agent)).is_err() {
                debug!("new agent receiver dropped");
            }
        }
        agent
    }

    /// Run `conn` as an agent until it closes.
    pub(crate) async fn run(&self, conn: Arc<dyn Conn>) {
        self.agent(conn).run().await;
    }
}

/// Builder for [`Gate`].
#[derive(Default)]
pub struct GateBuilder {
    config: GateConfig,
    processor: Option<Arc<dyn Processor>>,
    storage: Option<Arc<dyn SessionStorage>>,
    session_learner: Option<Arc<dyn SessionLearner>>,
    new_agent: Option<mpsc::UnboundedSender<Arc<Agent>>>,
}

impl GateBuilder {
    #[must_use]
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Codec and router for inbound messages. Without one, agents still
    /// realize sessions but drop every payload.
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn session_learner(mut self, learner: Arc<dyn SessionLearner>) -> Self {
        self.session_learner = Some(learner);
        self
    }

    /// Announce every new agent on `tx`, before its first message.
    #[must_use]
    pub fn new_agent_channel(mut self, tx: mpsc::UnboundedSender<Arc<Agent>>) -> Self {
        self.new_agent = Some(tx);
        self
    }

    /// Validate the config and start the directory bus.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Returns a config error if the configuration is invalid.
    pub fn build(self) -> Result<Gate> {
        self.config.validate()?;
        let framing = Framing::from_config(&self.config)?;

        let mut directory = SessionDirectory::new();
        if let Some(storage) = self.storage {
            directory = directory.with_storage(storage);
        }
        if let Some(learner) = self.session_learner {
            directory = directory.with_session_learner(learner);
        }
        let directory = Arc::new(directory);
        let (bus, bus_task) = DirectoryBus::spawn(Arc::clone(&directory));

        let spawner = AgentSpawner::new(
            self.processor,
            Arc::clone(&directory),
            self.config.server_id.clone(),
            self.new_agent,
        );

        Ok(Gate {
            config: self.config,
            framing,
            spawner,
            directory,
            bus,
            bus_task,
        })
    }
}

/// A gateway node.
pub struct Gate {
    config: GateConfig,
    framing: Framing,
    spawner: AgentSpawner,
    directory: Arc<SessionDirectory>,
    bus: DirectoryBus,
    bus_task: JoinHandle<()>,
}

impl Gate {
    #[must_use]
    pub fn builder() -> GateBuilder {
        GateBuilder::default()
    }

    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    #[must_use]
    pub const fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// A client handle for the directory bus.
    #[must_use]
    pub fn bus(&self) -> DirectoryBus {
        self.bus.clone()
    }

    /// Rebuild a remote-control handle from a serialized session.
    ///
    /// # Errors
    /// Returns a decode error if the image is unreadable.
    pub fn new_session(&self, data: &[u8]) -> Result<SessionHandle> {
        SessionHandle::from_bytes(self.bus(), data)
    }

    /// Run an in-process connection as an agent, outside any listener.
    pub fn attach(&self, conn: Arc<dyn Conn>) -> Arc<Agent> {
        let agent = self.spawner.agent(conn);
        tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.run().await }
        });
        agent
    }

    /// Serve the configured listeners until `shutdown` resolves.
    ///
    /// Stopping the listeners leaves accepted agents running; use
    /// [`Gate::on_destroy`] to close them.
    ///
    /// # Errors
    /// Returns a config error for an invalid or unsupported configuration,
    /// and a transport error if a listener cannot bind.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.config.validate()?;
        if self.config.tls_requested() {
            return Err(GateError::Config(
                "TLS is not terminated in-process; put a TLS proxy in front of ws_addr".to_string(),
            ));
        }

        let (stop, stop_rx) = watch::channel(false);
        let mut listeners = Vec::new();
        if !self.config.ws_addr.is_empty() {
            listeners.push(self.start_ws(stop_rx.clone()).await?);
        }
        if !self.config.tcp_addr.is_empty() {
            listeners.push(self.start_tcp(stop_rx).await?);
        }

        shutdown.await;
        stop.send_replace(true);
        for listener in listeners {
            if let Err(e) = listener.await {
                warn!(error = %e, "listener task failed");
            }
        }
        Ok(())
    }

    async fn start_tcp(&self, stop: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(&self.config.tcp_addr).await?;
        info!(addr = %listener.local_addr()?, "tcp listener started");

        Ok(tokio::spawn(tcp::serve(
            listener,
            self.framing,
            self.config.pending_write_num,
            Arc::new(Semaphore::new(self.config.max_conn_num)),
            self.spawner.clone(),
            stop,
        )))
    }

    #[cfg(feature = "websocket")]
    async fn start_ws(&self, stop: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        use crate::websocket::{self, WsState};

        let listener = TcpListener::bind(&self.config.ws_addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "websocket listener started");

        let state = WsState {
            spawner: self.spawner.clone(),
            slots: Arc::new(Semaphore::new(self.config.max_conn_num)),
            local,
            max_msg_len: usize::try_from(self.config.max_msg_len).unwrap_or(usize::MAX),
            pending_write_num: self.config.pending_write_num,
        };
        Ok(tokio::spawn(websocket::serve(
            listener,
            state,
            self.config.http_timeout(),
            stop,
        )))
    }

    #[cfg(not(feature = "websocket"))]
    #[allow(clippy::unused_async)]
    async fn start_ws(&self, _stop: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        Err(GateError::Config(
            "ws_addr is set but websocket support is not compiled in".to_string(),
        ))
    }

    /// Close every agent and stop the directory bus.
    pub fn on_destroy(&self) {
        self.directory.on_destroy();
        self.bus_task.abort();
        info!("gate destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use bytes::Bytes;
    use gate_core::Session;
    use gate_session::{MemoryConn, Message, storage::MemoryStorage};
    use serde::{Deserialize, Serialize};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::{JsonProcessor, Routed};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Login {
        user: String,
    }

    impl Message for Login {
        const ID: &'static str = "Login";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl Message for Echo {
        const ID: &'static str = "Echo";
    }

    fn envelope<M: Message + Serialize>(msg: &M) -> Bytes {
        let data = serde_json::to_string(msg).unwrap();
        Bytes::from(serde_json::to_vec(&serde_json::json!({ "cmd": M::ID, "data": data })).unwrap())
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_login_binds_through_bus_and_persists() {
        let (login_tx, mut logins) = mpsc::unbounded_channel::<Routed<Login>>();
        let mut processor = JsonProcessor::new();
        processor.register::<Login>().unwrap();
        processor.register::<Echo>().unwrap();
        processor.set_router::<Login>(login_tx).unwrap();
        processor
            .set_handler::<Echo, _>(|msg, agent| agent.write_msg(&msg))
            .unwrap();

        let storage = Arc::new(MemoryStorage::new());
        let config = GateConfig {
            server_id: "gate-1".to_string(),
            ..GateConfig::default()
        };
        let gate = Gate::builder()
            .config(config)
            .processor(Arc::new(processor))
            .storage(Arc::clone(&storage) as Arc<dyn SessionStorage>)
            .build()
            .unwrap();

        let (conn, mut peer) = MemoryConn::pair(addr(), addr());
        let agent = gate.attach(conn);

        peer.tx
            .send(envelope(&Login {
                user: "alice".to_string(),
            }))
            .unwrap();
        let Routed { msg, agent: routed } = logins.recv().await.unwrap();
        assert!(Arc::ptr_eq(&routed, &agent));

        let snapshot = routed.session_snapshot().await.unwrap();
        assert_eq!(snapshot.server_id(), "gate-1");
        let mut handle = gate.new_session(&snapshot.to_bytes().unwrap()).unwrap();
        handle.bind(&msg.user).await.unwrap();
        handle.set("room", "lobby").await.unwrap();

        let image = storage.query("alice").await.unwrap().unwrap();
        let stored = Session::from_bytes(&image).unwrap();
        assert_eq!(stored.get("room"), "lobby");
        assert_eq!(stored.user_id(), "alice");

        peer.tx
            .send(envelope(&Echo {
                text: "ping".to_string(),
            }))
            .unwrap();
        let reply = peer.rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply[0]).unwrap();
        assert_eq!(value["cmd"], "Echo");

        assert!(gate.bus().is_connect("", "alice").await.unwrap());
        gate.on_destroy();
        assert!(gate.directory().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_message_closes_agent() {
        let gate = Gate::builder()
            .processor(Arc::new(JsonProcessor::new()))
            .build()
            .unwrap();
        let (conn, peer) = MemoryConn::pair(addr(), addr());
        let agent = gate.attach(conn);

        peer.tx.send(Bytes::from_static(b"not json")).unwrap();
        while !agent.is_closed() {
            tokio::task::yield_now().await;
        }
        assert!(peer.is_closed());
        while !gate.directory().is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_new_agent_channel_announces_agents() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = Gate::builder().new_agent_channel(tx).build().unwrap();
        let (conn, _peer) = MemoryConn::pair(addr(), addr());
        let agent = gate.attach(conn);

        let announced = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&announced, &agent));
    }

    #[tokio::test]
    async fn test_run_rejects_tls() {
        let config = GateConfig {
            ws_addr: "127.0.0.1:0".to_string(),
            cert_file: "cert.pem".to_string(),
            key_file: "key.pem".to_string(),
            ..GateConfig::default()
        };
        let gate = Gate::builder().config(config).build().unwrap();
        let err = gate.run(std::future::ready(())).await.unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = GateConfig {
            len_msg_len: 3,
            ..GateConfig::default()
        };
        assert!(matches!(
            Gate::builder().config(config).build(),
            Err(GateError::Config(_))
        ));
    }

    async fn free_port() -> u16 {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_run_serves_tcp_until_shutdown() {
        let port = free_port().await;
        let config = GateConfig {
            tcp_addr: format!("127.0.0.1:{port}"),
            ..GateConfig::default()
        };
        let gate = Arc::new(Gate::builder().config(config).build().unwrap());
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                gate.run(async {
                    let _ = stopped.await;
                })
                .await
            }
        });

        let mut client = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(client) => break client,
                Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };
        client.write_all(b"\x00\x02hi").await.unwrap();
        while gate.directory().is_empty() {
            tokio::task::yield_now().await;
        }

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();

        // Accepted agents outlive the listener.
        assert_eq!(gate.directory().broadcast(&Bytes::from_static(b"ok")), 1);
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"\x00\x02ok");
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}

//! Per-connection session record.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GateError;

/// Session identifier.
pub type SessionId = String;

/// Session settings, the unit of persistence.
pub type Settings = HashMap<String, String>;

/// A live session guarded for single-writer mutation.
///
/// The lock is held for the whole mutate-then-persist sequence of one
/// directory operation.
pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

type GuestPredicate = Box<dyn Fn(&Session) -> bool + Send + Sync>;

static GUEST_PREDICATE: OnceLock<GuestPredicate> = OnceLock::new();

/// Install the process-wide guest predicate.
///
/// Must be called once at startup, before any traffic. The default rule
/// treats a session as a guest iff its user id is empty.
///
/// # Errors
/// Returns a config error if a predicate was already installed.
pub fn set_guest_predicate<F>(predicate: F) -> Result<(), GateError>
where
    F: Fn(&Session) -> bool + Send + Sync + 'static,
{
    GUEST_PREDICATE.set(Box::new(predicate)).map_err(|_| {
        tracing::warn!("guest predicate already set; keeping the first one");
        GateError::Config("guest predicate already set".to_string())
    })
}

/// Outcome of folding a persisted session image into a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The live session had no settings; the persisted settings were adopted.
    Adopted,
    /// Missing keys were filled in from the persisted settings.
    Merged,
}

/// Identity and settings of one client connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    session_id: SessionId,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    server_id: String,
    #[serde(default)]
    settings: Option<Settings>,
}

impl Session {
    /// Create a session with a fresh id and empty settings.
    #[must_use]
    pub fn new(network: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            session_id: Self::generate_id(),
            user_id: String::new(),
            ip: ip.into(),
            network: network.into(),
            server_id: String::new(),
            settings: Some(Settings::new()),
        }
    }

    /// Generate a globally unique session id.
    #[must_use]
    pub fn generate_id() -> SessionId {
        Uuid::new_v4().simple().to_string()
    }

    /// Reconstruct a session from its serialized image.
    ///
    /// # Errors
    /// Returns error if the bytes are not a valid session image.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Serialize this session.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn ip(&self) -> &str {
        &self.ip
    }

    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    #[must_use]
    pub const fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    /// Get a setting, or an empty string if absent.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.settings
            .as_ref()
            .and_then(|s| s.get(key))
            .map_or("", String::as_str)
    }

    pub fn set_session_id(&mut self, session_id: impl Into<SessionId>) {
        self.session_id = session_id.into();
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = user_id.into();
    }

    pub fn set_ip(&mut self, ip: impl Into<String>) {
        self.ip = ip.into();
    }

    pub fn set_network(&mut self, network: impl Into<String>) {
        self.network = network.into();
    }

    pub fn set_server_id(&mut self, server_id: impl Into<String>) {
        self.server_id = server_id.into();
    }

    /// Replace the settings wholesale.
    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = Some(settings);
    }

    /// Upsert one setting.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.settings
            .get_or_insert_with(Settings::new)
            .insert(key.into(), value.into());
    }

    /// Delete one setting. Absent keys are ignored.
    pub fn remove(&mut self, key: &str) {
        if let Some(settings) = self.settings.as_mut() {
            settings.remove(key);
        }
    }

    /// Whether a user id is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        !self.user_id.is_empty()
    }

    /// Whether this session is a guest, per the process-wide predicate.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        GUEST_PREDICATE
            .get()
            .map_or_else(|| self.user_id.is_empty(), |judge| judge(self))
    }

    /// Fold a persisted image into this session.
    ///
    /// Live values win; only keys missing here are taken from `persisted`.
    /// A session without any settings adopts the persisted ones wholesale.
    pub fn merge_persisted(&mut self, persisted: Self) -> MergeOutcome {
        let incoming = persisted.settings.unwrap_or_default();
        match self.settings.as_mut() {
            None => {
                self.settings = Some(incoming);
                MergeOutcome::Adopted
            }
            Some(live) => {
                for (key, value) in incoming {
                    live.entry(key).or_insert(value);
                }
                MergeOutcome::Merged
            }
        }
    }
}

//! Gateway listener and framing configuration.

use std::{fs, io::ErrorKind, path::Path, time::Duration};

use serde::Deserialize;

use crate::GateError;

/// Gateway configuration.
///
/// Either address may be empty to disable that transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Connection cap per transport.
    pub max_conn_num: usize,
    /// Outbound queue depth per connection before a slow client is dropped.
    pub pending_write_num: usize,
    /// Frame size ceiling in bytes.
    pub max_msg_len: u32,

    /// WebSocket listen address.
    pub ws_addr: String,
    /// WebSocket handshake timeout, in seconds.
    pub http_timeout: u64,
    pub cert_file: String,
    pub key_file: String,

    /// TCP listen address.
    pub tcp_addr: String,
    /// Width of the TCP length prefix: 1, 2 or 4 bytes.
    pub len_msg_len: usize,
    /// Byte order of the TCP length prefix.
    pub little_endian: bool,

    /// Identity of this gateway node, stamped on every session it creates.
    pub server_id: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_conn_num: 20_000,
            pending_write_num: 2_000,
            max_msg_len: 4_096,
            ws_addr: String::new(),
            http_timeout: 10,
            cert_file: String::new(),
            key_file: String::new(),
            tcp_addr: String::new(),
            len_msg_len: 2,
            little_endian: false,
            server_id: String::new(),
        }
    }
}

impl GateConfig {
    /// Load a TOML config file. A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns a config error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(GateError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        let config = Self::from_toml(&contents)?;
        tracing::debug!(path = %path.display(), "loaded gateway config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns a config error if parsing or validation fails.
    pub fn from_toml(contents: &str) -> Result<Self, GateError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check option consistency.
    ///
    /// # Errors
    /// Returns a config error describing the first bad option.
    pub fn validate(&self) -> Result<(), GateError> {
        let prefix_max = match self.len_msg_len {
            1 => u32::from(u8::MAX),
            2 => u32::from(u16::MAX),
            4 => u32::MAX,
            n => return Err(GateError::Config(format!("len_msg_len must be 1, 2 or 4, got {n}"))),
        };
        if self.max_msg_len > prefix_max {
            return Err(GateError::Config(format!(
                "max_msg_len {} does not fit a {}-byte length prefix",
                self.max_msg_len, self.len_msg_len
            )));
        }
        if self.pending_write_num == 0 {
            return Err(GateError::Config("pending_write_num must be positive".to_string()));
        }
        if self.cert_file.is_empty() != self.key_file.is_empty() {
            return Err(GateError::Config(
                "cert_file and key_file must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// WebSocket handshake timeout.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    /// Whether TLS was requested for the WebSocket listener.
    #[must_use]
    pub fn tls_requested(&self) -> bool {
        !self.cert_file.is_empty()
    }
}

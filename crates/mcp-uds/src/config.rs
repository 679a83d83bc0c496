//! Transport configuration and builder.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, Map};
use mcp_uds_protocol::MAX_MESSAGE_SIZE;
use mcp_uds_transport_traits::{TransportError, TransportResult};
use serde::Deserialize;

use crate::client::UnixClientTransport;
use crate::server::UnixServerTransportProvider;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "MCP_UDS";
/// Environment variable overriding [`UnixConfig::socket_path`].
pub const ENV_SOCKET_PATH: &str = "MCP_UDS_SOCKET_PATH";
/// Environment variable overriding [`UnixConfig::buffer_size`].
pub const ENV_BUFFER_SIZE: &str = "MCP_UDS_BUFFER_SIZE";
/// Environment variable overriding [`UnixConfig::restart_on_disconnect`].
pub const ENV_RESTART: &str = "MCP_UDS_RESTART";

/// Default read buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default time a closing generation gives an in-flight write to finish.
pub const DEFAULT_CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Values `MCP_UDS_*` variables may override, keyed by the name after the prefix.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    socket_path: Option<PathBuf>,
    buffer_size: Option<usize>,
    restart: Option<bool>,
}

/// Unix socket transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixConfig {
    /// Socket file path
    pub socket_path: PathBuf,
    /// File permissions applied to the socket after binding (server only)
    pub permissions: Option<u32>,
    /// Initial read buffer capacity
    pub buffer_size: usize,
    /// Longest accepted line, in bytes
    pub max_message_size: usize,
    /// Start a new generation after an unexpected disconnect (server only)
    pub restart_on_disconnect: bool,
    /// How long a closing generation waits for an in-flight write
    pub close_grace_period: Duration,
    /// Remove the socket file on final shutdown (server only)
    pub cleanup_on_close: bool,
}

impl Default for UnixConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/mcp-uds.sock"),
            permissions: Some(0o600), // Owner read/write only
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            restart_on_disconnect: true,
            close_grace_period: DEFAULT_CLOSE_GRACE_PERIOD,
            cleanup_on_close: true,
        }
    }
}

impl UnixConfig {
    /// Defaults overlaid with the `MCP_UDS_*` environment variables.
    pub fn from_env() -> TransportResult<Self> {
        Self::default().with_env()
    }

    /// Overlay the `MCP_UDS_*` environment variables onto this configuration.
    pub fn with_env(self) -> TransportResult<Self> {
        self.with_env_source(None)
    }

    /// Overlay variables read from `source`, or from the process environment when `None`.
    fn with_env_source(mut self, source: Option<Map<String, String>>) -> TransportResult<Self> {
        let overrides: EnvOverrides = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(source),
            )
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| TransportError::ConfigurationError(format!("{ENV_PREFIX}_*: {e}")))?;

        if let Some(path) = overrides.socket_path.filter(|p| !p.as_os_str().is_empty()) {
            self.socket_path = path;
        }
        if let Some(size) = overrides.buffer_size {
            self.buffer_size = size;
        }
        if let Some(restart) = overrides.restart {
            self.restart_on_disconnect = restart;
        }
        Ok(self)
    }

    /// Check the values a transport cannot work without.
    pub fn validate(&self) -> TransportResult<()> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(TransportError::ConfigurationError(
                "socket path must not be empty".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(TransportError::ConfigurationError(
                "buffer size must be greater than zero".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::ConfigurationError(
                "max message size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Unix socket transport builder
#[derive(Debug, Clone)]
pub struct UnixTransportBuilder {
    config: UnixConfig,
}

impl UnixTransportBuilder {
    /// Create a builder for a server provider. Restart on disconnect is on.
    #[must_use]
    pub fn new_server() -> Self {
        Self {
            config: UnixConfig::default(),
        }
    }

    /// Create a builder for a client transport. Clients never restart.
    #[must_use]
    pub fn new_client() -> Self {
        Self {
            config: UnixConfig {
                restart_on_disconnect: false,
                ..UnixConfig::default()
            },
        }
    }

    /// Start from an existing configuration
    #[must_use]
    pub fn from_config(config: UnixConfig) -> Self {
        Self { config }
    }

    /// Set socket path
    pub fn socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.socket_path = path.into();
        self
    }

    /// Set file permissions
    #[must_use]
    pub const fn permissions(mut self, permissions: u32) -> Self {
        self.config.permissions = Some(permissions);
        self
    }

    /// Leave socket file permissions to the process umask
    #[must_use]
    pub const fn default_permissions(mut self) -> Self {
        self.config.permissions = None;
        self
    }

    /// Set buffer size
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the longest accepted line
    #[must_use]
    pub const fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Enable or disable restart after an unexpected disconnect
    #[must_use]
    pub const fn restart_on_disconnect(mut self, enabled: bool) -> Self {
        self.config.restart_on_disconnect = enabled;
        self
    }

    /// Set the grace period given to in-flight writes while closing
    #[must_use]
    pub const fn close_grace_period(mut self, grace: Duration) -> Self {
        self.config.close_grace_period = grace;
        self
    }

    /// Enable or disable socket cleanup on close
    #[must_use]
    pub const fn cleanup_on_close(mut self, enabled: bool) -> Self {
        self.config.cleanup_on_close = enabled;
        self
    }

    /// Overlay the `MCP_UDS_*` environment variables
    pub fn with_env(mut self) -> TransportResult<Self> {
        self.config = self.config.with_env()?;
        Ok(self)
    }

    /// The configuration built so far
    pub fn config(&self) -> &UnixConfig {
        &self.config
    }

    /// Build the server provider. The socket is not bound until session logic is attached.
    pub fn build_server(self) -> TransportResult<UnixServerTransportProvider> {
        UnixServerTransportProvider::new(self.config)
    }

    /// Build the client transport
    pub fn build_client(self) -> TransportResult<UnixClientTransport> {
        UnixClientTransport::new(self.config)
    }
}

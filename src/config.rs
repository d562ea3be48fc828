//! Connection configuration and builder.
//!
//! # Example
//!
//! ```no_run
//! use xwire_client::{AuthInfo, ConnectionBuilder};
//!
//! let (conn, screen) = ConnectionBuilder::new()
//!     .auth(AuthInfo::new("MIT-MAGIC-COOKIE-1", vec![0u8; 16]))
//!     .output_buffer_size(64 * 1024)
//!     .connect(Some(":1"))?;
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::{Result, XwireError};
use crate::input::DEFAULT_READ_CHUNK_SIZE;
use crate::output::DEFAULT_OUTPUT_BUFFER_SIZE;
use crate::transport::{open_display, resolve_display, Stream};

pub use crate::protocol::AuthInfo;

/// Buffer sizing for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bytes of requests staged before a write is forced.
    pub output_buffer_size: usize,
    /// Bytes asked for per socket read.
    pub read_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.output_buffer_size == 0 || self.read_chunk_size == 0 {
            return Err(XwireError::Protocol(
                "buffer sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionBuilder {
    auth: Option<AuthInfo>,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorization sent in the setup request.
    pub fn auth(mut self, auth: AuthInfo) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn output_buffer_size(mut self, size: usize) -> Self {
        self.config.output_buffer_size = size;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    /// Replace all buffer settings at once.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the display (or `$DISPLAY`) and perform the handshake.
    ///
    /// Returns the connection and the screen named in the display string.
    pub fn connect(self, display: Option<&str>) -> Result<(Connection, u32)> {
        let name = resolve_display(display)?;
        tracing::debug!(
            "Opening display {:?}:{}.{}",
            name.host,
            name.display,
            name.screen
        );
        let stream = open_display(&name)?;
        let conn = self.connect_to_stream(stream)?;
        Ok((conn, name.screen))
    }

    /// Perform the handshake over an already connected stream.
    pub fn connect_to_stream(self, stream: Stream) -> Result<Connection> {
        self.config.validate()?;
        Connection::establish(stream, self.auth.as_ref(), &self.config)
    }
}

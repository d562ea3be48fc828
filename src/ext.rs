//! Extension registry and per-connection QueryExtension cache.
//!
//! Every [`Extension`] gets a process-wide id the first time it is used.
//! Connections cache the server's QueryExtension answer under that id, so
//! the query is sent at most once per extension and connection.
//!
//! # Example
//!
//! ```no_run
//! use xwire_client::{Connection, Extension};
//!
//! static SHAPE: Extension = Extension::new("SHAPE");
//!
//! let (conn, _) = Connection::connect(None)?;
//! conn.prefetch_extension_data(&SHAPE)?;
//! // ... other setup ...
//! if let Some(data) = conn.extension_data(&SHAPE)? {
//!     println!("SHAPE present: {}", data.present);
//! }
//! # Ok::<(), xwire_client::XwireError>(())
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{flags, requests, Response};

pub use crate::protocol::QueryExtensionReply;

/// Next process-wide extension id. 0 is never handed out.
static NEXT_EXTENSION_ID: AtomicU32 = AtomicU32::new(1);

/// BIG-REQUESTS, used for extended request lengths.
pub static BIG_REQUESTS: Extension = Extension::new("BIG-REQUESTS");

/// XC-MISC, used to refill the resource id range.
pub static XC_MISC: Extension = Extension::new("XC-MISC");

/// GLX, whose GetFBConfigs replies carry a miscounted length.
pub static GLX: Extension = Extension::new("GLX");

/// A protocol extension, identified by the name the server knows it by.
///
/// Meant to live in a `static`.
#[derive(Debug)]
pub struct Extension {
    name: &'static str,
    id: OnceLock<u32>,
}

impl Extension {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            id: OnceLock::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Process-wide id, assigned on first use.
    pub(crate) fn id(&self) -> u32 {
        *self
            .id
            .get_or_init(|| NEXT_EXTENSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cache entry: a query in flight, or its outcome.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LazyReply {
    Pending(u32),
    Resolved(Option<QueryExtensionReply>),
}

pub(crate) type ExtensionCache = Mutex<HashMap<u32, LazyReply>>;

impl Connection {
    /// The server's QueryExtension answer for `extension`.
    ///
    /// Blocks on first use. `None` means the query itself failed; check
    /// `present` for whether the server has the extension.
    pub fn extension_data(&self, extension: &Extension) -> Result<Option<QueryExtensionReply>> {
        let mut cache = self.extensions.lock();
        let entry = match cache.get(&extension.id()) {
            Some(entry) => *entry,
            None => {
                let request = self.send_query_extension(extension)?;
                LazyReply::Pending(request)
            }
        };

        let data = match entry {
            LazyReply::Resolved(data) => return Ok(data),
            LazyReply::Pending(request) => match self.wait_for_reply(request)? {
                Some(Response::Reply(reply)) => QueryExtensionReply::parse(&reply).ok(),
                _ => None,
            },
        };
        tracing::debug!(
            "Extension {}: {:?}",
            extension.name(),
            data.map(|d| (d.present, d.major_opcode))
        );
        cache.insert(extension.id(), LazyReply::Resolved(data));
        Ok(data)
    }

    /// Send the QueryExtension for `extension` without waiting for it.
    pub fn prefetch_extension_data(&self, extension: &Extension) -> Result<()> {
        let mut cache = self.extensions.lock();
        if !cache.contains_key(&extension.id()) {
            let request = self.send_query_extension(extension)?;
            cache.insert(extension.id(), LazyReply::Pending(request));
        }
        Ok(())
    }

    fn send_query_extension(&self, extension: &Extension) -> Result<u32> {
        let name = extension.name();
        let (mut fixed, info) = requests::query_extension(name)?;
        requests::frame_short(&mut fixed, info.opcode, 0, &[name.as_bytes()])?;
        let request = self.send_request(flags::RAW, &info, &mut fixed, &[name.as_bytes()])?;
        tracing::debug!("QueryExtension {} sent as request {}", name, request);
        Ok(request)
    }
}

//! Cache timeout policy and top-level mount configuration.

use std::time::Duration;

/// How long the kernel may cache entry lookups and attributes before revalidating them.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// TTL applied to successful `LOOKUP`/`MKNOD`/`MKDIR`/`CREATE`/`SYMLINK`/`LINK` replies.
    pub entry_timeout: Duration,
    /// TTL applied to `GETATTR`/`SETATTR` attribute replies.
    pub attr_timeout: Duration,
    /// TTL applied to negative `LOOKUP` replies (ENOENT). `None` disables negative caching,
    /// forcing the kernel to re-query on every lookup of a name known not to exist.
    pub negative_entry_timeout: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            negative_entry_timeout: None,
        }
    }
}

/// Aggregate configuration handed to [`crate::bridge::Bridge::new`].
pub struct MountConfig {
    pub timeouts: Timeouts,
    /// First inode number assigned to a node the handler allocates without specifying one
    /// itself (the root is always `1`, regardless of this value).
    pub first_auto_ino: u64,
    /// Emit a trace-level log line for every dispatched request. Off by default: the
    /// teacher's own session loop always traces, but tracing every request by default
    /// is too noisy for a library embedded in someone else's service.
    pub debug: bool,
    /// Invoked once, right after `INIT`, before the first request a kernel worker can send
    /// is dispatched, so a handler can pre-populate persistent nodes under the root via
    /// [`crate::bridge::Bridge::attach`].
    pub on_add: Option<Box<dyn FnOnce(&crate::bridge::Bridge) + Send>>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            first_auto_ino: 2,
            debug: false,
            on_add: None,
        }
    }
}

impl std::fmt::Debug for MountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountConfig")
            .field("timeouts", &self.timeouts)
            .field("first_auto_ino", &self.first_auto_ino)
            .field("debug", &self.debug)
            .field("on_add", &self.on_add.is_some())
            .finish()
    }
}

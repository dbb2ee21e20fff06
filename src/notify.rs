//! User-visible warnings.
//!
//! The editor decides how to show them; the daemon binary just logs.

pub trait Notifier: Send + Sync {
    fn warn(&self, message: &str);
}

/// Reports warnings through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
    }
}

//! Test utilities shared across crate-level unit tests.

pub mod backends;
pub mod http;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use backends::{identity, FakeCheckinBackend, FakeRegistrationBackend, NotificationLog};
pub use http::try_start_server;

/// Unique, not yet existing directory under the system temp dir.
pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    path
}

//! Development helper: initialize a tracing subscriber when `RUST_LOG` is
//! set.
//!
//! Nearly everything interesting in manifold happens off the test thread,
//! on the manager's role-named threads (`{name}:Write`, `{name}:WriteHelper`,
//! `{name}:Read`, `{name}:Connect`), so the subscriber prints thread names
//! instead of event targets.

/// Install an env-filtered fmt subscriber, best effort.
///
/// No-op when `RUST_LOG` is unset or a global subscriber is already
/// installed.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .with_target(false)
            .try_init();
    }
}

//! Helpers for timing-sensitive tests.

use std::sync::Once;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Whether the tests run under CI, where schedulers are noisier.
pub fn is_ci_environment() -> bool {
    std::env::var_os("CI").is_some() || std::env::var_os("GITHUB_ACTIONS").is_some()
}

/// Scale a generous upper bound for CI machines.
///
/// Not for bounds the code under test promises; those stay exact.
pub fn ci_timeout(base: Duration) -> Duration {
    if is_ci_environment() { base * 3 } else { base }
}

/// Poll `condition` every 5 ms until it holds or `timeout` passes.
///
/// Returns whether the condition held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_timeout_never_shrinks() {
        let base = Duration::from_secs(2);
        assert!(ci_timeout(base) >= base);
    }

    #[tokio::test]
    async fn test_wait_until() {
        let start = Instant::now();
        assert!(wait_until(Duration::from_millis(100), || true).await);
        assert!(!wait_until(Duration::from_millis(20), || false).await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}

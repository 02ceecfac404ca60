use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::sync::Mutex;

/// Shared retry pacing for store operations. Both periodic tasks call the
/// manager concurrently, so the strategy sits behind a mutex; the manager
/// resets it at the end of every call regardless of outcome.
#[derive(Clone)]
pub struct Retry(Arc<Mutex<dyn Backoff + Send + Sync>>);

impl Retry {
    pub fn new(strategy: impl Backoff + Send + Sync + 'static) -> Retry {
        Retry(Arc::new(Mutex::new(strategy)))
    }

    /// The next interval to sleep before retrying, or `None` when the
    /// strategy is exhausted.
    pub async fn next_delay(&self) -> Option<Duration> {
        self.0.lock().await.next_backoff()
    }

    pub async fn reset(&self) {
        self.0.lock().await.reset()
    }
}

impl Default for Retry {
    fn default() -> Retry {
        Retry::new(ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            // Retry budgets are per-operation call caps, not elapsed time.
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        })
    }
}

#[cfg(test)]
pub(crate) fn immediate() -> Retry {
    Retry::new(ExponentialBackoff {
        initial_interval: Duration::ZERO,
        max_interval: Duration::ZERO,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    })
}

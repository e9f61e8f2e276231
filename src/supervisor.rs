//! Restart wrapper for the periodic loops
//!
//! A loop that panics is logged and started again after a back-off. A loop
//! that returns normally (shutdown) is not restarted.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    backoff: Duration,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts = 0u32;
        loop {
            match tokio::spawn(factory()).await {
                Ok(()) => {
                    debug!("{name} loop stopped");
                    break;
                }
                Err(e) if e.is_panic() => {
                    restarts += 1;
                    error!("{name} loop panicked (restart #{restarts}): {e}");
                }
                Err(e) => {
                    debug!("{name} loop cancelled: {e}");
                    break;
                }
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}

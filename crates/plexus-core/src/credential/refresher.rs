//! Background token refresher: one cooperatively-cancellable task on a
//! fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::CredentialPool;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const MAX_IN_FLIGHT: usize = 4;

pub struct RefresherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Stop the refresher and wait for the in-flight cycle to drain.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

pub fn spawn_refresher(pool: Arc<CredentialPool>, interval: Duration) -> RefresherHandle {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    pool.refresh_due(MAX_IN_FLIGHT).await;
                }
            }
        }
        info!(event = "refresher_stopped");
    });
    RefresherHandle { stop, task }
}

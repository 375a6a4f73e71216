use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::Result;

/// Spawns a long-running task. An error it returns ends up in the log only.
pub(crate) fn spawn_task<Fut>(
    name: &'static str,
    task: Fut,
    handles: &mut Vec<JoinHandle<()>>,
) where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("task {name} finished"),
            Err(e) => error!("spawned task: {name} stopped or encountered an error: {:?}", e),
        }
    });
    handles.push(handle);
}

/// Waits for `handles` to finish within `grace`; stragglers are aborted.
/// Returns whether every task finished on its own.
pub(crate) async fn drain_tasks(
    handles: Vec<JoinHandle<()>>,
    grace: Duration,
) -> bool {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    match timeout(grace, join_all(handles)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    warn!("background task ended abnormally: {}", e);
                }
            }
            true
        }
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "background tasks did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }
}

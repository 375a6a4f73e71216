//! Long-lived watch over the service namespace.
//!
//! Event batches are handed to a [`WatchEventHandler`] in arrival order. The
//! manager remembers the highest revision seen, starting with the revision
//! acknowledged when the watch was created, and reopens a lost stream right
//! after it, so a disconnect replays what was missed. Handlers must therefore
//! tolerate duplicates.


use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::prefix_range_end;
use crate::BackoffPolicy;
use crate::Error;
use crate::RemoteError;
use crate::RemoteStore;
use crate::Result;
use crate::WatchEvent;
use crate::WatchStream;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WatchEventHandler: Send + Sync + 'static {
    /// Applies one batch. Must be idempotent.
    async fn handle_events(
        &self,
        events: Vec<WatchEvent>,
    );
}

pub struct WatchManager<R: RemoteStore> {
    remote: Arc<R>,
    prefix: Vec<u8>,
    handler: Arc<dyn WatchEventHandler>,
    retry: BackoffPolicy,
    /// Signalled when history was compacted away and events may be lost
    resync: Arc<Notify>,
}

impl<R: RemoteStore> WatchManager<R> {
    pub fn new(
        remote: Arc<R>,
        prefix: Vec<u8>,
        handler: Arc<dyn WatchEventHandler>,
        retry: BackoffPolicy,
        resync: Arc<Notify>,
    ) -> Self {
        Self {
            remote,
            prefix,
            handler,
            retry,
            resync,
        }
    }

    /// Watches until `shutdown` is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let range_end = prefix_range_end(&self.prefix);
        // 0 watches from the current revision
        let mut next_revision = 0i64;
        let mut failures = 0u32;

        loop {
            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                opened = self.remote.open_watch(self.prefix.clone(), range_end.clone(), next_revision) => opened,
            };

            let outcome = match opened {
                Ok(mut stream) => {
                    info!(
                        prefix = %String::from_utf8_lossy(&self.prefix),
                        start_revision = next_revision,
                        "Watch opened"
                    );
                    failures = 0;
                    self.consume(&mut stream, &mut next_revision, &shutdown).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => break,
                Err(Error::Remote(RemoteError::WatchCanceled {
                    reason,
                    compact_revision,
                })) => {
                    warn!(compact_revision, "Watch canceled ({}), resuming from now", reason);
                    next_revision = 0;
                    self.resync.notify_one();
                }
                Err(e) if e.is_unavailable() => {
                    warn!("Watch interrupted: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.remote.channel_ready() => {}
                    }
                }
                Err(e) => {
                    warn!(attempt = failures, "Watch failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.retry.delay(failures)) => {}
                    }
                    failures = failures.saturating_add(1);
                }
            }
        }

        debug!("watch loop stopped");
        Ok(())
    }

    /// Delivers batches until shutdown (`Ok`) or until the stream fails.
    async fn consume(
        &self,
        stream: &mut WatchStream,
        next_revision: &mut i64,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                item = stream.next() => item,
            };

            let batch = match item {
                Some(batch) => batch?,
                None => return Err(RemoteError::StreamClosed("watch").into()),
            };
            // the creation ack pins where a watch opened "from now" started
            *next_revision = (*next_revision).max(batch.next_revision());
            if batch.events.is_empty() {
                continue;
            }
            debug!(count = batch.events.len(), revision = batch.revision, "watch batch");
            self.handler.handle_events(batch.events).await;
        }
    }
}

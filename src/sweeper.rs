use crate::records::MetadataStore;
use crate::storage::ArtifactStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodic bulk deletion of stored artifacts. The sweep cascades: blobs and
/// their ImageRecord rows go together, so listing and editing never see a
/// reference to an artifact that no longer exists.
///
/// Low priority by construction: it shares nothing with the request path
/// except the stores themselves, and its failures are logged, never surfaced
/// to users.
pub struct RetentionSweeper {
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl RetentionSweeper {
    pub fn new(
        interval: Duration,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            artifacts,
            metadata,
            interval,
            in_flight: Mutex::new(()),
        }
    }

    /// Start the background task. The first sweep happens one full interval
    /// (plus up to a minute of jitter) after startup, not immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let jitter = Duration::from_secs(rand::rng().random_range(0..60));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval + jitter, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One full sweep. Overlapping triggers are skipped, never queued.
    pub async fn sweep_once(&self) {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("sweep already in progress, skipping this trigger");
            return;
        };

        let keys = match self.artifacts.list().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("sweep could not list artifacts: {e}");
                return;
            }
        };

        let mut deleted = 0u64;
        let mut failed = 0u64;
        for key in keys {
            match self.artifacts.delete(&key).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    failed += 1;
                    warn!("sweep could not delete artifact {key}: {e}");
                }
            }
        }

        // Cascade: drop the metadata rows in the same pass so nothing keeps
        // pointing at deleted blobs.
        if let Err(e) = self.metadata.clear().await {
            warn!("sweep could not clear image records: {e}");
        }

        info!(deleted, failed, "artifact retention sweep complete");
    }
}

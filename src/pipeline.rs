use crate::config::Config;
use crate::cooldown::{CooldownGate, CooldownStamp};
use crate::error::{Error, ErrorDetails, ProviderErrorKind, QuotaScope};
use crate::ledger::{CounterStore, QuotaLedger};
use crate::provider::ImageProvider;
use crate::records::{
    prompt_excerpt, ImageRecord, InsertOutcome, MetadataStore, SequenceAllocator,
    MAX_SEQUENCE_ATTEMPTS,
};
use crate::storage::{artifact_key, ArtifactStore};
use bytes::Bytes;
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Successful terminal state of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub sequence: u64,
    pub bytes: Bytes,
}

/// One entry of a user's artifact listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSummary {
    pub sequence: u64,
    pub prompt_excerpt: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user usage snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStats {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub total_generated: u64,
}

/// Whole-system snapshot for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub total_images: u64,
    pub total_users: u64,
    pub images_today: u64,
}

/// Orchestrates one request end to end:
/// admission (cooldown, then daily quota, then global quota), the remote
/// generation call under a timeout, blob-then-metadata storage with
/// compensation on partial failure, and counter accounting strictly after
/// storage succeeds.
pub struct RequestPipeline {
    cooldown: CooldownGate,
    ledger: QuotaLedger,
    allocator: SequenceAllocator,
    metadata: Arc<dyn MetadataStore>,
    artifacts: Arc<dyn ArtifactStore>,
    provider: Arc<dyn ImageProvider>,
    daily_limit: u64,
    global_monthly_limit: u64,
    prompt_excerpt_len: usize,
    provider_timeout: Duration,
    refund_on_failure: bool,
}

impl RequestPipeline {
    pub fn new(
        config: &Config,
        provider: Arc<dyn ImageProvider>,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            cooldown: CooldownGate::new(config.cooldown_window()),
            ledger: QuotaLedger::new(counters),
            allocator: SequenceAllocator::new(Arc::clone(&metadata)),
            metadata,
            artifacts,
            provider,
            daily_limit: config.daily_limit,
            global_monthly_limit: config.global_monthly_limit,
            prompt_excerpt_len: config.prompt_excerpt_len,
            provider_timeout: config.provider_timeout(),
            refund_on_failure: config.refund_cooldown_on_failure,
        }
    }

    /// Generate a new image for `user` from `prompt`.
    #[tracing::instrument(skip(self, prompt), fields(request_id = %Uuid::now_v7()))]
    pub async fn generate(&self, user: &str, prompt: &str) -> Result<Delivered, Error> {
        let stamp = self.admit(user).await?;
        let result = async {
            let bytes = self
                .bounded_provider_call(self.provider.generate(prompt))
                .await?;
            self.store_and_deliver(user, prompt, bytes).await
        }
        .await;
        self.settle(user, stamp, result)
    }

    /// Generate a new image derived from the artifact `user` previously
    /// stored under `sequence`.
    #[tracing::instrument(skip(self, prompt), fields(request_id = %Uuid::now_v7()))]
    pub async fn edit(&self, user: &str, sequence: u64, prompt: &str) -> Result<Delivered, Error> {
        let stamp = self.admit(user).await?;
        let result = async {
            // Resolve the target before any remote call.
            let source = self.metadata.get(user, sequence).await?.ok_or_else(|| {
                Error::new(ErrorDetails::ImageNotFound {
                    user: user.to_string(),
                    sequence,
                })
            })?;
            let source_bytes = self.artifacts.get(&source.storage_key).await?;
            let bytes = self
                .bounded_provider_call(self.provider.edit(&source_bytes, prompt))
                .await?;
            self.store_and_deliver(user, prompt, bytes).await
        }
        .await;
        self.settle(user, stamp, result)
    }

    /// All of `user`'s stored artifacts, ordered by sequence ascending.
    pub async fn list(&self, user: &str) -> Result<Vec<ImageSummary>, Error> {
        let rows = self.metadata.list(user).await?;
        Ok(rows
            .into_iter()
            .map(|r| ImageSummary {
                sequence: r.sequence,
                prompt_excerpt: r.prompt_excerpt,
                created_at: r.created_at,
            })
            .collect())
    }

    /// Usage snapshot for one user. Read-only: no admission, no counters.
    pub async fn stats(&self, user: &str) -> Result<UserStats, Error> {
        Ok(UserStats {
            daily_used: self.ledger.daily_count(user).await?,
            daily_limit: self.daily_limit,
            total_generated: self.ledger.total_count(user).await?,
        })
    }

    /// Whole-system snapshot. Read-only.
    pub async fn overview(&self) -> Result<Overview, Error> {
        let start_of_today = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        Ok(Overview {
            total_images: self.metadata.count_all().await?,
            total_users: self.metadata.count_users().await?,
            images_today: self.metadata.count_since(start_of_today).await?,
        })
    }

    /// Admission gate: cooldown, then daily quota, then global quota. The
    /// first failing check names the rejection and nothing is mutated. Only
    /// a fully admitted request consumes its cooldown, and it does so before
    /// the remote call so an in-flight burst is throttled too.
    async fn admit(&self, user: &str) -> Result<CooldownStamp, Error> {
        if let Some(remaining) = self.cooldown.check(user) {
            return Err(Error::new(ErrorDetails::RejectedByCooldown { remaining }));
        }
        // A ledger failure propagates here and the request fails closed.
        let daily = self.ledger.daily_count(user).await?;
        if daily >= self.daily_limit {
            return Err(Error::new(ErrorDetails::RejectedByQuota {
                scope: QuotaScope::Daily,
                used: daily,
                limit: self.daily_limit,
            }));
        }
        let global = self.ledger.global_count().await?;
        if global >= self.global_monthly_limit {
            return Err(Error::new(ErrorDetails::RejectedByQuota {
                scope: QuotaScope::Global,
                used: global,
                limit: self.global_monthly_limit,
            }));
        }
        Ok(self.cooldown.record(user))
    }

    fn settle(
        &self,
        user: &str,
        stamp: CooldownStamp,
        result: Result<Delivered, Error>,
    ) -> Result<Delivered, Error> {
        if result.is_err() && self.refund_on_failure {
            self.cooldown.refund(user, stamp);
            debug!(user, "cooldown refunded after post-admission failure");
        }
        result
    }

    /// Remote call bounded by the configured timeout; expiry is treated
    /// exactly like a transient provider failure.
    async fn bounded_provider_call<F>(&self, call: F) -> Result<Bytes, Error>
    where
        F: Future<Output = Result<Bytes, Error>>,
    {
        match timeout(self.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::Provider {
                message: format!(
                    "Call exceeded the {}s provider timeout",
                    self.provider_timeout.as_secs()
                ),
                status_code: None,
                kind: ProviderErrorKind::Transient,
            })),
        }
    }

    /// STORING and ACCOUNTED run inside a spawned task that the caller
    /// awaits: if the caller disconnects, the work still completes, so an
    /// incremented counter always corresponds to a stored artifact.
    async fn store_and_deliver(
        &self,
        user: &str,
        prompt: &str,
        bytes: Bytes,
    ) -> Result<Delivered, Error> {
        let task = tokio::spawn(store_and_account(
            self.allocator.clone(),
            Arc::clone(&self.artifacts),
            self.ledger.clone(),
            self.prompt_excerpt_len,
            user.to_string(),
            prompt.to_string(),
            bytes,
        ));
        match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::new(ErrorDetails::Internal {
                message: format!("storage task failed: {e}"),
            })),
        }
    }
}

/// Blob first, then the metadata row referencing it. A lost race on the
/// sequence number deletes the just-written blob and retries with the next
/// candidate; a metadata failure deletes the blob and gives up. Counters are
/// only touched once both writes stand.
async fn store_and_account(
    allocator: SequenceAllocator,
    artifacts: Arc<dyn ArtifactStore>,
    ledger: QuotaLedger,
    excerpt_len: usize,
    user: String,
    prompt: String,
    bytes: Bytes,
) -> Result<Delivered, Error> {
    let created_at = Utc::now();
    let excerpt = prompt_excerpt(&prompt, excerpt_len);

    for _ in 0..MAX_SEQUENCE_ATTEMPTS {
        let sequence = allocator.next_candidate(&user).await?;
        let key = artifact_key(&user, sequence, created_at);

        artifacts.put(&key, bytes.clone()).await?;

        let record = ImageRecord {
            user: user.clone(),
            sequence,
            storage_key: key.clone(),
            prompt_excerpt: excerpt.clone(),
            created_at,
        };
        match allocator.commit(record).await {
            Ok(InsertOutcome::Inserted) => {
                if let Err(e) = account(&ledger, &user).await {
                    error!(
                        user,
                        sequence, "artifact stored but usage counters were not updated: {e}"
                    );
                    return Err(e);
                }
                return Ok(Delivered { sequence, bytes });
            }
            Ok(InsertOutcome::DuplicateSequence) => {
                best_effort_delete(artifacts.as_ref(), &key).await;
            }
            Err(e) => {
                best_effort_delete(artifacts.as_ref(), &key).await;
                return Err(e);
            }
        }
    }

    Err(Error::new(ErrorDetails::Metadata {
        message: format!(
            "gave up allocating a sequence number for {user} after {MAX_SEQUENCE_ATTEMPTS} conflicts"
        ),
    }))
}

async fn account(ledger: &QuotaLedger, user: &str) -> Result<(), Error> {
    ledger.increment_daily(user).await?;
    ledger.increment_global().await?;
    ledger.increment_total(user).await?;
    Ok(())
}

async fn best_effort_delete(artifacts: &dyn ArtifactStore, key: &str) {
    if let Err(e) = artifacts.delete(key).await {
        warn!("Compensating delete of {key} failed: {e}");
    }
}

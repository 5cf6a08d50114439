use std::fmt::{Display, Formatter};
use std::time::Duration;

use jiff::civil::Date;
use tally_core::lock::owner_of;
use tally_core::{keyspace, today_utc, DistributedLock};
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use crate::engine::StatisticsAggregator;
use crate::trigger::BatchType;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

/// Identity this process uses as lock owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<hostname>-<8 random hex chars>`, unique per process.
    pub fn detect() -> Self {
        let host = gethostname::gethostname();
        let host = host.to_string_lossy();
        let host = if host.trim().is_empty() {
            "unknown"
        } else {
            host.trim()
        };
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{host}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct CoordinatorConfig {
    #[builder(default = InstanceId::detect())]
    pub instance_id: InstanceId,

    /// Bounds how long a crashed instance can block a batch.
    #[builder(default = DEFAULT_LOCK_TTL)]
    pub lock_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Result of one coordinated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The lock was taken and the aggregator processed this many pairs.
    Completed(usize),
    /// The batch lock was not taken. `holder` names the owning instance when
    /// it could be read.
    Skipped { holder: Option<String> },
    /// The lock was taken but aggregation failed.
    Failed,
}

/// Ensures one instance at a time runs a given batch for a given date.
///
/// Errors never escape: they are logged and folded into [`RunOutcome`].
#[derive(Debug, Clone)]
pub struct JobCoordinator<L, A> {
    lock: L,
    aggregator: A,
    config: CoordinatorConfig,
}

impl<L, A> JobCoordinator<L, A>
where
    L: DistributedLock,
    A: StatisticsAggregator,
{
    pub fn new(lock: L, aggregator: A, config: CoordinatorConfig) -> Self {
        Self {
            lock,
            aggregator,
            config,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.config.instance_id
    }

    pub fn aggregator(&self) -> &A {
        &self.aggregator
    }

    /// Runs the batch's default target date.
    pub async fn run_scheduled(&self, batch: BatchType) -> RunOutcome {
        self.run_if_unlocked(batch, batch.default_target_date(today_utc()))
            .await
    }

    /// Runs `batch` for `date` if no other instance is running it.
    pub async fn run_if_unlocked(&self, batch: BatchType, date: Date) -> RunOutcome {
        let key = keyspace::batch_lock_key(batch.as_str(), date);
        let owner = self.config.instance_id.as_str();

        let token = match self.lock.try_acquire(&key, owner, self.config.lock_ttl).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                let holder = match self.lock.holder(&key).await {
                    Ok(token) => token.map(|raw| owner_of(&raw).to_owned()),
                    Err(e) => {
                        warn!(lock = %key, error = %e, "Failed to read lock holder");
                        None
                    }
                };
                info!(
                    batch = %batch,
                    date = %date,
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "Batch is running elsewhere, skipping"
                );
                return RunOutcome::Skipped { holder };
            }
            Err(e) => {
                warn!(batch = %batch, date = %date, error = %e, "Failed to acquire batch lock, skipping");
                return RunOutcome::Skipped { holder: None };
            }
        };

        info!(batch = %batch, date = %date, instance = owner, "Acquired batch lock");
        let outcome = match self.aggregator.aggregate(date).await {
            Ok(processed) => {
                info!(batch = %batch, date = %date, processed, "Batch completed");
                RunOutcome::Completed(processed)
            }
            Err(e) => {
                error!(batch = %batch, date = %date, error = %e, "Batch failed");
                RunOutcome::Failed
            }
        };

        match self.lock.release(&key, &token).await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %key, "Batch lock expired before release"),
            Err(e) => warn!(lock = %key, error = %e, "Failed to release batch lock; it will expire"),
        }

        outcome
    }
}

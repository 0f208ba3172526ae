use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};

use super::reconciliation::Reconciler;

/// Every five minutes, on the minute.
pub const DEFAULT_SCHEDULE: &str = "0 */5 * * * *";

/// Runs reconciliation on a cron schedule until shutdown is signalled.
pub struct ReconciliationScheduler {
    reconciler: Reconciler,
    schedule: Schedule,
}

impl ReconciliationScheduler {
    /// `expression` uses the six-field cron syntax with seconds first.
    pub fn new(reconciler: Reconciler, expression: &str) -> AppResult<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            AppError::Validation(format!("invalid reconciliation schedule '{expression}': {e}"))
        })?;
        Ok(Self {
            reconciler,
            schedule,
        })
    }

    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Loop until `shutdown` flips to `true` or its sender is dropped. A run
    /// already in progress finishes before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Reconciliation scheduler started");

        loop {
            let now = Utc::now();
            let Some(next) = self.next_run(now) else {
                warn!("Reconciliation schedule has no upcoming runs, stopping");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.reconciler.run(Utc::now()).await {
                error!("Reconciliation run failed: {}", e);
            }
        }

        info!("Reconciliation scheduler stopped");
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("schedule", &self.schedule.to_string())
            .finish_non_exhaustive()
    }
}

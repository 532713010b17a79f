//! Background loops: periodic full saves, integrity audits and resumable-state cleanup.

use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info};

use crate::state::{SharedState, session::Outcome};

/// Full snapshot cadence.
pub const PERIODIC_SAVE_INTERVAL: Duration = Duration::from_secs(30);
/// Board, lock and counter audit cadence.
pub const FULL_AUDIT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Score-lock only audit cadence.
pub const LOCK_AUDIT_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Stale resumable-state sweep cadence.
pub const RESUMABLE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Save,
    FullAudit,
    LockAudit,
    ResumableCleanup,
}

impl Job {
    fn period(self) -> Duration {
        match self {
            Self::Save => PERIODIC_SAVE_INTERVAL,
            Self::FullAudit => FULL_AUDIT_INTERVAL,
            Self::LockAudit => LOCK_AUDIT_INTERVAL,
            Self::ResumableCleanup => RESUMABLE_CLEANUP_INTERVAL,
        }
    }
}

/// Spawn every maintenance loop. The handles are aborted on shutdown.
pub fn spawn(state: &SharedState) -> Vec<JoinHandle<()>> {
    [
        Job::Save,
        Job::FullAudit,
        Job::LockAudit,
        Job::ResumableCleanup,
    ]
    .into_iter()
    .map(|job| tokio::spawn(run(state.clone(), job)))
    .collect()
}

async fn run(state: SharedState, job: Job) {
    let period = job.period();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        debug!(job = ?job, "maintenance tick");
        match job {
            Job::Save => {
                state
                    .transition(|_, _| {
                        (
                            (),
                            Outcome {
                                save: true,
                                ..Outcome::default()
                            },
                        )
                    })
                    .await
            }
            Job::FullAudit => {
                let report = state.transition(|session, now| session.audit(now)).await;
                if report.is_clean() {
                    debug!("integrity audit found nothing to repair");
                }
            }
            Job::LockAudit => {
                let corrected = state
                    .transition(|session, now| session.audit_locks(now))
                    .await;
                if !corrected.is_empty() {
                    info!(accounts = corrected.len(), "lock audit corrected accounts");
                }
            }
            Job::ResumableCleanup => {
                state
                    .transition(|session, now| ((), session.cleanup_resumable(now)))
                    .await
            }
        }
    }
}

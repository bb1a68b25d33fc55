use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::services::credentials::{AuthError, CredentialManager};
use crate::services::remote_stats::{RemoteError, RemoteStatsClient};
use crate::services::series_store::{Sample, SeriesStore, StoreError};
use crate::time::next_boundary;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Fetching,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Timer,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("a fetch cycle is already in progress")]
    Busy,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Auth(AuthError::NoRefreshPath) => "no_refresh_path",
            Self::Auth(AuthError::ExchangeFailed(_)) => "auth_exchange_failed",
            Self::Remote(RemoteError::Unauthorized) => "unauthorized",
            Self::Remote(RemoteError::Unavailable(_)) => "remote_unavailable",
            Self::Remote(RemoteError::Malformed(_)) => "remote_malformed",
            Self::Store(_) => "store_write_failed",
        }
    }
}

/// Single refresh-and-retry allowance for one fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRetryPolicy {
    #[default]
    Initial,
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RefreshAndRetry,
    GiveUp,
}

impl AuthRetryPolicy {
    pub fn on_unauthorized(&mut self) -> RetryDecision {
        match self {
            Self::Initial => {
                *self = Self::Refreshed;
                RetryDecision::RefreshAndRetry
            }
            Self::Refreshed => RetryDecision::GiveUp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleResult {
    Ok { sample: Sample },
    Failed { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub finished_at: DateTime<Utc>,
    pub refreshed_token: bool,
    pub result: CycleResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub phase: Phase,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub timezone: Tz,
    pub interval_minutes: u32,
}

/// Runs fetch cycles on wall-clock boundaries and on demand, one cycle at a time.
pub struct Scheduler {
    credentials: Arc<CredentialManager>,
    remote: Arc<dyn RemoteStatsClient>,
    store: SeriesStore,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    gate: tokio::sync::Mutex<()>,
    status: Mutex<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(
        credentials: Arc<CredentialManager>,
        remote: Arc<dyn RemoteStatsClient>,
        store: SeriesStore,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            credentials,
            remote,
            store,
            clock,
            settings,
            gate: tokio::sync::Mutex::new(()),
            status: Mutex::new(SchedulerStatus {
                phase: Phase::Idle,
                last_cycle: None,
            }),
        }
    }

    pub fn next_fetch_at(&self) -> DateTime<Utc> {
        next_boundary(
            self.clock.now(),
            &self.settings.timezone,
            self.settings.interval_minutes,
        )
    }

    pub fn status(&self) -> SchedulerStatus {
        self.lock_status().clone()
    }

    /// Runs one cycle immediately. Rejected with [`FetchError::Busy`] while another cycle runs.
    pub async fn fetch_now(&self) -> Result<Sample, FetchError> {
        self.run_gated(Trigger::Manual).await
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_timer(cancel).await })
    }

    pub async fn run_timer(&self, cancel: CancellationToken) {
        info!(
            timezone = %self.settings.timezone,
            interval_minutes = self.settings.interval_minutes,
            "fetch timer started"
        );
        let mut previous: Option<DateTime<Utc>> = None;
        loop {
            // Never reuse a boundary, even if the sleep returned a moment early.
            let now = self.clock.now();
            let from = previous.map_or(now, |prev| prev.max(now));
            let next = next_boundary(
                from,
                &self.settings.timezone,
                self.settings.interval_minutes,
            );
            previous = Some(next);
            debug!(next_fetch_at = %next, "waiting for next fetch boundary");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep_until(next) => {}
            }
            match self.run_gated(Trigger::Timer).await {
                Err(FetchError::Busy) => {
                    info!(boundary = %next, "skipping timer tick; a fetch cycle is already running")
                }
                // Failures are logged by the cycle; the next boundary is the retry.
                Ok(_) | Err(_) => {}
            }
        }
        info!("fetch timer stopped");
    }

    async fn run_gated(&self, trigger: Trigger) -> Result<Sample, FetchError> {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!(?trigger, "fetch rejected; cycle in flight");
            return Err(FetchError::Busy);
        };
        self.transition(Phase::Fetching);

        let mut policy = AuthRetryPolicy::default();
        let result = self.run_cycle(&mut policy).await;
        let refreshed_token = policy == AuthRetryPolicy::Refreshed;

        let cycle_result = match &result {
            Ok(sample) => {
                info!(
                    ?trigger,
                    refreshed_token,
                    paid_bytes = sample.paid_bytes,
                    unpaid_bytes = sample.unpaid_bytes,
                    recorded_at = %sample.timestamp,
                    "fetch cycle stored sample"
                );
                CycleResult::Ok {
                    sample: sample.clone(),
                }
            }
            Err(err) => {
                match trigger {
                    Trigger::Timer => error!(
                        ?trigger,
                        refreshed_token,
                        kind = err.kind(),
                        "fetch cycle failed: {err}"
                    ),
                    Trigger::Manual => warn!(
                        ?trigger,
                        refreshed_token,
                        kind = err.kind(),
                        "fetch cycle failed: {err}"
                    ),
                }
                CycleResult::Failed {
                    kind: err.kind(),
                    reason: err.to_string(),
                }
            }
        };

        let report = CycleReport {
            trigger,
            finished_at: self.clock.now(),
            refreshed_token,
            result: cycle_result,
        };
        if matches!(report.result, CycleResult::Failed { .. }) {
            self.transition(Phase::Failed);
        }
        self.lock_status().last_cycle = Some(report);
        self.transition(Phase::Idle);
        result
    }

    async fn run_cycle(&self, policy: &mut AuthRetryPolicy) -> Result<Sample, FetchError> {
        let mut token = match self.credentials.get_token() {
            Some(token) => token,
            None => {
                // A missing token spends the cycle's single refresh.
                policy.on_unauthorized();
                info!("no token available; exchanging credentials before fetch");
                self.credentials.refresh().await?
            }
        };

        let counters = loop {
            let seen_generation = self.credentials.generation();
            match self.remote.fetch(&token).await {
                Ok(counters) => break counters,
                Err(RemoteError::Unauthorized) => match policy.on_unauthorized() {
                    RetryDecision::RefreshAndRetry => {
                        warn!("token rejected by remote; refreshing and retrying once");
                        token = self.credentials.refresh_after(seen_generation).await?;
                    }
                    RetryDecision::GiveUp => return Err(RemoteError::Unauthorized.into()),
                },
                Err(err) => return Err(err.into()),
            }
        };

        let sample = Sample {
            timestamp: self.clock.now(),
            paid_bytes: counters.paid_bytes,
            unpaid_bytes: counters.unpaid_bytes,
        };
        self.store.append(&sample).await?;
        Ok(sample)
    }

    fn transition(&self, to: Phase) {
        let from = std::mem::replace(&mut self.lock_status().phase, to);
        debug!(from = from.as_str(), to = to.as_str(), "scheduler phase changed");
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, SchedulerStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

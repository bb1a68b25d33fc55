use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::StatsConfig;
use crate::services::credentials::{
    AuthError, CredentialManager, CredentialSource, CredentialStore, TokenExchange,
};
use crate::services::remote_stats::{RemoteError, RemoteStatsClient, TransferCounters};
use crate::services::scheduler::{Clock, Scheduler, SchedulerSettings};
use crate::services::series_store::SeriesStore;
use crate::state::AppState;

pub async fn open_store(dir: &TempDir) -> SeriesStore {
    let pool = crate::db::connect(&dir.path().join("series.db"))
        .await
        .expect("connect sqlite");
    let store = SeriesStore::new(pool);
    store.ensure_schema().await.expect("schema");
    store
}

/// Issues `token-1`, `token-2`, ... or a fixed failure.
#[derive(Default)]
pub struct FakeExchange {
    calls: AtomicUsize,
    failure: Option<String>,
    delay: Option<Duration>,
    logins: Mutex<Vec<(String, String)>>,
}

impl FakeExchange {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> Vec<(String, String)> {
        self.logins.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenExchange for FakeExchange {
    async fn exchange(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.logins
            .lock()
            .unwrap()
            .push((username.to_string(), password.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(message) => Err(AuthError::ExchangeFailed(format!("login failed: {message}"))),
            None => Ok(format!("token-{call}")),
        }
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    initial: Option<String>,
    saved: Mutex<Vec<String>>,
}

impl MemoryCredentialStore {
    pub fn with_token(token: &str) -> Self {
        Self {
            initial: Some(token.to_string()),
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().unwrap().clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_credential(&self) -> Result<Option<String>> {
        Ok(self
            .saved
            .lock()
            .unwrap()
            .last()
            .cloned()
            .or_else(|| self.initial.clone()))
    }

    fn save_credential(&self, token: &str) -> Result<()> {
        self.saved.lock().unwrap().push(token.to_string());
        Ok(())
    }
}

/// Replays scripted responses in order; an exhausted script reports the remote as unavailable.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<VecDeque<Result<TransferCounters, RemoteError>>>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    hold: Option<(Notify, Notify)>,
}

impl ScriptedRemote {
    pub fn new(script: Vec<Result<TransferCounters, RemoteError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Makes every fetch wait for [`ScriptedRemote::release`] after signalling entry.
    pub fn holding(mut self) -> Self {
        self.hold = Some((Notify::new(), Notify::new()));
        self
    }

    pub async fn wait_until_entered(&self) {
        if let Some((entered, _)) = &self.hold {
            entered.notified().await;
        }
    }

    pub fn release(&self) {
        if let Some((_, release)) = &self.hold {
            release.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteStatsClient for ScriptedRemote {
    async fn fetch(&self, token: &str) -> Result<TransferCounters, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());
        if let Some((entered, release)) = &self.hold {
            entered.notify_one();
            release.notified().await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::Unavailable("script exhausted".to_string())))
    }
}

/// Manual clock: `sleep_until` jumps straight to the deadline. After the configured number of
/// sleeps it cancels the given token and never wakes again.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<DateTime<Utc>>>,
    stop_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
            stop_after: Mutex::new(None),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn sleeps(&self) -> Vec<DateTime<Utc>> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn cancel_after_sleeps(&self, sleeps: usize, cancel: CancellationToken) {
        *self.stop_after.lock().unwrap() = Some((sleeps, cancel));
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let stop = {
            let stop_after = self.stop_after.lock().unwrap();
            match stop_after.as_ref() {
                Some((limit, cancel)) if self.sleeps.lock().unwrap().len() >= *limit => {
                    Some(cancel.clone())
                }
                _ => None,
            }
        };
        if let Some(cancel) = stop {
            cancel.cancel();
            std::future::pending::<()>().await;
        }
        self.sleeps.lock().unwrap().push(deadline);
        self.set(deadline);
    }
}

pub fn test_config(dir: &TempDir) -> StatsConfig {
    StatsConfig {
        credentials: CredentialSource::TokenOnly,
        configured_token: Some("test-token".to_string()),
        env_file: dir.path().join(".env"),
        database_path: dir.path().join("series.db"),
        api_base: "http://127.0.0.1:9".to_string(),
        http_timeout: Duration::from_secs(5),
        fetch_interval_minutes: 15,
        schedule_timezone: Tz::UTC,
        display_timezone: Tz::UTC,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub remote: Arc<ScriptedRemote>,
    pub clock: Arc<FakeClock>,
    pub dir: TempDir,
}

/// App state over a temp SQLite file, a scripted remote and a fake clock.
pub async fn test_app(remote: ScriptedRemote, now: DateTime<Utc>) -> TestApp {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = open_store(&dir).await;
    let remote = Arc::new(remote);
    let clock = Arc::new(FakeClock::new(now));
    let credentials = Arc::new(CredentialManager::new(
        config.credentials.clone(),
        config.configured_token.clone(),
        Arc::new(FakeExchange::default()),
        Arc::new(MemoryCredentialStore::default()),
    ));
    let scheduler = Arc::new(Scheduler::new(
        credentials,
        remote.clone(),
        store.clone(),
        clock.clone(),
        SchedulerSettings {
            timezone: config.schedule_timezone,
            interval_minutes: config.fetch_interval_minutes,
        },
    ));
    let state = AppState {
        config: Arc::new(config),
        store,
        scheduler,
    };
    TestApp {
        state,
        remote,
        clock,
        dir,
    }
}

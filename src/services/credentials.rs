use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const TOKEN_KEY: &str = "UR_JWT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no refresh path: only UR_JWT is configured, supply a new token")]
    NoRefreshPath,
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),
}

/// How a fresh token can be obtained once the current one is rejected.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Password { username: String, password: String },
    TokenOnly,
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::TokenOnly => f.write_str("TokenOnly"),
        }
    }
}

#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, username: &str, password: &str) -> Result<String, AuthError>;
}

/// Persisted home of the current token.
pub trait CredentialStore: Send + Sync {
    fn load_credential(&self) -> Result<Option<String>>;
    fn save_credential(&self, token: &str) -> Result<()>;
}

/// `.env`-style file store. Saving rewrites only the token line and replaces the file atomically.
pub struct DotenvCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DotenvCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for DotenvCredentialStore {
    fn load_credential(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let entries = dotenvy::from_path_iter(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut token = None;
        for entry in entries {
            let (key, value) =
                entry.with_context(|| format!("failed to parse {}", self.path.display()))?;
            if key == TOKEN_KEY {
                let value = value.trim();
                token = (!value.is_empty()).then(|| value.to_string());
            }
        }
        Ok(token)
    }

    fn save_credential(&self, token: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let updated = rewrite_token_line(&existing, token);

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(updated.as_bytes())
            .context("failed to write credential temp file")?;
        tmp.as_file()
            .sync_all()
            .context("failed to sync credential temp file")?;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

pub(crate) fn rewrite_token_line(contents: &str, token: &str) -> String {
    let replacement = format!("{TOKEN_KEY}={}", quote_if_needed(token));
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let (prefix, rest) = match trimmed.strip_prefix("export ") {
                Some(rest) => ("export ", rest.trim_start()),
                None => ("", trimmed),
            };
            let is_token_line = rest
                .strip_prefix(TOKEN_KEY)
                .is_some_and(|tail| tail.trim_start().starts_with('='));
            if is_token_line {
                replaced = true;
                format!("{prefix}{replacement}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(replacement);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Single quotes keep dotenvy from expanding `$NAME`. Quotes and backslashes are written
/// outside the quoted run as escapes, since dotenvy's line reader treats `\` as an escape even
/// inside single quotes.
fn quote_if_needed(value: &str) -> String {
    if !value
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '#' | '"' | '\'' | '\\' | '$'))
    {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str(r"'\''"),
            '\\' => quoted.push_str(r"'\\'"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<String>,
    generation: u64,
}

/// Owns the current token and serializes refreshes so concurrent callers share one exchange.
pub struct CredentialManager {
    source: CredentialSource,
    exchange: Arc<dyn TokenExchange>,
    store: Arc<dyn CredentialStore>,
    current: RwLock<TokenState>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        source: CredentialSource,
        initial_token: Option<String>,
        exchange: Arc<dyn TokenExchange>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            source,
            exchange,
            store,
            current: RwLock::new(TokenState {
                token: initial_token.filter(|token| !token.trim().is_empty()),
                generation: 0,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Builds the manager from the persisted token and the configured one.
    ///
    /// With a password the persisted token is the latest refresh and wins. A token-only setup
    /// has no refresh, so the configured token wins and the file is only a fallback.
    pub fn load(
        source: CredentialSource,
        configured_token: Option<String>,
        exchange: Arc<dyn TokenExchange>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let persisted = match store.load_credential() {
            Ok(token) => token,
            Err(err) => {
                warn!("failed to load persisted credential; using configured token: {err:#}");
                None
            }
        };
        let initial = match (&source, persisted, configured_token) {
            (CredentialSource::TokenOnly, persisted, Some(configured)) => {
                if persisted.as_ref().is_some_and(|token| *token != configured) {
                    warn!("configured UR_JWT differs from the persisted one; using it");
                }
                Some(configured)
            }
            (_, Some(persisted), configured) => {
                if configured.as_ref().is_some_and(|token| *token != persisted) {
                    warn!("configured UR_JWT differs from the persisted one; ignoring it");
                }
                Some(persisted)
            }
            (_, None, configured) => configured,
        };
        Self::new(source, initial, exchange, store)
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    pub fn get_token(&self) -> Option<String> {
        self.read_state().token.clone()
    }

    /// Counter bumped on every successful refresh.
    pub fn generation(&self) -> u64 {
        self.read_state().generation
    }

    pub async fn refresh(&self) -> Result<String, AuthError> {
        let seen = self.generation();
        self.refresh_after(seen).await
    }

    /// Refreshes unless another caller already did so since `seen_generation`, in which case
    /// that caller's token is returned without another exchange.
    pub async fn refresh_after(&self, seen_generation: u64) -> Result<String, AuthError> {
        let CredentialSource::Password { username, password } = &self.source else {
            return Err(AuthError::NoRefreshPath);
        };

        let _gate = self.refresh_gate.lock().await;
        {
            let state = self.read_state();
            if state.generation != seen_generation {
                if let Some(token) = state.token.clone() {
                    debug!(
                        generation = state.generation,
                        "reusing token refreshed by a concurrent caller"
                    );
                    return Ok(token);
                }
            }
        }

        let token = self.exchange.exchange(username, password).await?;
        let generation = {
            let mut state = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.token = Some(token.clone());
            state.generation += 1;
            state.generation
        };
        // The fresh token stays in use for this process even if it could not be written out.
        if let Err(err) = self.store.save_credential(&token) {
            warn!(generation, "failed to persist refreshed credential: {err:#}");
        }
        info!(generation, "credential refreshed");
        Ok(token)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, TokenState> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

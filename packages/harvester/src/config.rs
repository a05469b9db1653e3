//! Harvester configuration loaded from environment variables and JSON files.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use ingest_client::DeliveryPolicy;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::fetch::FetchConfig;
use crate::suspension::SuspensionPolicy;
use crate::types::{ChannelRef, FailureKind};
use crate::worker::RetryPolicy;

/// Credentials for one source account.
#[derive(Debug)]
pub struct AccountConfig {
    /// Session name; also names the account in logs and state keys
    pub session: String,
    pub api_id: i64,
    api_hash: SecretString,
}

impl AccountConfig {
    pub fn new(session: impl Into<String>, api_id: i64, api_hash: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            api_id,
            api_hash: SecretString::from(api_hash.into()),
        }
    }

    pub fn api_hash(&self) -> &SecretString {
        &self.api_hash
    }
}

#[derive(Deserialize)]
struct RawAccount {
    session: String,
    api_id: i64,
    api_hash: String,
}

/// Which failure-ledger entries are fed back into a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerRequeue {
    /// Ignore the ledger
    None,
    /// Re-queue rate-limited and transient failures; drop not-found channels
    /// from the source list too
    #[default]
    Retryable,
    /// Re-queue every ledger entry
    All,
}

impl LedgerRequeue {
    /// Whether a ledger entry of this kind joins the work list.
    pub fn requeues(&self, kind: FailureKind) -> bool {
        match self {
            LedgerRequeue::None => false,
            LedgerRequeue::Retryable => kind.is_retryable(),
            LedgerRequeue::All => true,
        }
    }

    /// Whether a source-list channel with a ledger entry of this kind is skipped.
    pub fn skips(&self, kind: FailureKind) -> bool {
        matches!(self, LedgerRequeue::Retryable) && !kind.is_retryable()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerRequeue::None => "none",
            LedgerRequeue::Retryable => "retryable",
            LedgerRequeue::All => "all",
        }
    }
}

impl FromStr for LedgerRequeue {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(LedgerRequeue::None),
            "retryable" => Ok(LedgerRequeue::Retryable),
            "all" => Ok(LedgerRequeue::All),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Application configuration.
#[derive(Debug)]
pub struct HarvesterConfig {
    pub ingest_url: String,
    pub ingest_token: SecretString,
    pub gateway_url: Option<String>,
    pub accounts_file: PathBuf,
    pub channels_file: PathBuf,
    pub state_dir: PathBuf,
    pub fetch: FetchConfig,
    pub retry: RetryPolicy,
    pub suspension: SuspensionPolicy,
    pub ledger_requeue: LedgerRequeue,
    pub request_timeout: Duration,
}

impl HarvesterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let page_size: usize = parse_or(&lookup, "HARVESTER_PAGE_SIZE", 50)?;
        let max_messages: usize = parse_or(&lookup, "HARVESTER_MAX_MESSAGES_PER_CHANNEL", 1000)?;
        let max_attempts: u32 = parse_or(&lookup, "HARVESTER_MAX_ATTEMPTS", 3)?;
        let timeout_secs: u64 = parse_or(&lookup, "HARVESTER_REQUEST_TIMEOUT_SECS", 60)?;
        require_positive("HARVESTER_PAGE_SIZE", page_size as u64)?;
        require_positive("HARVESTER_MAX_MESSAGES_PER_CHANNEL", max_messages as u64)?;
        require_positive("HARVESTER_MAX_ATTEMPTS", max_attempts as u64)?;
        require_positive("HARVESTER_REQUEST_TIMEOUT_SECS", timeout_secs)?;

        let ledger_requeue = match lookup("HARVESTER_LEDGER_REQUEUE") {
            Some(v) => v.parse()?,
            None => LedgerRequeue::default(),
        };

        let mut fetch = FetchConfig::default()
            .with_page_size(page_size)
            .with_max_messages(max_messages);
        if let Some(base) = lookup("HARVESTER_LINK_BASE").filter(|v| !v.trim().is_empty()) {
            fetch = fetch.with_link_base(base);
        }

        Ok(Self {
            ingest_url: required("INGEST_API_URL")?,
            ingest_token: SecretString::from(required("INGEST_TOKEN")?),
            gateway_url: lookup("SOURCE_GATEWAY_URL").filter(|v| !v.trim().is_empty()),
            accounts_file: lookup("HARVESTER_ACCOUNTS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("accounts.json")),
            channels_file: lookup("HARVESTER_CHANNELS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("channels.json")),
            state_dir: lookup("HARVESTER_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            fetch,
            retry: RetryPolicy::default().with_max_attempts(max_attempts),
            suspension: SuspensionPolicy::default(),
            ledger_requeue,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn with_accounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.accounts_file = path.into();
        self
    }

    pub fn with_channels_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.channels_file = path.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_ledger_requeue(mut self, policy: LedgerRequeue) -> Self {
        self.ledger_requeue = policy;
        self
    }

    /// Sink delivery settings derived from the request timeout.
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::default().with_timeout(self.request_timeout)
    }

    pub fn load_accounts(&self) -> ConfigResult<Vec<AccountConfig>> {
        load_accounts(&self.accounts_file)
    }

    pub fn load_channels(&self) -> ConfigResult<Vec<ChannelRef>> {
        load_channels(&self.channels_file)
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: format!("{raw:?}: {e}"),
            })
        }
        _ => Ok(default),
    }
}

fn require_positive(var: &'static str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the account list: a JSON array of `{session, api_id, api_hash}`.
pub fn load_accounts(path: &Path) -> ConfigResult<Vec<AccountConfig>> {
    let raw: Vec<RawAccount> = read_json(path)?;

    let mut seen = HashSet::new();
    let mut accounts = Vec::with_capacity(raw.len());
    for account in raw {
        let session = account.session.trim().to_string();
        if session.is_empty() {
            return Err(ConfigError::Invalid {
                var: "HARVESTER_ACCOUNTS_FILE",
                reason: "account with an empty session name".into(),
            });
        }
        if !seen.insert(session.clone()) {
            return Err(ConfigError::Invalid {
                var: "HARVESTER_ACCOUNTS_FILE",
                reason: format!("duplicate session {session:?}"),
            });
        }
        accounts.push(AccountConfig::new(session, account.api_id, account.api_hash));
    }

    if accounts.is_empty() {
        return Err(ConfigError::NoAccounts {
            path: path.to_path_buf(),
        });
    }
    Ok(accounts)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawChannel {
    Name(String),
    Entry(ChannelRef),
}

/// Load the source channel list.
///
/// Entries are `{username, is_adults}` objects or bare names. Identities are
/// normalized; empty entries and repeats are skipped with a warning.
pub fn load_channels(path: &Path) -> ConfigResult<Vec<ChannelRef>> {
    let raw: Vec<RawChannel> = read_json(path)?;
    Ok(normalize_channels(raw.into_iter().map(|entry| match entry {
        RawChannel::Name(name) => ChannelRef::new(name, false),
        RawChannel::Entry(channel) => channel,
    })))
}

pub(crate) fn normalize_channels(channels: impl IntoIterator<Item = ChannelRef>) -> Vec<ChannelRef> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for (index, channel) in channels.into_iter().enumerate() {
        let Some(channel) = channel.normalized() else {
            warn!(index, "skipping channel entry with empty identity");
            continue;
        };
        if !seen.insert(channel.username.clone()) {
            warn!(channel = %channel.username, "skipping duplicate channel entry");
            continue;
        }
        result.push(channel);
    }
    result
}

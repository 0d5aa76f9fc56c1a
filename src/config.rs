/// Keeper configuration.
///
/// Everything is read from `KEEPER_*` environment variables (a `.env` file
/// is loaded by the binary). Parsing goes through [`KeeperConfig::from_lookup`]
/// so tests can feed a map instead of touching the process environment.
use std::str::FromStr;
use std::time::Duration;

use crate::anchor::bitcoin::BitcoinConfig;
use crate::anchor::evm::EvmConfig;
use crate::crypto::sensitive::SecretString;
use crate::error::{KeeperError, Result};

pub const DEFAULT_DB_URL: &str = "sqlite://keeper_outbox.sqlite3";
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8081";

/// Which anchor provider the keeper runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Simulated,
    Evm,
    Bitcoin,
    /// Every listed single-chain provider, submitted concurrently.
    FanOut(Vec<ProviderKind>),
}

impl FromStr for ProviderKind {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(Self::Simulated),
            "evm" | "ethereum" | "etherlink" => Ok(Self::Evm),
            "bitcoin" | "btc" => Ok(Self::Bitcoin),
            other => Err(KeeperError::Config(format!("unknown anchor provider: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Merkle batching settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Reaching this many members flushes immediately.
    pub max_size: usize,
    /// Age of the first member after which the batch flushes.
    pub max_age: Duration,
    /// Fewest members a timeout flush will anchor.
    pub min_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 100,
            max_age: Duration::from_secs(60),
            min_size: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub provider: ProviderKind,
    pub db_url: String,
    pub poll_interval: Duration,
    pub confirm_interval: Duration,
    pub health_addr: String,
    /// In-progress jobs older than this are returned to the queue.
    pub stale_claim_timeout: Duration,
    pub simulated_confirm_delay: Duration,
    pub batch: BatchConfig,
    pub evm: Option<EvmConfig>,
    pub bitcoin: Option<BitcoinConfig>,
    pub log_format: LogFormat,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Simulated,
            db_url: DEFAULT_DB_URL.to_string(),
            poll_interval: Duration::from_millis(5_000),
            confirm_interval: Duration::from_millis(30_000),
            health_addr: DEFAULT_HEALTH_ADDR.to_string(),
            stale_claim_timeout: Duration::from_secs(600),
            simulated_confirm_delay: Duration::from_millis(2_000),
            batch: BatchConfig::default(),
            evm: None,
            bitcoin: None,
            log_format: LogFormat::Text,
        }
    }
}

/// Parse a boolean flag. Unrecognised values are errors, never `false`.
pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(KeeperError::Config(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| KeeperError::Config(format!("{key}: invalid value {raw:?}: {e}"))),
            None => Ok(default),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.string(key) {
            Some(raw) => parse_bool(key, &raw),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        let ms = self.parsed(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        let secs = self.parsed(key, default.as_secs())?;
        Ok(Duration::from_secs(secs))
    }
}

impl KeeperConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let provider_name = env
            .string_or("KEEPER_PROVIDER", "simulated")
            .trim()
            .to_ascii_lowercase();
        let provider = match provider_name.as_str() {
            "fanout" | "fan-out" | "multi" => {
                let chains = env.string_or("KEEPER_FANOUT_CHAINS", "evm,bitcoin");
                let children = chains
                    .split(',')
                    .filter(|c| !c.trim().is_empty())
                    .map(ProviderKind::from_str)
                    .collect::<Result<Vec<_>>>()?;
                ProviderKind::FanOut(children)
            }
            single => single.parse()?,
        };

        let log_format = match env.string_or("KEEPER_LOG_FORMAT", "text").as_str() {
            "text" | "pretty" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(KeeperError::Config(format!(
                    "KEEPER_LOG_FORMAT: expected text or json, got {other:?}"
                )))
            }
        };

        let batch = BatchConfig {
            enabled: env.bool("KEEPER_BATCH_ENABLED", defaults.batch.enabled)?,
            max_size: env.parsed("KEEPER_BATCH_SIZE", defaults.batch.max_size)?,
            max_age: env.secs("KEEPER_BATCH_MAX_AGE_SECS", defaults.batch.max_age)?,
            min_size: env.parsed("KEEPER_BATCH_MIN_SIZE", defaults.batch.min_size)?,
        };

        let request_timeout = env.secs("KEEPER_HTTP_TIMEOUT_SECS", Duration::from_secs(30))?;

        let evm = match env.string("KEEPER_EVM_RPC_URL") {
            Some(rpc_url) => Some(EvmConfig {
                rpc_url,
                network: env.string_or("KEEPER_EVM_NETWORK", "ethereum"),
                chain: env.string_or("KEEPER_EVM_CHAIN", "sepolia"),
                chain_id: env.parsed("KEEPER_EVM_CHAIN_ID", 11_155_111)?,
                private_key: SecretString::new(
                    env.string("KEEPER_EVM_PRIVATE_KEY").unwrap_or_default(),
                ),
                confirmations: env.parsed("KEEPER_EVM_CONFIRMATIONS", 1)?,
                gas_limit: env.parsed("KEEPER_EVM_GAS_LIMIT", 25_000)?,
                request_timeout,
            }),
            None => None,
        };

        let bitcoin = match env.string("KEEPER_BTC_API_URL") {
            Some(api_url) => Some(BitcoinConfig {
                api_url: api_url.trim_end_matches('/').to_string(),
                network: env.string_or("KEEPER_BTC_NETWORK", "testnet"),
                wif: SecretString::new(env.string("KEEPER_BTC_WIF").unwrap_or_default()),
                fee_sats: env.parsed("KEEPER_BTC_FEE_SATS", 5_000)?,
                confirmations: env.parsed("KEEPER_BTC_CONFIRMATIONS", 1)?,
                request_timeout,
            }),
            None => None,
        };

        let config = Self {
            provider,
            db_url: env.string_or("KEEPER_DB_URL", DEFAULT_DB_URL),
            poll_interval: env.millis("KEEPER_POLL_MS", defaults.poll_interval)?,
            confirm_interval: env.millis("KEEPER_CONFIRM_POLL_MS", defaults.confirm_interval)?,
            health_addr: env.string_or("KEEPER_HEALTH_ADDR", DEFAULT_HEALTH_ADDR),
            stale_claim_timeout: env.secs("KEEPER_STALE_CLAIM_SECS", defaults.stale_claim_timeout)?,
            simulated_confirm_delay: env
                .millis("KEEPER_SIM_CONFIRM_MS", defaults.simulated_confirm_delay)?,
            batch,
            evm,
            bitcoin,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() || self.confirm_interval.is_zero() {
            return Err(KeeperError::Config("poll intervals must be positive".into()));
        }
        if let ProviderKind::FanOut(children) = &self.provider {
            if children.is_empty() {
                return Err(KeeperError::Config(
                    "KEEPER_FANOUT_CHAINS lists no chains".into(),
                ));
            }
        }
        if self.batch.enabled {
            if self.batch.max_size == 0 {
                return Err(KeeperError::Config("KEEPER_BATCH_SIZE must be at least 1".into()));
            }
            if self.batch.min_size == 0 || self.batch.min_size > self.batch.max_size {
                return Err(KeeperError::Config(format!(
                    "KEEPER_BATCH_MIN_SIZE must be between 1 and {}",
                    self.batch.max_size
                )));
            }
            // Batched jobs stay in_progress until their batch flushes
            if self.stale_claim_timeout <= self.batch.max_age {
                return Err(KeeperError::Config(format!(
                    "KEEPER_STALE_CLAIM_SECS ({}s) must exceed KEEPER_BATCH_MAX_AGE_SECS ({}s)",
                    self.stale_claim_timeout.as_secs(),
                    self.batch.max_age.as_secs()
                )));
            }
        }
        Ok(())
    }
}

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// GatewayConfig (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    pub dedup: DedupConfig,
}

impl GatewayConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Self = serde_saphyr::from_str(&contents)?;
        config.dedup.validate()?;
        Ok(config)
    }

    /// Look up the configuration for an account.
    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.get(account_id)
    }
}

// ============================================================================
// AccountConfig
// ============================================================================

/// Credentials for one DingTalk robot application.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// AppKey of the DingTalk application.
    pub client_id: String,
    /// AppSecret of the DingTalk application.
    pub client_secret: String,
    #[serde(default)]
    pub robot_code: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// DedupConfig
// ============================================================================

/// Tunables for duplicate suppression.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_identity_ttl")]
    pub identity_ttl_seconds: u64,
    #[serde(default = "default_identity_max_entries")]
    pub identity_max_entries: usize,
    /// Window for content-signature matches. Deployments have run with
    /// anything between 70 and 100 seconds.
    #[serde(default = "default_signature_ttl")]
    pub signature_ttl_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            identity_ttl_seconds: default_identity_ttl(),
            identity_max_entries: default_identity_max_entries(),
            signature_ttl_seconds: default_signature_ttl(),
        }
    }
}

impl DedupConfig {
    const MAX_SIGNATURE_TTL_SECS: u64 = 3600;

    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_seconds)
    }

    pub fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.signature_ttl_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "dedup.identity_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.identity_max_entries == 0 {
            return Err(ConfigError::Invalid(
                "dedup.identity_max_entries must be positive".to_string(),
            ));
        }
        if !(1..=Self::MAX_SIGNATURE_TTL_SECS).contains(&self.signature_ttl_seconds) {
            return Err(ConfigError::Invalid(format!(
                "dedup.signature_ttl_seconds must be between 1 and {}",
                Self::MAX_SIGNATURE_TTL_SECS
            )));
        }
        Ok(())
    }
}

fn default_identity_ttl() -> u64 {
    5 * 60
}

fn default_identity_max_entries() -> usize {
    10_000
}

fn default_signature_ttl() -> u64 {
    90
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Tests
// ============================================================================

//! Storefront configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Optional
//! - `STOREFRONT_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//! - `CHECKOUT_CURRENCY` - ISO 4217 code sent to the gateway (default: INR)
//! - `CHECKOUT_DESCRIPTION` - Payment description shown by the gateway (default: "Course purchase")
//! - `CHECKOUT_PAYMENT_TIMEOUT_SECS` - Give up waiting for payment after this many seconds
//!   (default: wait indefinitely)
//! - `CART_CONSISTENCY` - `last-write-wins` (default) or `compare-and-swap`
//! - `PAYMENT_GATEWAY_URL` - Hosted gateway base URL
//! - `PAYMENT_GATEWAY_KEY_ID` - Gateway API key id
//! - `PAYMENT_GATEWAY_KEY_SECRET` - Gateway API key secret (high entropy, not a placeholder)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name
//! - `SENTRY_SAMPLE_RATE` - Error sample rate between 0.0 and 1.0 (default: 1.0)
//! - `LOG_FORMAT` - `pretty` (default) or `json`
//!
//! The three `PAYMENT_GATEWAY_*` variables are all-or-nothing: with only some
//! set loading fails.
//!
//! This module only loads and validates settings. The embedding process picks
//! the stores and gateway it constructs from them, for example `PgCartStore`
//! when a database URL is present and `HostedGateway` when `gateway` is set.

use std::collections::HashMap;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

use coursecart_core::CurrencyCode;

const MIN_ENTROPY_BITS_PER_CHAR: f64 = 3.3;

const DEFAULT_DESCRIPTION: &str = "Course purchase";

const DEFAULT_SAMPLE_RATE: f32 = 1.0;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "secret",
    "password",
    "xxx",
    "todo",
    "fixme",
    "insert",
    "enter-",
    "put-your",
    "add-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// How cart mutations guard against concurrent writers of the same cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    /// Blind read-modify-write; a concurrent writer's update may be lost.
    #[default]
    LastWriteWins,
    /// Conditional write against the version read; a lost race surfaces as
    /// `CartError::Conflict`.
    CompareAndSwap,
}

/// Cart engine settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CartConfig {
    pub consistency: ConsistencyMode,
}

/// Checkout settings.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Currency of catalog prices and of the gateway amount.
    pub currency: CurrencyCode,
    /// Description passed to the gateway.
    pub description: String,
    /// `None` waits for a payment confirmation indefinitely.
    pub payment_timeout: Option<Duration>,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            currency: CurrencyCode::default(),
            description: DEFAULT_DESCRIPTION.to_string(),
            payment_timeout: None,
        }
    }
}

/// Hosted payment gateway credentials.
///
/// Implements `Debug` manually to redact the key secret.
#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: Url,
    pub key_id: String,
    pub key_secret: SecretString,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url.as_str())
            .field("key_id", &self.key_id)
            .field("key_secret", &"[REDACTED]")
            .finish()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Storefront engine configuration.
#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: Option<SecretString>,
    pub cart: CartConfig,
    pub checkout: CheckoutConfig,
    /// Hosted gateway credentials, if configured
    pub gateway: Option<GatewayConfig>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    pub sentry_environment: Option<String>,
    pub sentry_sample_rate: f32,
    pub log_format: LogFormat,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            cart: CartConfig::default(),
            checkout: CheckoutConfig::default(),
            gateway: None,
            sentry_dsn: None,
            sentry_environment: None,
            sentry_sample_rate: DEFAULT_SAMPLE_RATE,
            log_format: LogFormat::default(),
        }
    }
}

impl StorefrontConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed, the gateway group is only
    /// partially set, or the gateway secret looks insecure.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value.
    ///
    /// # Errors
    ///
    /// Same as [`StorefrontConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        Ok(Self {
            database_url: env
                .optional("STOREFRONT_DATABASE_URL")
                .or_else(|| env.optional("DATABASE_URL"))
                .map(SecretString::from),
            cart: CartConfig {
                consistency: parse_consistency(&env)?,
            },
            checkout: CheckoutConfig {
                currency: env.parsed_or("CHECKOUT_CURRENCY", CurrencyCode::default())?,
                description: env.or_default("CHECKOUT_DESCRIPTION", DEFAULT_DESCRIPTION),
                payment_timeout: env
                    .parsed::<u64>("CHECKOUT_PAYMENT_TIMEOUT_SECS")?
                    .map(Duration::from_secs),
            },
            gateway: GatewayConfig::from_env(&env)?,
            sentry_dsn: env.optional("SENTRY_DSN"),
            sentry_environment: env.optional("SENTRY_ENVIRONMENT"),
            sentry_sample_rate: parse_sample_rate(&env)?,
            log_format: match env.optional("LOG_FORMAT").as_deref() {
                None | Some("pretty") => LogFormat::Pretty,
                Some("json") => LogFormat::Json,
                Some(other) => {
                    return Err(ConfigError::InvalidEnvVar(
                        "LOG_FORMAT".to_string(),
                        format!("expected 'pretty' or 'json', got '{other}'"),
                    ));
                }
            },
        })
    }
}

impl GatewayConfig {
    fn from_env(env: &Env<'_>) -> Result<Option<Self>, ConfigError> {
        let url = env.optional("PAYMENT_GATEWAY_URL");
        let key_id = env.optional("PAYMENT_GATEWAY_KEY_ID");
        let has_secret = env.optional("PAYMENT_GATEWAY_KEY_SECRET").is_some();

        if url.is_none() && key_id.is_none() && !has_secret {
            return Ok(None);
        }

        let url = url.ok_or_else(|| ConfigError::MissingEnvVar("PAYMENT_GATEWAY_URL".to_string()))?;
        let base_url = Url::parse(&url).map_err(|e| {
            ConfigError::InvalidEnvVar("PAYMENT_GATEWAY_URL".to_string(), e.to_string())
        })?;

        Ok(Some(Self {
            base_url,
            key_id: env.required("PAYMENT_GATEWAY_KEY_ID")?,
            key_secret: env.validated_secret("PAYMENT_GATEWAY_KEY_SECRET")?,
        }))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Variable lookup shared by the parsing helpers.
struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Get an optional variable; empty values count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    /// Get a required variable.
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    /// Get a variable with a default value.
    fn or_default(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    /// Parse an optional variable.
    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
            })
            .transpose()
    }

    /// Parse a variable, falling back to `default` when unset.
    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parsed(key)?.unwrap_or(default))
    }

    /// Load and validate a secret.
    fn validated_secret(&self, key: &str) -> Result<SecretString, ConfigError> {
        let value = self.required(key)?;
        validate_secret_strength(&value, key)?;
        Ok(SecretString::from(value))
    }
}

fn parse_consistency(env: &Env<'_>) -> Result<ConsistencyMode, ConfigError> {
    match env.optional("CART_CONSISTENCY").as_deref() {
        None | Some("last-write-wins") => Ok(ConsistencyMode::LastWriteWins),
        Some("compare-and-swap") => Ok(ConsistencyMode::CompareAndSwap),
        Some(other) => Err(ConfigError::InvalidEnvVar(
            "CART_CONSISTENCY".to_string(),
            format!("expected 'last-write-wins' or 'compare-and-swap', got '{other}'"),
        )),
    }
}

fn parse_sample_rate(env: &Env<'_>) -> Result<f32, ConfigError> {
    let rate = env.parsed_or("SENTRY_SAMPLE_RATE", DEFAULT_SAMPLE_RATE)?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(ConfigError::InvalidEnvVar(
            "SENTRY_SAMPLE_RATE".to_string(),
            format!("must be between 0.0 and 1.0 (got {rate})"),
        ))
    }
}

/// Calculate Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }

    #[allow(clippy::cast_precision_loss)] // String length will never exceed f64 precision
    let len = s.chars().count() as f64;
    freq.values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)] // Character count will never exceed f64 precision
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Validate that a secret is not a placeholder and has sufficient entropy.
fn validate_secret_strength(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.to_lowercase();

    if let Some(pattern) = PLACEHOLDER_PATTERNS.iter().find(|p| lower.contains(*p)) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!("appears to be a placeholder (contains '{pattern}')"),
        ));
    }

    let entropy = shannon_entropy(secret);
    if entropy < MIN_ENTROPY_BITS_PER_CHAR {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "entropy too low ({entropy:.2} bits/char, need >= {MIN_ENTROPY_BITS_PER_CHAR:.1}). Use a randomly generated secret."
            ),
        ));
    }

    Ok(())
}

impl GatewayConfig {
    /// The key secret, for building authenticated requests.
    #[must_use]
    pub fn expose_key_secret(&self) -> &str {
        self.key_secret.expose_secret()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const STRONG_SECRET: &str = "aB3$xY9!mK2@nL5#pQ7&rT0*uW4^zC6";

    fn load(vars: &[(&str, &str)]) -> Result<StorefrontConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        StorefrontConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_empty_environment() {
        let config = load(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.gateway.is_none());
        assert_eq!(config.cart.consistency, ConsistencyMode::LastWriteWins);
        assert_eq!(config.checkout.currency, CurrencyCode::INR);
        assert_eq!(config.checkout.description, "Course purchase");
        assert!(config.checkout.payment_timeout.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!((config.sentry_sample_rate - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_default_matches_empty_environment() {
        let loaded = load(&[]).unwrap();
        let default = StorefrontConfig::default();

        assert!((default.sentry_sample_rate - loaded.sentry_sample_rate).abs() < f32::EPSILON);
        assert!((default.sentry_sample_rate - 1.0).abs() < f32::EPSILON);
        assert_eq!(default.cart.consistency, loaded.cart.consistency);
        assert_eq!(default.checkout.currency, loaded.checkout.currency);
        assert_eq!(default.checkout.description, loaded.checkout.description);
        assert_eq!(default.checkout.payment_timeout, loaded.checkout.payment_timeout);
        assert_eq!(default.log_format, loaded.log_format);
        assert!(default.database_url.is_none() && default.gateway.is_none());
        assert!(default.sentry_dsn.is_none() && default.sentry_environment.is_none());
    }

    #[test]
    fn test_database_url_fallback() {
        let config = load(&[("DATABASE_URL", "postgres://fly/db")]).unwrap();
        assert_eq!(
            config.database_url.unwrap().expose_secret(),
            "postgres://fly/db"
        );

        let config = load(&[
            ("DATABASE_URL", "postgres://fly/db"),
            ("STOREFRONT_DATABASE_URL", "postgres://local/db"),
        ])
        .unwrap();
        assert_eq!(
            config.database_url.unwrap().expose_secret(),
            "postgres://local/db"
        );
    }

    #[test]
    fn test_checkout_settings() {
        let config = load(&[
            ("CHECKOUT_CURRENCY", "usd"),
            ("CHECKOUT_PAYMENT_TIMEOUT_SECS", "900"),
            ("CART_CONSISTENCY", "compare-and-swap"),
        ])
        .unwrap();
        assert_eq!(config.checkout.currency, CurrencyCode::USD);
        assert_eq!(config.checkout.payment_timeout, Some(Duration::from_secs(900)));
        assert_eq!(config.cart.consistency, ConsistencyMode::CompareAndSwap);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            load(&[("CART_CONSISTENCY", "eventual")]),
            Err(ConfigError::InvalidEnvVar(..))
        ));
        assert!(matches!(
            load(&[("CHECKOUT_PAYMENT_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::InvalidEnvVar(..))
        ));
        assert!(matches!(
            load(&[("SENTRY_SAMPLE_RATE", "1.5")]),
            Err(ConfigError::InvalidEnvVar(..))
        ));
        assert!(matches!(
            load(&[("CHECKOUT_CURRENCY", "DOGE")]),
            Err(ConfigError::InvalidEnvVar(..))
        ));
    }

    #[test]
    fn test_gateway_group_is_all_or_nothing() {
        let partial = load(&[("PAYMENT_GATEWAY_KEY_ID", "rzp_live_abc")]);
        assert!(matches!(partial, Err(ConfigError::MissingEnvVar(_))));

        let config = load(&[
            ("PAYMENT_GATEWAY_URL", "https://api.gateway.test/"),
            ("PAYMENT_GATEWAY_KEY_ID", "rzp_live_abc"),
            ("PAYMENT_GATEWAY_KEY_SECRET", STRONG_SECRET),
        ])
        .unwrap();
        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.base_url.as_str(), "https://api.gateway.test/");
        assert_eq!(gateway.expose_key_secret(), STRONG_SECRET);
    }

    #[test]
    fn test_gateway_secret_must_be_strong() {
        let result = load(&[
            ("PAYMENT_GATEWAY_URL", "https://api.gateway.test/"),
            ("PAYMENT_GATEWAY_KEY_ID", "rzp_live_abc"),
            ("PAYMENT_GATEWAY_KEY_SECRET", "changeme123"),
        ]);
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_shannon_entropy() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("aaaaaaa") - 0.0).abs() < f64::EPSILON);
        assert!((shannon_entropy("ab") - 1.0).abs() < 0.01);
        assert!(shannon_entropy("aB3$xY9!mK2@nL5#") > 3.3);
    }

    #[test]
    fn test_validate_secret_strength() {
        assert!(validate_secret_strength("your-api-key-here", "TEST_VAR").is_err());
        assert!(validate_secret_strength("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "TEST_VAR").is_err());
        assert!(validate_secret_strength(STRONG_SECRET, "TEST_VAR").is_ok());
    }

    #[test]
    fn test_gateway_config_debug_redacts_secret() {
        let config = GatewayConfig {
            base_url: Url::parse("https://api.gateway.test/").unwrap(),
            key_id: "key_id_value".to_string(),
            key_secret: SecretString::from("super_secret_key"),
        };

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("key_id_value"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_key"));
    }
}

//! Configuration types.
//!
//! Everything is read once from `SES_PROXY_*` environment variables at
//! startup and never changes for the lifetime of the process.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// SES caps raw outbound messages at 10 MiB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Outbound SMTP relay settings.
#[derive(Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// Proxy configuration.
#[derive(Debug)]
pub struct ProxyConfig {
    /// Bucket the receiving edge archives raw messages into.
    pub archive_bucket: String,
    /// Object key prefix under which messages are archived.
    pub archive_prefix: String,
    /// Local directory holding one sub-directory per bucket.
    pub archive_root: PathBuf,
    /// Sending identity used as the new `From` address.
    pub from_email: String,
    /// Marker prepended to forwarded subjects.
    pub subject_prefix: Option<String>,
    /// Retry `user+tag` aliases as `user` when no exact record exists.
    pub allow_plus_sign: bool,
    /// Destination used when no alias record matches.
    pub default_destination: Option<String>,
    /// Table holding alias records.
    pub alias_table: String,
    /// Receipt rule set activated on every start.
    pub rule_set_name: String,
    pub db_path: PathBuf,
    pub http_port: u16,
    pub max_message_bytes: usize,
    pub smtp: SmtpConfig,
    pub retry: RetryPolicy,
}

/// The subset of configuration the forwarder needs per message.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub from_email: String,
    pub subject_prefix: Option<String>,
    pub default_destination: Option<String>,
    pub archive_prefix: String,
    pub max_message_bytes: usize,
    pub retry: RetryPolicy,
}

impl ProxyConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let archive_bucket = required(
            &get,
            "SES_PROXY_ARCHIVE_BUCKET",
            "Set it to the bucket the receiving rule archives into.",
        )?;
        let archive_prefix = required(
            &get,
            "SES_PROXY_ARCHIVE_PREFIX",
            "Set it to the object key prefix of archived messages.",
        )?;
        let from_email = required(
            &get,
            "SES_PROXY_FROM_EMAIL",
            "Set it to an address on a domain verified for sending.",
        )?;
        if !is_plausible_address(&from_email) {
            return Err(ConfigError::InvalidValue {
                key: "SES_PROXY_FROM_EMAIL".into(),
                message: format!("{from_email:?} is not an email address"),
            });
        }

        let default_destination = get("SES_PROXY_DEFAULT_DESTINATION");
        if let Some(ref dest) = default_destination
            && !is_plausible_address(dest)
        {
            return Err(ConfigError::InvalidValue {
                key: "SES_PROXY_DEFAULT_DESTINATION".into(),
                message: format!("{dest:?} is not an email address"),
            });
        }

        let alias_table = get("SES_PROXY_ALIAS_TABLE").unwrap_or_else(|| "aliases".into());
        if !crate::store::is_sql_identifier(&alias_table) {
            return Err(ConfigError::InvalidValue {
                key: "SES_PROXY_ALIAS_TABLE".into(),
                message: format!("{alias_table:?} is not a valid table name"),
            });
        }

        let smtp = SmtpConfig {
            host: required(
                &get,
                "SES_PROXY_SMTP_HOST",
                "Set it to the SMTP endpoint of the sending service.",
            )?,
            port: parse_or(&get, "SES_PROXY_SMTP_PORT", 587)?,
            username: get("SES_PROXY_SMTP_USERNAME"),
            password: get("SES_PROXY_SMTP_PASSWORD").map(SecretString::from),
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "SES_PROXY_RETRY_ATTEMPTS", 3)?,
            base_delay: Duration::from_millis(parse_or(&get, "SES_PROXY_RETRY_BASE_MS", 200)?),
            max_delay: Duration::from_millis(parse_or(&get, "SES_PROXY_RETRY_MAX_MS", 2000)?),
            call_timeout: Duration::from_millis(parse_or(
                &get,
                "SES_PROXY_CALL_TIMEOUT_MS",
                10_000,
            )?),
            ..RetryPolicy::default()
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SES_PROXY_RETRY_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            archive_bucket,
            archive_prefix,
            archive_root: get("SES_PROXY_ARCHIVE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/archive")),
            from_email,
            subject_prefix: get("SES_PROXY_SUBJECT_PREFIX"),
            allow_plus_sign: parse_bool_or(&get, "SES_PROXY_ALLOW_PLUS_SIGN", true)?,
            default_destination,
            alias_table,
            rule_set_name: get("SES_PROXY_RULE_SET").unwrap_or_else(|| "ses-proxy-rule-set".into()),
            db_path: get("SES_PROXY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/ses-proxy.db")),
            http_port: parse_or(&get, "SES_PROXY_PORT", 8080)?,
            max_message_bytes: parse_or(
                &get,
                "SES_PROXY_MAX_MESSAGE_BYTES",
                DEFAULT_MAX_MESSAGE_BYTES,
            )?,
            smtp,
            retry,
        })
    }

    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            from_email: self.from_email.clone(),
            subject_prefix: self.subject_prefix.clone(),
            default_destination: self.default_destination.clone(),
            archive_prefix: self.archive_prefix.clone(),
            max_message_bytes: self.max_message_bytes,
            retry: self.retry.clone(),
        }
    }
}

fn required<G>(get: &G, key: &str, hint: &str) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.into(),
        hint: hint.into(),
    })
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: format!("{other:?} is not a boolean"),
        }),
    }
}

fn is_plausible_address(value: &str) -> bool {
    value.parse::<lettre::Address>().is_ok()
}

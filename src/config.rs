use std::{env, fmt::Display, ops::RangeInclusive, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::info;

use crate::auth::normalize_email;
use crate::qr::{ErrorCorrection, QrFormat, RenderOptions, MAX_MARGIN, MAX_MODULE_SIZE};

/// Database setting that selects the in-memory store.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Error)]
#[error("Invalid {key} value {value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// SQLite file path, or `:memory:`.
    pub database: String,
    /// Public origin used to build contact page links.
    pub base_url: String,
    pub qr_ecc: ErrorCorrection,
    pub render: RenderOptions,
    pub session_ttl: Duration,
    /// Accounts registered with one of these emails get the admin role.
    pub admin_emails: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database: IN_MEMORY.to_string(),
            base_url: "http://localhost:3000".to_string(),
            qr_ecc: ErrorCorrection::Quartile,
            render: RenderOptions::default(),
            session_ttl: crate::auth::DEFAULT_SESSION_TTL,
            admin_emails: Vec::new(),
        }
    }
}

impl Config {
    /// Reads the `QIRCARD_*` environment variables, taking defaults for unset ones.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port: u16 = try_load(&lookup, "QIRCARD_PORT", "3000")?;
        let default_base_url = format!("http://localhost:{port}");

        Ok(Self {
            port,
            database: try_load(&lookup, "QIRCARD_DATABASE", "qircard.sqlite3")?,
            base_url: try_load::<String, _>(&lookup, "QIRCARD_BASE_URL", &default_base_url)?
                .trim_end_matches('/')
                .to_string(),
            qr_ecc: try_load(&lookup, "QIRCARD_QR_ECC", "Q")?,
            render: RenderOptions {
                format: try_load::<QrFormat, _>(&lookup, "QIRCARD_QR_FORMAT", "png")?,
                module_size: try_load_within(
                    &lookup,
                    "QIRCARD_QR_MODULE_SIZE",
                    "10",
                    1..=MAX_MODULE_SIZE,
                )?,
                margin: try_load_within(&lookup, "QIRCARD_QR_MARGIN", "2", 0..=MAX_MARGIN)?,
            },
            session_ttl: Duration::from_secs(try_load(
                &lookup,
                "QIRCARD_SESSION_TTL_SECS",
                "86400",
            )?),
            admin_emails: try_load::<String, _>(&lookup, "QIRCARD_ADMIN_EMAILS", "")?
                .split(',')
                .map(normalize_email)
                .filter(|email| !email.is_empty())
                .collect(),
        })
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails.iter().any(|admin| admin == email)
    }
}

fn try_load<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.parse().map_err(|e: T::Err| ConfigError {
        key,
        reason: e.to_string(),
        value,
    })
}

fn try_load_within<F>(
    lookup: &F,
    key: &'static str,
    default: &str,
    range: RangeInclusive<u32>,
) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u32 = try_load(lookup, key, default)?;
    if !range.contains(&value) {
        return Err(ConfigError {
            key,
            value: value.to_string(),
            reason: format!("must be between {} and {}", range.start(), range.end()),
        });
    }
    Ok(value)
}

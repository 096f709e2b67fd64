//! Environment-driven configuration.
//!
//! Unset variables take their defaults; set but malformed ones are an
//! error at startup rather than a silent default.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::engine::EngineOptions;
use crate::fetch::FetchPolicy;
use crate::model::MINUTE_MS;
use crate::reconcile::ReconcilePolicy;
use crate::time::parse_tz;
use crate::upstream::Credentials;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    Incomplete(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{var}={value:?}: {reason}")
            }
            ConfigError::Incomplete(msg) => write!(f, "incomplete configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub metrics_port: Option<u16>,
    /// Unset means no booking store: every query reports unavailable.
    pub commerce_url: Option<String>,
    pub credentials: Option<Credentials>,
    pub content_url: Option<String>,
    pub timezone_override: Option<String>,
    pub default_timezone: Tz,
    pub fetch: FetchPolicy,
    pub timezone_timeout: Duration,
    pub timezone_ttl: Duration,
    pub booking_ttl: Duration,
    pub product_ttl: Duration,
    pub stale_grace: Duration,
    pub reconcile: ReconcilePolicy,
    pub prefetch: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let credentials = match (env.text("TIDESLOT_COMMERCE_KEY"), env.text("TIDESLOT_COMMERCE_SECRET")) {
            (Some(key), Some(secret)) => Some(Credentials { key, secret }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Incomplete(
                    "TIDESLOT_COMMERCE_KEY and TIDESLOT_COMMERCE_SECRET must be set together",
                ));
            }
        };

        let timezone_override = env.text("TIDESLOT_TIMEZONE");
        if let Some(name) = &timezone_override
            && parse_tz(name).is_none()
        {
            return Err(invalid("TIDESLOT_TIMEZONE", name, "not an IANA timezone"));
        }
        let default_timezone = match env.text("TIDESLOT_DEFAULT_TIMEZONE") {
            Some(name) => {
                parse_tz(&name).ok_or_else(|| invalid("TIDESLOT_DEFAULT_TIMEZONE", &name, "not an IANA timezone"))?
            }
            None => chrono_tz::UTC,
        };

        let fetch = FetchPolicy {
            page_size: env.positive("TIDESLOT_PAGE_SIZE", 100)?,
            max_pages: env.positive("TIDESLOT_MAX_PAGES", 5)?,
            page_timeout: Duration::from_millis(env.positive("TIDESLOT_PAGE_TIMEOUT_MS", 5000)?),
            retry_first_page: true,
        };

        let reconcile = ReconcilePolicy {
            near_window: env.positive::<i64>("TIDESLOT_MATCH_WINDOW_MINS", 360)? * MINUTE_MS,
            time_only_window: env.positive::<i64>("TIDESLOT_TIME_ONLY_WINDOW_MINS", 90)? * MINUTE_MS,
        };

        Ok(Self {
            bind: env.text("TIDESLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: env.parsed("TIDESLOT_PORT", 8787)?,
            metrics_port: env.optional("TIDESLOT_METRICS_PORT")?,
            commerce_url: env.url("TIDESLOT_COMMERCE_URL")?,
            credentials,
            content_url: env.url("TIDESLOT_CONTENT_URL")?,
            timezone_override,
            default_timezone,
            fetch,
            timezone_timeout: Duration::from_millis(env.positive("TIDESLOT_TZ_TIMEOUT_MS", 3000)?),
            timezone_ttl: Duration::from_secs(env.positive("TIDESLOT_TZ_TTL_SECS", 3600)?),
            booking_ttl: Duration::from_secs(env.positive("TIDESLOT_BOOKING_TTL_SECS", 300)?),
            product_ttl: Duration::from_secs(env.positive("TIDESLOT_PRODUCT_TTL_SECS", 86_400)?),
            stale_grace: Duration::from_secs(env.parsed("TIDESLOT_STALE_GRACE_SECS", 60)?),
            reconcile,
            prefetch: env.flag("TIDESLOT_PREFETCH", true)?,
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            fetch: self.fetch,
            booking_ttl: self.booking_ttl,
            product_ttl: self.product_ttl,
            stale_grace: self.stale_grace,
            reconcile: self.reconcile,
            prefetch: self.prefetch,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Trimmed value; blank counts as unset.
    fn text(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        self.text(var)
            .map(|v| v.parse().map_err(|_| invalid(var, &v, "not a valid number")))
            .transpose()
    }

    fn parsed<T: FromStr>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        Ok(self.optional(var)?.unwrap_or(default))
    }

    fn positive<T: FromStr + PartialOrd + Default>(&self, var: &'static str, default: T) -> Result<T, ConfigError> {
        let value = self.parsed(var, default)?;
        if value <= T::default() {
            let raw = self.text(var).unwrap_or_default();
            return Err(invalid(var, &raw, "must be greater than zero"));
        }
        Ok(value)
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.text(var) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(invalid(var, &v, "expected true or false")),
            },
        }
    }

    fn url(&self, var: &'static str) -> Result<Option<String>, ConfigError> {
        match self.text(var) {
            None => Ok(None),
            Some(v) if v.starts_with("http://") || v.starts_with("https://") => {
                Ok(Some(v.trim_end_matches('/').to_string()))
            }
            Some(v) => Err(invalid(var, &v, "expected an http(s) URL")),
        }
    }
}

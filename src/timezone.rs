//! Business timezone discovery.
//!
//! Sources are tried in order, each under its own short timeout; any
//! failure falls through to the next and the configured default always
//! answers last. The result is held for a TTL and then re-resolved, so a
//! timezone change in the business system is picked up without a restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::CacheLayer;
use crate::clock::Clock;
use crate::model::Ms;
use crate::observability::TIMEZONE_RESOLUTIONS_TOTAL;
use crate::time::parse_tz;
use crate::upstream::http::{SYSTEM_STATUS_PATH, get_json};
use crate::upstream::{Credentials, UpstreamError};

pub const CONTENT_TIMEZONE_PATH: &str = "/wp-json/tideslot/v1/timezone";
pub const PUBLIC_SETTINGS_PATH: &str = "/wp-json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimezoneSourceKind {
    Override,
    ContentEndpoint,
    CommerceStatus,
    PublicSettings,
    Default,
}

impl TimezoneSourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            TimezoneSourceKind::Override => "override",
            TimezoneSourceKind::ContentEndpoint => "content_endpoint",
            TimezoneSourceKind::CommerceStatus => "commerce_status",
            TimezoneSourceKind::PublicSettings => "public_settings",
            TimezoneSourceKind::Default => "default",
        }
    }
}

/// The resolved business timezone. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimezoneContext {
    pub name: String,
    #[serde(skip)]
    pub tz: Tz,
    pub source: TimezoneSourceKind,
    pub resolved_at: Ms,
}

#[async_trait]
pub trait TimezoneSource: Send + Sync {
    fn kind(&self) -> TimezoneSourceKind;

    /// A candidate IANA name, or `None` when this source has no opinion.
    async fn discover(&self) -> Result<Option<String>, UpstreamError>;
}

pub struct TimezoneResolver {
    sources: Arc<[Arc<dyn TimezoneSource>]>,
    fallback: Tz,
    attempt_timeout: Duration,
    clock: Arc<dyn Clock>,
    resolved: CacheLayer<(), TimezoneContext>,
}

impl TimezoneResolver {
    pub fn new(
        sources: Vec<Arc<dyn TimezoneSource>>,
        fallback: Tz,
        ttl: Duration,
        attempt_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sources: sources.into(),
            fallback,
            attempt_timeout,
            resolved: CacheLayer::new("timezone", ttl, clock.clone()),
            clock,
        }
    }

    /// A resolver that always answers `tz`.
    pub fn fixed(tz: Tz, clock: Arc<dyn Clock>) -> Self {
        Self::new(Vec::new(), tz, Duration::from_secs(3600), Duration::from_secs(1), clock)
    }

    /// Current context, re-resolving once the held one is older than the TTL.
    /// Concurrent callers share one resolution.
    pub async fn current(&self) -> TimezoneContext {
        let sources = Arc::clone(&self.sources);
        let fallback = self.fallback;
        let timeout = self.attempt_timeout;
        let clock = Arc::clone(&self.clock);
        self.resolved
            .get_or_load((), move || async move {
                resolve_chain(&sources, fallback, timeout, clock.now_ms()).await
            })
            .await
    }

    /// Forget the held value; the next `current()` resolves again.
    pub fn invalidate(&self) {
        self.resolved.invalidate(&());
    }
}

async fn resolve_chain(
    sources: &[Arc<dyn TimezoneSource>],
    fallback: Tz,
    timeout: Duration,
    now: Ms,
) -> TimezoneContext {
    for source in sources {
        let kind = source.kind();
        let candidate = match tokio::time::timeout(timeout, source.discover()).await {
            Ok(Ok(Some(name))) => name,
            Ok(Ok(None)) => {
                debug!("timezone source {} had no value", kind.label());
                continue;
            }
            Ok(Err(e)) => {
                debug!("timezone source {} failed: {e}", kind.label());
                continue;
            }
            Err(_) => {
                debug!("timezone source {} timed out", kind.label());
                continue;
            }
        };
        let Some(tz) = parse_tz(&candidate) else {
            debug!("timezone source {} returned unknown zone {candidate:?}", kind.label());
            continue;
        };
        info!("business timezone {} (from {})", tz.name(), kind.label());
        metrics::counter!(TIMEZONE_RESOLUTIONS_TOTAL, "source" => kind.label()).increment(1);
        return TimezoneContext {
            name: tz.name().to_string(),
            tz,
            source: kind,
            resolved_at: now,
        };
    }

    info!("business timezone {} (default)", fallback.name());
    metrics::counter!(TIMEZONE_RESOLUTIONS_TOTAL, "source" => TimezoneSourceKind::Default.label())
        .increment(1);
    TimezoneContext {
        name: fallback.name().to_string(),
        tz: fallback,
        source: TimezoneSourceKind::Default,
        resolved_at: now,
    }
}

// ── Sources ──────────────────────────────────────────────────────

/// Operator-forced zone.
pub struct OverrideSource(pub String);

#[async_trait]
impl TimezoneSource for OverrideSource {
    fn kind(&self) -> TimezoneSourceKind {
        TimezoneSourceKind::Override
    }

    async fn discover(&self) -> Result<Option<String>, UpstreamError> {
        let name = self.0.trim();
        Ok((!name.is_empty()).then(|| name.to_string()))
    }
}

/// Small dedicated endpoint on the content system: `{"timezone": "..."}`.
pub struct ContentEndpointSource {
    client: Client,
    url: String,
}

impl ContentEndpointSource {
    pub fn new(client: Client, content_base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{CONTENT_TIMEZONE_PATH}", content_base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TimezoneSource for ContentEndpointSource {
    fn kind(&self) -> TimezoneSourceKind {
        TimezoneSourceKind::ContentEndpoint
    }

    async fn discover(&self) -> Result<Option<String>, UpstreamError> {
        let body = get_json(&self.client, "timezone_content", &self.url, &[], None).await?;
        Ok(string_at(&body, &["/timezone", "/timezone_string"]))
    }
}

/// The e-commerce status endpoint. Needs credentials.
pub struct CommerceStatusSource {
    client: Client,
    url: String,
    credentials: Credentials,
}

impl CommerceStatusSource {
    pub fn new(client: Client, commerce_base_url: &str, credentials: Credentials) -> Self {
        Self {
            client,
            url: format!("{}{SYSTEM_STATUS_PATH}", commerce_base_url.trim_end_matches('/')),
            credentials,
        }
    }
}

#[async_trait]
impl TimezoneSource for CommerceStatusSource {
    fn kind(&self) -> TimezoneSourceKind {
        TimezoneSourceKind::CommerceStatus
    }

    async fn discover(&self) -> Result<Option<String>, UpstreamError> {
        let body = get_json(
            &self.client,
            "timezone_commerce",
            &self.url,
            &[],
            Some(&self.credentials),
        )
        .await?;
        Ok(string_at(&body, &["/settings/timezone", "/environment/timezone"]))
    }
}

/// Public settings index of the content system: `timezone_string`, or a
/// whole-hour `gmt_offset` when no named zone is set.
pub struct PublicSettingsSource {
    client: Client,
    url: String,
}

impl PublicSettingsSource {
    pub fn new(client: Client, content_base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{PUBLIC_SETTINGS_PATH}", content_base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TimezoneSource for PublicSettingsSource {
    fn kind(&self) -> TimezoneSourceKind {
        TimezoneSourceKind::PublicSettings
    }

    async fn discover(&self) -> Result<Option<String>, UpstreamError> {
        let body = get_json(&self.client, "timezone_public", &self.url, &[], None).await?;
        if let Some(name) = string_at(&body, &["/timezone_string"]) {
            return Ok(Some(name));
        }
        Ok(body.get("gmt_offset").and_then(etc_zone_for_offset))
    }
}

fn string_at(body: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| {
        body.pointer(p)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Map a whole-hour UTC offset to its `Etc/GMT` zone (whose sign is inverted).
fn etc_zone_for_offset(raw: &Value) -> Option<String> {
    let hours = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if hours.fract() != 0.0 || !(-12.0..=14.0).contains(&hours) {
        return None;
    }
    let hours = hours as i32;
    Some(match hours {
        0 => "UTC".to_string(),
        h if h > 0 => format!("Etc/GMT-{h}"),
        h => format!("Etc/GMT+{}", -h),
    })
}

/// Build the standard discovery chain from what is configured.
pub fn http_chain(
    client: &Client,
    override_tz: Option<&str>,
    content_base_url: Option<&str>,
    commerce: Option<(&str, &Credentials)>,
) -> Vec<Arc<dyn TimezoneSource>> {
    let mut sources: Vec<Arc<dyn TimezoneSource>> = Vec::new();
    if let Some(tz) = override_tz {
        sources.push(Arc::new(OverrideSource(tz.to_string())));
    }
    if let Some(url) = content_base_url {
        sources.push(Arc::new(ContentEndpointSource::new(client.clone(), url)));
    }
    if let Some((url, credentials)) = commerce {
        sources.push(Arc::new(CommerceStatusSource::new(
            client.clone(),
            url,
            credentials.clone(),
        )));
    }
    if let Some(url) = content_base_url {
        sources.push(Arc::new(PublicSettingsSource::new(client.clone(), url)));
    }
    sources
}

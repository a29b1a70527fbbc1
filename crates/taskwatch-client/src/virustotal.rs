//! VirusTotal v3 file-report provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use taskwatch_core::{ReputationVerdict, Result, TaskwatchError};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::provider::{HashReport, ReputationProvider};

/// The VirusTotal API base URL
const DEFAULT_BASE_URL: &str = "https://www.virustotal.com";

/// Web UI link for a file report
const GUI_FILE_URL: &str = "https://www.virustotal.com/gui/file/";

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Looks up file hashes against VirusTotal
#[derive(Clone)]
pub struct VirusTotalProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    http: HttpClient,
    api_key: String,
    base_url: Url,
    timeout: Duration,
}

#[derive(Deserialize)]
struct FileReport {
    data: FileData,
}

#[derive(Deserialize)]
struct FileData {
    id: Option<String>,
    attributes: FileAttributes,
}

#[derive(Deserialize)]
struct FileAttributes {
    last_analysis_stats: Option<AnalysisStats>,
    last_analysis_date: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AnalysisStats {
    malicious: u32,
    suspicious: u32,
    undetected: u32,
    harmless: u32,
    timeout: u32,
    #[serde(rename = "type-unsupported")]
    type_unsupported: u32,
    failure: u32,
}

impl AnalysisStats {
    const fn total(&self) -> u32 {
        self.malicious
            .saturating_add(self.suspicious)
            .saturating_add(self.undetected)
            .saturating_add(self.harmless)
            .saturating_add(self.timeout)
            .saturating_add(self.type_unsupported)
            .saturating_add(self.failure)
    }
}

impl VirusTotalProvider {
    /// Create a provider with default settings
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        VirusTotalProviderBuilder::new(api_key).build()
    }

    /// Create a builder for custom configuration
    #[must_use]
    pub fn builder(api_key: impl Into<String>) -> VirusTotalProviderBuilder {
        VirusTotalProviderBuilder::new(api_key)
    }

    fn file_url(&self, hash: &str) -> Result<Url> {
        self.inner
            .base_url
            .join(&format!("api/v3/files/{hash}"))
            .map_err(|e| TaskwatchError::Config(format!("invalid VirusTotal URL: {e}")))
    }

    fn send_error(&self, e: reqwest::Error) -> TaskwatchError {
        if e.is_timeout() {
            TaskwatchError::Timeout(self.inner.timeout)
        } else {
            TaskwatchError::Network(e.to_string())
        }
    }

    /// Fetch the report for one hash.
    #[instrument(skip(self), level = "debug")]
    pub async fn file_report(&self, hash: &str) -> Result<ReputationVerdict> {
        let url = self.file_url(hash)?;
        debug!("GET file report");

        let response = self
            .inner
            .http
            .get(url)
            .header("x-apikey", &self.inner.api_key)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status().as_u16();
        if status == 200 {
            let body = response
                .text()
                .await
                .map_err(|e| TaskwatchError::Network(e.to_string()))?;
            return parse_report(hash, &body);
        }

        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        handle_error(status, retry_after, &body)
    }
}

#[async_trait]
impl ReputationProvider for VirusTotalProvider {
    fn name(&self) -> &'static str {
        "virustotal"
    }

    async fn query(&self, hashes: &[String]) -> Result<Vec<HashReport>> {
        let mut reports = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let verdict = match self.file_report(hash).await {
                Ok(verdict) => verdict,
                Err(e) if is_not_found(&e) => ReputationVerdict::unknown(),
                Err(e) => return Err(e),
            };
            reports.push(HashReport::new(hash.clone(), verdict));
        }
        Ok(reports)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn parse_report(hash: &str, body: &str) -> Result<ReputationVerdict> {
    let report: FileReport = serde_json::from_str(body)
        .map_err(|e| TaskwatchError::MalformedResponse(e.to_string()))?;

    let Some(stats) = report.data.attributes.last_analysis_stats else {
        // Known to VirusTotal but never analysed.
        return Ok(ReputationVerdict::unknown());
    };

    let id = report.data.id.as_deref().unwrap_or(hash);
    let mut verdict = ReputationVerdict::from_detections(stats.malicious, stats.total());
    verdict.permalink = Some(format!("{GUI_FILE_URL}{id}"));
    verdict.last_analysis = report
        .data
        .attributes
        .last_analysis_date
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    Ok(verdict)
}

/// Convert an error response to a [`TaskwatchError`]
fn handle_error<T>(status: u16, retry_after: Option<Duration>, body: &str) -> Result<T> {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string());

    match status {
        401 | 403 => Err(TaskwatchError::Unauthorized),
        404 => Err(TaskwatchError::Api {
            code: 404,
            message,
        }),
        429 => {
            warn!(?retry_after, "Rate limited by VirusTotal");
            Err(TaskwatchError::Throttled { retry_after })
        }
        _ => Err(TaskwatchError::Api {
            code: status,
            message,
        }),
    }
}

/// Builder for configuring a [`VirusTotalProvider`]
pub struct VirusTotalProviderBuilder {
    api_key: String,
    base_url: String,
    timeout: Duration,
    user_agent: String,
}

impl VirusTotalProviderBuilder {
    /// Create a new builder with the given API key
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: format!("taskwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set the base URL (useful for testing)
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the request timeout
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the User-Agent header
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Build the provider
    pub fn build(self) -> Result<VirusTotalProvider> {
        if self.api_key.trim().is_empty() {
            return Err(TaskwatchError::Config("VirusTotal API key is empty".into()));
        }

        let mut base = self.base_url;
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| TaskwatchError::Config(format!("invalid VirusTotal URL {base}: {e}")))?;

        let http = HttpClient::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .gzip(true)
            .build()
            .map_err(|e| TaskwatchError::Network(e.to_string()))?;

        Ok(VirusTotalProvider {
            inner: Arc::new(ProviderInner {
                http,
                api_key: self.api_key,
                base_url,
                timeout: self.timeout,
            }),
        })
    }
}

fn is_not_found(err: &TaskwatchError) -> bool {
    matches!(err, TaskwatchError::Api { code: 404, .. })
}

use crate::runtime::fleet_config::DatabaseSection;
use crate::sink::{MetricPoint, MetricsSink, SinkError};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Url};
use std::fmt::Write as _;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxSettings {
    pub url: String,
    pub token: Option<String>,
    pub org: String,
    pub bucket: String,
}

impl InfluxSettings {
    pub fn from_section(section: &DatabaseSection) -> Result<Self> {
        Ok(Self {
            url: section.url.clone().context("database.url is required")?,
            token: section.token.clone(),
            org: section.org.clone().context("database.org is required")?,
            bucket: section.bucket.clone().context("database.bucket is required")?,
        })
    }
}

/// Writes points to an InfluxDB v2 compatible endpoint, one request per point.
pub struct InfluxSink {
    client: Client,
    settings: InfluxSettings,
    ping_url: Url,
    write_url: Url,
}

impl InfluxSink {
    pub fn new(settings: InfluxSettings) -> Result<Self> {
        let base = Url::parse(settings.url.trim_end_matches('/'))
            .with_context(|| format!("invalid metrics store url {}", settings.url))?;
        let ping_url = base.join("/ping").context("failed to build ping url")?;
        let mut write_url = base
            .join("/api/v2/write")
            .context("failed to build write url")?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &settings.org)
            .append_pair("bucket", &settings.bucket)
            .append_pair("precision", "s");

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build metrics store client")?;

        Ok(Self {
            client,
            settings,
            ping_url,
            write_url,
        })
    }

    pub fn settings(&self) -> &InfluxSettings {
        &self.settings
    }

    async fn ping(&self) -> bool {
        match self.client.get(self.ping_url.clone()).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    url = %self.ping_url,
                    status = %response.status(),
                    "metrics store ping rejected"
                );
                false
            }
            Err(err) => {
                tracing::warn!(url = %self.ping_url, error = %err, "metrics store unreachable");
                false
            }
        }
    }

    async fn post(&self, point: &MetricPoint) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(self.write_url.clone())
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line_protocol(point));
        if let Some(token) = &self.settings.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl MetricsSink for InfluxSink {
    fn connect(&self) -> BoxFuture<'_, bool> {
        self.ping().boxed()
    }

    fn write<'a>(&'a self, point: &'a MetricPoint) -> BoxFuture<'a, Result<(), SinkError>> {
        self.post(point).boxed()
    }
}

/// `series,target=..,node=..,party=.. rtt=<ms>i,node_count=<n>i <ts>`
pub fn line_protocol(point: &MetricPoint) -> String {
    let mut line = String::with_capacity(128);
    line.push_str(&escape(&point.series, false));
    let _ = write!(
        line,
        ",target={},node={},party={} rtt={}i,node_count={}i {}",
        escape(&point.destination, true),
        escape(&point.node, true),
        escape(&point.party, true),
        point.value_ms,
        point.count,
        point.timestamp
    );
    line
}

fn escape(raw: &str, tag: bool) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            ',' | ' ' => escaped.push('\\'),
            '=' if tag => escaped.push('\\'),
            _ => {}
        }
        escaped.push(ch);
    }
    escaped
}

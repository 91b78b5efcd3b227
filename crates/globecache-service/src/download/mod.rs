//! Fetching of remote resources.
//!
//! The [`DownloadService`] performs (conditional) HTTP requests, classifies the response into
//! a [`FetchResponse`] or a [`CacheError`], and keeps the process-wide [`ServerBreaker`] up to
//! date.

use std::error::Error;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header};
use url::Url;

use crate::caching::CacheError;
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

mod breaker;

pub use breaker::ServerBreaker;

impl CacheError {
    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// The successful outcome of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    /// The server sent the resource.
    Fresh {
        data: Bytes,
        last_modified: Option<SystemTime>,
    },
    /// The resource has not changed since the time given in `If-Modified-Since`.
    NotModified,
}

/// A service which downloads resources from the tile servers.
#[derive(Debug)]
pub struct DownloadService {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
    breaker: Arc<ServerBreaker>,
}

impl DownloadService {
    pub fn new(timeouts: DownloadTimeouts, breaker: Arc<ServerBreaker>) -> reqwest::Result<Self> {
        Ok(Self {
            client: create_client(&timeouts)?,
            timeouts,
            breaker,
        })
    }

    pub fn from_config(config: &Config) -> reqwest::Result<Arc<Self>> {
        let breaker = Arc::new(ServerBreaker::from_config(config));
        Self::new(DownloadTimeouts::from_config(config), breaker).map(Arc::new)
    }

    /// The breaker which decides whether the server is contacted at all.
    pub fn breaker(&self) -> &Arc<ServerBreaker> {
        &self.breaker
    }

    pub fn timeouts(&self) -> &DownloadTimeouts {
        &self.timeouts
    }

    /// Fetches `url`, optionally only if it changed after `if_modified_since`.
    ///
    /// Returns [`CacheError::ServerDisabled`] without any network traffic if the breaker is
    /// open. The whole request, including the body, is bounded by the configured
    /// `max_download` timeout.
    pub async fn fetch(
        &self,
        url: &Url,
        if_modified_since: Option<SystemTime>,
    ) -> Result<FetchResponse, CacheError> {
        if !self.breaker.is_enabled() {
            return Err(CacheError::ServerDisabled);
        }

        let start = Instant::now();
        let timeout = self.timeouts.max_download;
        let result = tokio::time::timeout(timeout, self.fetch_inner(url, if_modified_since))
            .await
            .unwrap_or(Err(CacheError::Timeout(timeout)));

        match &result {
            Err(err) => {
                tracing::debug!(%url, error = err as &dyn Error, "Failed to fetch resource");
                self.breaker.register_failure(err);
            }
            Ok(_) => self.breaker.register_success(),
        }
        metric!(timer("download.duration") = start.elapsed());

        result
    }

    async fn fetch_inner(
        &self,
        url: &Url,
        if_modified_since: Option<SystemTime>,
    ) -> Result<FetchResponse, CacheError> {
        tracing::trace!(%url, "Fetching resource");

        let mut builder = self.client.get(url.clone());
        if let Some(time) = if_modified_since {
            builder = builder.header(header::IF_MODIFIED_SINCE, format_http_date(time));
        }
        let response = builder.send().await?;

        let status = response.status();
        metric!(counter("download.status") += 1, "status" => status.as_str());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchResponse::NotModified);
        }

        if status.is_success() {
            let last_modified = response
                .headers()
                .get(header::LAST_MODIFIED)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_http_date);
            let data = response.bytes().await?;
            metric!(time_raw("download.size") = data.len() as u64);
            return Ok(FetchResponse::Fresh {
                data,
                last_modified,
            });
        }

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(CacheError::NotFound),
            status if status.is_server_error() => {
                let details = status.canonical_reason().unwrap_or("server error");
                Err(CacheError::DownloadError(format!(
                    "{} {details}",
                    status.as_u16()
                )))
            }
            status => {
                tracing::debug!(%url, %status, "Unexpected status code");
                Err(CacheError::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}

/// Formats `time` as HTTP date (IMF-fixdate).
pub fn format_http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Parses an HTTP date, as sent in `Last-Modified`.
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

//! Pluggable fetch backend for the network-shaped `Call` path.
//!
//! The core ships a fixture fetcher only; real transports implement
//! `Fetcher` on the host side. Fetch failures never escape the resilience
//! contract, so the trait's error type only needs to describe, not recover.

use crate::errors::RuntimeError;
use crate::policy::CapabilityPolicy;
use crate::value::Env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BYTES: usize = 256 * 1024;

pub const FIXTURE_SCHEME: &str = "fixture://";

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub content_type: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fixture not found: {0}")]
    FixtureNotFound(String),

    #[error("no transport for url: {0}")]
    Unsupported(String),

    #[error("fetch failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<FetchResponse, FetchError>;
}

/// Serves `fixture://relative/path` from a root directory; refuses anything
/// else. This is the default backend for tests and the CLI.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FixtureFetcher { root: root.into() }
    }
}

impl Fetcher for FixtureFetcher {
    fn fetch(
        &self,
        url: &str,
        _timeout: Duration,
        max_bytes: usize,
    ) -> Result<FetchResponse, FetchError> {
        let rel = url
            .strip_prefix(FIXTURE_SCHEME)
            .ok_or_else(|| FetchError::Unsupported(url.to_string()))?;
        let path = self.root.join(rel);
        if !path.is_file() {
            return Err(FetchError::FixtureNotFound(rel.to_string()));
        }
        let mut body = std::fs::read(&path)?;
        let truncated = body.len() > max_bytes;
        body.truncate(max_bytes);
        Ok(FetchResponse {
            url: url.to_string(),
            status: 200,
            body,
            truncated,
            content_type: content_type_for(rel).to_string(),
        })
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("xml") | Some("atom") => "application/atom+xml",
        Some("json") => "application/json",
        _ => "text/plain",
    }
}

/// Capability enforcement for fetch URLs: fixtures are blocked, only
/// http(s) schemes pass, and the host must be on the `net` allowlist.
/// Only consulted when enforcement is on; otherwise every URL is allowed.
pub fn enforce_url(url: &str, policy: &CapabilityPolicy) -> Result<(), RuntimeError> {
    if url.starts_with(FIXTURE_SCHEME) {
        tracing::error!(url, "capability block: fixture url under enforcement");
        return Err(RuntimeError::FetchDenied {
            reason: "blocked-fixture".to_string(),
        });
    }
    let parsed = Url::parse(url).map_err(|_| RuntimeError::FetchDenied {
        reason: "blocked-scheme".to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        tracing::error!(url, scheme = parsed.scheme(), "capability block: scheme");
        return Err(RuntimeError::FetchDenied {
            reason: "blocked-scheme".to_string(),
        });
    }
    let domain = parsed
        .host_str()
        .map(|h| h.to_lowercase())
        .unwrap_or_default();
    if !policy.allowed_domains("net").contains(&domain) {
        tracing::error!(url, %domain, "capability block: domain not allowlisted");
        return Err(RuntimeError::FetchDenied {
            reason: format!("blocked-domain: {}", domain),
        });
    }
    Ok(())
}

/// Expand `{name}` placeholders from the environment using the plain value
/// rendering. Unknown placeholders are left verbatim.
pub fn interpolate_url(template: &str, env: &Env) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match env.get(name) {
                    Some(v) => out.push_str(&v.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

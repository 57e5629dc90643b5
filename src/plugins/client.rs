//! Module proxy client.
//!
//! Speaks the read-only subset of the module proxy protocol:
//!
//! - `GET <base>/<path>/@latest` and `GET <base>/<path>/@v/<version>.info`
//!   return `{"Version": "..."}`
//! - `GET <base>/<path>/@v/<version>.zip` returns the module archive
//!
//! Paths and versions are case-escaped (`A` → `!a`) so they are safe to use
//! on case-insensitive storage.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use super::error::{ResolutionError, Result};
use super::traits::ModuleVersion;

/// Owned archive byte stream. The caller reads it to the end and drops it.
pub type ArchiveReader = Box<dyn AsyncRead + Send + Unpin>;

/// Version reference resolved through the `@latest` endpoint.
pub const LATEST: &str = "latest";

/// Resolves and downloads module versions.
#[async_trait]
pub trait Client: Send + Sync {
    /// Resolve `version` of `path` to a concrete version.
    async fn version(&self, path: &str, version: &str) -> Result<ModuleVersion>;

    /// Download the archive of a concrete module version.
    async fn download(&self, module: &ModuleVersion) -> Result<ArchiveReader>;
}

#[async_trait]
impl<C: Client + ?Sized> Client for std::sync::Arc<C> {
    async fn version(&self, path: &str, version: &str) -> Result<ModuleVersion> {
        (**self).version(path, version).await
    }

    async fn download(&self, module: &ModuleVersion) -> Result<ArchiveReader> {
        (**self).download(module).await
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Check that `path` is a well-formed module path.
///
/// Module paths become directory names on disk, so anything that could
/// address outside of the module tree is rejected.
pub fn check_path(path: &str) -> Result<(), ResolutionError> {
    let invalid = |reason| ResolutionError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(invalid("leading or trailing slash"));
    }
    for elem in path.split('/') {
        match elem {
            "" => return Err(invalid("empty path element")),
            "." | ".." => return Err(invalid("relative path element")),
            _ => {}
        }
        if elem.starts_with('.') || elem.ends_with('.') {
            return Err(invalid("leading or trailing dot in path element"));
        }
    }
    if let Some(c) = path
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/')))
    {
        return Err(if c == '!' {
            invalid("reserved escape character '!'")
        } else {
            invalid("invalid character")
        });
    }
    Ok(())
}

/// Check that `version` is a well-formed version string.
pub fn check_version(version: &str) -> Result<(), ResolutionError> {
    let invalid = |reason| ResolutionError::InvalidVersion {
        version: version.to_string(),
        reason,
    };

    if version.is_empty() {
        return Err(invalid("empty version"));
    }
    if version == "." || version == ".." {
        return Err(invalid("relative version"));
    }
    if version
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '+' | '~')))
    {
        return Err(invalid("invalid character"));
    }
    Ok(())
}

/// Case-escape a module path.
pub fn escape_path(path: &str) -> Result<String, ResolutionError> {
    check_path(path)?;
    Ok(escape(path))
}

/// Case-escape a module version.
pub fn escape_version(version: &str) -> Result<String, ResolutionError> {
    check_version(version)?;
    Ok(escape(version))
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "Version")]
    version: String,
}

/// Client for a module proxy.
#[derive(Clone)]
pub struct ProxyClient {
    base: String,
    http: reqwest::Client,
}

impl ProxyClient {
    /// Create a client for `proxy_url`.
    pub fn new(proxy_url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(proxy_url).map_err(|e| ResolutionError::InvalidProxy {
            url: proxy_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolutionError::InvalidProxy {
                url: proxy_url.to_string(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            }
            .into());
        }

        Ok(Self {
            base: url.as_str().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        })
    }

    /// Use a preconfigured HTTP client (timeouts, proxies, TLS roots).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Proxy base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn get(&self, url: &str, path: &str, version: &str) -> Result<reqwest::Response> {
        tracing::debug!(url = %url, "Requesting module proxy");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ResolutionError::Request {
                path: path.to_string(),
                version: version.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ResolutionError::Status {
                path: path.to_string(),
                version: version.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        Ok(resp)
    }
}

#[async_trait]
impl Client for ProxyClient {
    async fn version(&self, path: &str, version: &str) -> Result<ModuleVersion> {
        let escaped_path = escape_path(path)?;
        let url = if version == LATEST {
            format!("{}/{escaped_path}/@latest", self.base)
        } else {
            let escaped_version = escape_version(version)?;
            format!("{}/{escaped_path}/@v/{escaped_version}.info", self.base)
        };

        let resp = self.get(&url, path, version).await?;
        let body = resp.bytes().await.map_err(|source| ResolutionError::Request {
            path: path.to_string(),
            version: version.to_string(),
            source,
        })?;
        let info: VersionInfo =
            serde_json::from_slice(&body).map_err(|e| ResolutionError::Metadata {
                path: path.to_string(),
                version: version.to_string(),
                reason: e.to_string(),
            })?;
        if info.version.is_empty() {
            return Err(ResolutionError::Metadata {
                path: path.to_string(),
                version: version.to_string(),
                reason: "empty version".into(),
            }
            .into());
        }

        tracing::debug!(module = %path, reference = %version, version = %info.version, "Resolved module version");
        Ok(ModuleVersion::new(path, info.version))
    }

    async fn download(&self, module: &ModuleVersion) -> Result<ArchiveReader> {
        let url = format!(
            "{}/{}/@v/{}.zip",
            self.base,
            escape_path(&module.path)?,
            escape_version(&module.version)?
        );

        let resp = self.get(&url, &module.path, &module.version).await?;
        let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }
}

impl std::fmt::Debug for ProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClient")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

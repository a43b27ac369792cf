//! The subject of a workflow: a domain, an address or a URL.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use url::{Host, Url};

use crate::error::{Error, Result};

/// Scheme used to parse targets given without one. It has no default
/// port, so an explicit port always survives parsing.
const BARE_SCHEME: &str = "target";

/// What kind of thing the raw target string names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Domain,
    Address,
    Url,
}

/// A parsed workflow target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    raw: String,
    kind: TargetKind,
    host: String,
    port: Option<u16>,
    /// Scheme of a URL target.
    scheme: Option<String>,
}

impl Target {
    /// Parse a raw target.
    ///
    /// URLs keep their scheme in `raw`; `host()` is always the bare,
    /// lowercased host without userinfo, port or path. `port()` is only set
    /// when the input names a port other than the scheme's default.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("target is empty".to_string()));
        }

        // Bare IPv6 literals are not valid URL authorities.
        if let Ok(addr) = trimmed.parse::<IpAddr>() {
            return Ok(Self {
                raw: trimmed.to_string(),
                kind: TargetKind::Address,
                host: addr.to_string(),
                port: None,
                scheme: None,
            });
        }

        let is_url = trimmed.contains("://");
        let url = if is_url {
            Url::parse(trimmed)
        } else {
            Url::parse(&format!("{}://{}", BARE_SCHEME, trimmed))
        }
        .map_err(|e| Error::Validation(format!("invalid target {}: {}", trimmed, e)))?;

        let host = host_of(&url)?;
        let kind = if is_url {
            TargetKind::Url
        } else if host.parse::<IpAddr>().is_ok() {
            TargetKind::Address
        } else {
            TargetKind::Domain
        };

        Ok(Self {
            raw: trimmed.to_string(),
            kind,
            host,
            port: url.port(),
            scheme: is_url.then(|| url.scheme().to_string()),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// Whether the host is a DNS name (as opposed to a literal address).
    pub fn is_domain(&self) -> bool {
        self.host.parse::<IpAddr>().is_err()
    }

    /// Base URL used when a strategy falls back to scanning the target directly.
    pub fn base_url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let scheme = match (&self.scheme, self.port) {
            (Some(scheme), _) => scheme.as_str(),
            (None, Some(_)) => "http",
            (None, None) => "https",
        };
        match self.port {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Lowercased host of a parsed URL, with hostnames checked for DNS-safe
/// characters (non-special schemes leave the host opaque).
fn host_of(url: &Url) -> Result<String> {
    match url.host() {
        Some(Host::Domain(domain)) => {
            if domain.is_empty()
                || !domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return Err(Error::Validation(format!("invalid hostname: {}", domain)));
            }
            Ok(domain.to_ascii_lowercase())
        }
        Some(Host::Ipv4(addr)) => Ok(addr.to_string()),
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        None => Err(Error::Validation(format!("target has no host: {}", url))),
    }
}

//! Proxy link parsing
//!
//! Translates textual proxy-server URIs into a normalized [`ServerConfig`].
//! Supported schemes: `vless://`, `hysteria2://` and its `hy2://` alias.

pub mod hysteria2;
pub mod vless;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

pub use hysteria2::{build_hysteria2_outbound, parse_hysteria2};
pub use vless::{build_vless_outbound, parse_vless};

/// Errors produced while parsing a proxy link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("unsupported link scheme")]
    InvalidScheme,

    #[error("link is missing the credential")]
    MissingCredential,

    #[error("link is missing a host")]
    MissingHost,

    #[error("invalid port")]
    InvalidPort,

    #[error("failed to parse link: {0}")]
    InvalidUrl(url::ParseError),
}

/// Proxy protocol carried by a parsed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Hysteria2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Hysteria2 => "hysteria2",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized proxy server description
///
/// Created on parse and immutable afterwards. `params` keeps the raw string
/// values of recognized query parameters plus the credential (`uuid` for
/// VLESS, `password` for Hysteria2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub params: HashMap<String, String>,
}

/// Auto-detect and parse a proxy link.
pub fn parse_link(link: &str) -> Result<ServerConfig, LinkError> {
    let link = link.trim();

    if link.starts_with("vless://") {
        parse_vless(link)
    } else if link.starts_with("hysteria2://") || link.starts_with("hy2://") {
        parse_hysteria2(link)
    } else {
        Err(LinkError::InvalidScheme)
    }
}

/// Authority components shared by all supported schemes.
pub(crate) struct LinkParts {
    /// Percent-decoded userinfo (UUID or password).
    pub credential: String,
    pub host: String,
    pub port: u16,
    /// Display name from the fragment, falling back to the host.
    pub name: String,
    pub params: HashMap<String, String>,
}

/// Parse the authority form shared by vless/hysteria2 links.
///
/// `rest` is the link with its scheme prefix already removed; it is re-parsed
/// as a generic `https://` URL so userinfo, host, port, query and fragment
/// follow the standard grammar.
pub(crate) fn parse_link_parts(rest: &str) -> Result<LinkParts, LinkError> {
    let url = Url::parse(&format!("https://{rest}")).map_err(map_url_error)?;

    let credential = urlencoding::decode(url.username())
        .map(|c| c.into_owned())
        .unwrap_or_default();
    if credential.is_empty() {
        return Err(LinkError::MissingCredential);
    }

    let host = match url.host() {
        Some(url::Host::Domain(d)) => d.to_string(),
        Some(url::Host::Ipv4(a)) => a.to_string(),
        Some(url::Host::Ipv6(a)) => a.to_string(),
        None => return Err(LinkError::MissingHost),
    };

    let port = url.port().unwrap_or(443);

    let name = match url.fragment() {
        Some(fragment) if !fragment.is_empty() => urlencoding::decode(fragment)
            .map(|n| n.chars().filter(|c| !c.is_control()).collect())
            .unwrap_or_default(),
        _ => host.clone(),
    };

    // Flatten multi-valued query keys to their first value.
    let mut params = HashMap::new();
    for (key, value) in url.query_pairs() {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }

    Ok(LinkParts {
        credential,
        host,
        port,
        name,
        params,
    })
}

fn map_url_error(err: url::ParseError) -> LinkError {
    match err {
        url::ParseError::InvalidPort => LinkError::InvalidPort,
        url::ParseError::EmptyHost => LinkError::MissingHost,
        other => LinkError::InvalidUrl(other),
    }
}

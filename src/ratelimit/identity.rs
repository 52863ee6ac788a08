//! Client identity extraction and key derivation.

use std::fmt;

use axum::http::HeaderMap;

/// Address used when no forwarding header identifies the client.
pub const FALLBACK_ADDRESS: &str = "127.0.0.1";
/// Placeholder for an absent or unreadable identity field.
pub const UNKNOWN: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";
/// Consulted in order when `x-forwarded-for` yields nothing.
const FALLBACK_HEADERS: [&str; 2] = ["x-real-ip", "cf-connecting-ip"];

/// Who a request claims to come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    /// Client address as reported by the proxy chain
    pub address: String,
    /// Client agent string
    pub user_agent: String,
}

impl ClientIdentity {
    /// Create an identity, substituting [`UNKNOWN`] for empty fields.
    pub fn new(address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            address: or_unknown(address.into()),
            user_agent: or_unknown(user_agent.into()),
        }
    }

    /// Derive the identity from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::new(client_address(headers), user_agent(headers))
    }

    /// The default limiter key: `address:agent`.
    pub fn default_key(&self) -> String {
        format!("{}:{}", self.address, self.user_agent)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_key())
    }
}

/// Resolve the client address from forwarding headers.
///
/// `x-forwarded-for` contributes only its first hop. Headers that are
/// missing, empty or not valid UTF-8 are skipped.
pub fn client_address(headers: &HeaderMap) -> String {
    let forwarded = header_str(headers, FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .map(str::trim);

    forwarded
        .into_iter()
        .chain(FALLBACK_HEADERS.iter().filter_map(|name| header_str(headers, name)))
        .find(|value| !value.is_empty())
        .unwrap_or(FALLBACK_ADDRESS)
        .to_string()
}

/// The `user-agent` header, or [`UNKNOWN`].
pub fn user_agent(headers: &HeaderMap) -> String {
    header_str(headers, "user-agent")
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn or_unknown(value: String) -> String {
    if value.trim().is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

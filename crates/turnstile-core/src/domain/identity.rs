use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Client identity a limit is counted against.
///
/// Rendered as a namespaced key (`token:<value>` / `ip:<address>`) so the two
/// spaces never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Token(String),
    Ip(IpAddr),
    /// No token and no resolvable peer address.
    Unknown,
}

impl IdentityKey {
    /// Build a token identity from a raw header value. Blank values yield `None`.
    pub fn from_token(raw: &str) -> Option<Self> {
        let token = raw.trim();
        if token.is_empty() {
            None
        } else {
            Some(IdentityKey::Token(token.to_string()))
        }
    }

    /// Build an IP identity from a peer address string, dropping any port.
    ///
    /// Accepts `1.2.3.4`, `1.2.3.4:5678`, `::1`, `[::1]` and `[::1]:5678`.
    pub fn from_peer(addr: &str) -> Self {
        let addr = addr.trim();
        if let Ok(socket) = addr.parse::<SocketAddr>() {
            return IdentityKey::Ip(socket.ip());
        }
        if let Ok(ip) = addr.parse::<IpAddr>() {
            return IdentityKey::Ip(ip);
        }
        let unbracketed = addr
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'));
        match unbracketed.and_then(|ip| ip.parse::<IpAddr>().ok()) {
            Some(ip) => IdentityKey::Ip(ip),
            None => IdentityKey::Unknown,
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, IdentityKey::Token(_))
    }

    /// Form safe to write to logs: tokens are cut to their first four chars.
    pub fn redacted(&self) -> String {
        match self {
            IdentityKey::Token(token) => {
                let head: String = token.chars().take(4).collect();
                format!("token:{}***", head)
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Token(token) => write!(f, "token:{}", token),
            IdentityKey::Ip(ip) => write!(f, "ip:{}", ip),
            IdentityKey::Unknown => write!(f, "ip:unknown"),
        }
    }
}

/// Configured limits per identity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub per_ip: u32,
    pub per_token: u32,
}

impl LimitPolicy {
    pub fn limit_for(&self, key: &IdentityKey) -> u32 {
        if key.is_token() {
            self.per_token
        } else {
            self.per_ip
        }
    }

    /// Pick the identity and limit for a request: a non-blank token wins,
    /// otherwise the peer address is used.
    pub fn resolve(&self, token: Option<&str>, peer: Option<&str>) -> (IdentityKey, u32) {
        let key = token
            .and_then(IdentityKey::from_token)
            .unwrap_or_else(|| peer.map(IdentityKey::from_peer).unwrap_or(IdentityKey::Unknown));
        let limit = self.limit_for(&key);
        (key, limit)
    }
}

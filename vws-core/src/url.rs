//! URL partitioning into scheme/host/port/path/query/fragment and back.
//!
//! This only splits on delimiters; it does not validate or decode anything.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Parsed URL. A missing component is an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl Url {
    pub fn parse(url: &str) -> Url {
        let mut out = Url::default();

        let rest = match url.split_once("://") {
            Some((scheme, rest)) => {
                out.scheme = scheme.to_string();
                rest
            }
            None => url,
        };

        let rest = match rest.split_once('#') {
            Some((before, fragment)) => {
                out.fragment = fragment.to_string();
                before
            }
            None => rest,
        };

        let rest = match rest.split_once('?') {
            Some((before, query)) => {
                out.query = query.to_string();
                before
            }
            None => rest,
        };

        let authority = match rest.find('/') {
            Some(i) => {
                out.path = rest[i..].to_string();
                &rest[..i]
            }
            None => rest,
        };

        match authority.rfind(':') {
            // "[::1]" has colons but no port.
            Some(i) if !authority[i..].contains(']') => {
                out.host = authority[..i].to_string();
                out.port = authority[i + 1..].to_string();
            }
            _ => out.host = authority.to_string(),
        }

        out
    }

    pub fn build(&self) -> String {
        self.to_string()
    }

    /// Explicit port, or the default for ws/wss/http/https.
    pub fn port_number(&self) -> Option<u16> {
        if !self.port.is_empty() {
            return self.port.parse().ok();
        }
        match self.scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => Some(80),
            "wss" | "https" => Some(443),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(
            self.scheme.to_ascii_lowercase().as_str(),
            "wss" | "https"
        )
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://", self.scheme)?;
        }
        f.write_str(&self.host)?;
        if !self.port.is_empty() {
            write!(f, ":{}", self.port)?;
        }
        if !self.path.is_empty() {
            if !self.path.starts_with('/') {
                f.write_str("/")?;
            }
            f.write_str(&self.path)?;
        }
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

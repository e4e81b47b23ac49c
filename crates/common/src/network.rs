// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Reverse Tunnel Contributors

// Network utility functions

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    // Handle "localhost" as special case
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Try parsing as IpAddr (handles "127.0.0.1", "::1", etc.)
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Fail-safe: if we can't parse it, assume non-loopback for security
    false
}

/// Join a host and port, bracketing IPv6 literals ("[::1]:22")
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A syntactically valid `host:port` pair.
///
/// The host is kept verbatim (no resolution); IPv6 literals must be
/// bracketed in the textual form and are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port (used when the server assigns the port)
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_host_port(&self.host, self.port))
    }
}

impl FromStr for HostPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::Validation(format!("'{}': unterminated '['", s)))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| Error::Validation(format!("'{}': missing port", s)))?;
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| Error::Validation(format!("'{}': expected host:port", s)))?;
            if host.contains(':') {
                return Err(Error::Validation(format!(
                    "'{}': IPv6 addresses must be written as [addr]:port",
                    s
                )));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(Error::Validation(format!("'{}': host cannot be empty", s)));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!("'{}': host contains whitespace", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Validation(format!("'{}': invalid port '{}'", s, port)))?;

        Ok(HostPort::new(host, port))
    }
}

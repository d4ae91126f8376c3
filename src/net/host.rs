//! Parses the `Host` header / HTTP/2 `:authority` pseudo-header into a
//! hostname and optional port (spec §4.7, testable property §8
//! "host-header parsing").
//!
//! Two entry points are offered deliberately: [`HostInfo::parse_strict`] is
//! what request admission uses — it rejects anything that could smuggle a
//! second authority past a downstream parser (embedded userinfo, stray
//! whitespace, multiple unbracketed colons). [`HostInfo::parse_safe`] is the
//! lenient form used when strict parsing fails: it never errors, falling
//! back to `localhost:<localPort>` so the rest of the request pipeline
//! always has a usable authority to log and reason about (spec §4.7).

use crate::error::ValidationError;

/// Which syntactic family a [`HostInfo::host`] belongs to (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostNameType {
    Dns,
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub host: String,
    pub port: Option<u16>,
    pub name_type: HostNameType,
}

fn reject(input: &str, reason: &'static str) -> ValidationError {
    ValidationError::InvalidHost {
        input: input.to_string(),
        reason,
    }
}

impl HostInfo {
    /// Parses `input` under strict rules, suitable for trusting the result
    /// as the authority a request is routed by. Addresses are canonicalized
    /// (an IPv6 literal is reformatted through [`std::net::Ipv6Addr`], not
    /// merely lowercased, so `[2001:0DB8::0001]` becomes `2001:db8::1`).
    pub fn parse_strict(input: &str) -> Result<Self, ValidationError> {
        if input.is_empty() {
            return Err(reject(input, "host must not be empty"));
        }
        if input.contains('@') {
            return Err(reject(input, "userinfo is not permitted in a host header"));
        }
        if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(reject(input, "host must not contain whitespace or control characters"));
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (addr, after) = rest
                .split_once(']')
                .ok_or_else(|| reject(input, "unterminated IPv6 literal"))?;
            let parsed: std::net::Ipv6Addr = addr
                .parse()
                .map_err(|_| reject(input, "not a valid IPv6 literal"))?;
            let port = parse_optional_port(input, after)?;
            return Ok(HostInfo {
                host: parsed.to_string(),
                port,
                name_type: HostNameType::Ipv6,
            });
        }

        let mut parts = input.split(':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(|| reject(input, "host must not be empty"))?;
        let rest: Vec<&str> = parts.collect();
        if rest.len() > 1 {
            return Err(reject(input, "multiple colons require an [IPv6] literal"));
        }

        let port = match rest.first() {
            Some(p) => Some(parse_port(input, p)?),
            None => None,
        };

        if let Ok(v4) = host.parse::<std::net::Ipv4Addr>() {
            return Ok(HostInfo {
                host: v4.to_string(),
                port,
                name_type: HostNameType::Ipv4,
            });
        }

        if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_') {
            return Err(reject(input, "host contains characters outside reg-name"));
        }

        Ok(HostInfo {
            host: host.to_ascii_lowercase(),
            port,
            name_type: HostNameType::Dns,
        })
    }

    /// A parse that never fails: falls back to `localhost:<local_port>` if
    /// `input` doesn't pass [`HostInfo::parse_strict`] (spec §4.7, testable
    /// property §8 scenario 4), so a malformed `Host` header still yields a
    /// usable authority instead of a truncated fragment of client input.
    pub fn parse_safe(input: &str, local_port: u16) -> Self {
        Self::parse_strict(input).unwrap_or_else(|_| HostInfo {
            host: "localhost".to_string(),
            port: Some(local_port),
            name_type: HostNameType::Dns,
        })
    }
}

fn parse_optional_port(original: &str, after_bracket: &str) -> Result<Option<u16>, ValidationError> {
    if after_bracket.is_empty() {
        return Ok(None);
    }
    let port_str = after_bracket
        .strip_prefix(':')
        .ok_or_else(|| reject(original, "expected `:port` after IPv6 literal"))?;
    Ok(Some(parse_port(original, port_str)?))
}

fn parse_port(original: &str, port_str: &str) -> Result<u16, ValidationError> {
    let port: u32 = port_str
        .parse()
        .map_err(|_| reject(original, "port must be an integer"))?;
    if port == 0 || port > 65535 {
        return Err(ValidationError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host() {
        let h = HostInfo::parse_strict("Example.com").unwrap();
        assert_eq!(h.host, "example.com");
        assert_eq!(h.port, None);
        assert_eq!(h.name_type, HostNameType::Dns);
    }

    #[test]
    fn parses_host_with_port() {
        let h = HostInfo::parse_strict("example.com:8443").unwrap();
        assert_eq!(h.host, "example.com");
        assert_eq!(h.port, Some(8443));
    }

    #[test]
    fn parses_ipv4_host() {
        let h = HostInfo::parse_strict("127.0.0.1:8443").unwrap();
        assert_eq!(h.host, "127.0.0.1");
        assert_eq!(h.name_type, HostNameType::Ipv4);
    }

    #[test]
    fn parses_ipv6_literal() {
        let h = HostInfo::parse_strict("[::1]:8443").unwrap();
        assert_eq!(h.host, "::1");
        assert_eq!(h.port, Some(8443));
        assert_eq!(h.name_type, HostNameType::Ipv6);
    }

    #[test]
    fn canonicalizes_ipv6_literal() {
        let h = HostInfo::parse_strict("[2001:0DB8::0001]").unwrap();
        assert_eq!(h.host, "2001:db8::1");
    }

    #[test]
    fn rejects_userinfo() {
        assert!(HostInfo::parse_strict("user@example.com").is_err());
    }

    #[test]
    fn rejects_ambiguous_multiple_colons() {
        assert!(HostInfo::parse_strict("example.com:8443:extra").is_err());
    }

    #[test]
    fn parse_safe_falls_back_to_localhost_with_local_port() {
        let h = HostInfo::parse_safe("user@host:1:2\t\0", 9443);
        assert_eq!(h.host, "localhost");
        assert_eq!(h.port, Some(9443));
        assert_eq!(h.name_type, HostNameType::Dns);
    }

    #[test]
    fn parse_safe_passes_through_valid_input() {
        let h = HostInfo::parse_safe("example.com:443", 9443);
        assert_eq!(h.host, "example.com");
        assert_eq!(h.port, Some(443));
    }
}

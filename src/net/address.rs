//! Parses the listener `interface` string (spec §4.6, testable property §8
//! "interface parsing"): either a `host:port` pair to bind fresh, or
//! `/dev/fd/<fd>[:<port>]` to adopt an already-open, already-listening socket
//! (e.g. handed down across a reload by a process supervisor).

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceAddress {
    Tcp(SocketAddr),
    Fd { fd: u32, port: Option<u16> },
}

fn parse_port(reason: impl Fn(&'static str) -> ValidationError, port: &str) -> Result<u16, ValidationError> {
    let port: u32 = port.parse().map_err(|_| reason("port must be an integer"))?;
    if port == 0 || port > 65535 {
        return Err(ValidationError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

impl InterfaceAddress {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let reason = |reason: &'static str| ValidationError::InvalidInterface {
            input: input.to_string(),
            reason,
        };

        if let Some(rest) = input.strip_prefix("/dev/fd/") {
            let (fd_str, port_str) = match rest.split_once(':') {
                Some((fd, port)) => (fd, Some(port)),
                None => (rest, None),
            };
            let fd: u64 = fd_str.parse().map_err(|_| reason("fd must be a non-negative integer"))?;
            let fd: u32 = fd
                .try_into()
                .map_err(|_| ValidationError::FdOutOfRange(fd as u32))?;
            let port = port_str.map(|p| parse_port(reason, p)).transpose()?;
            return Ok(InterfaceAddress::Fd { fd, port });
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (addr, after) = rest
                .split_once(']')
                .ok_or_else(|| reason("unterminated IPv6 literal; missing closing `]`"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| reason("expected `:port` after a bracketed IPv6 address"))?;
            (addr, port)
        } else {
            if input.matches(':').count() > 1 {
                return Err(reason(
                    "an unbracketed address cannot contain more than one `:`; wrap IPv6 addresses in `[ ]`",
                ));
            }
            input
                .rsplit_once(':')
                .ok_or_else(|| reason("expected `host:port` or `/dev/fd/<fd>[:<port>]`"))?
        };

        let port = parse_port(reason, port)?;

        let ip: IpAddr = if host.is_empty() || host == "*" {
            IpAddr::from([0, 0, 0, 0])
        } else {
            host.parse().map_err(|_| reason("host is not a valid IP address"))?
        };

        Ok(InterfaceAddress::Tcp(SocketAddr::new(ip, port)))
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceAddress::Tcp(addr) => write!(f, "{addr}"),
            InterfaceAddress::Fd { fd, port: None } => write!(f, "/dev/fd/{fd}"),
            InterfaceAddress::Fd { fd, port: Some(port) } => write!(f, "/dev/fd/{fd}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            InterfaceAddress::parse("127.0.0.1:8443").unwrap(),
            InterfaceAddress::Tcp("127.0.0.1:8443".parse().unwrap())
        );
    }

    #[test]
    fn parses_wildcard_host() {
        assert_eq!(
            InterfaceAddress::parse(":8443").unwrap(),
            InterfaceAddress::Tcp("0.0.0.0:8443".parse().unwrap())
        );
    }

    #[test]
    fn parses_bracketed_ipv6() {
        assert_eq!(
            InterfaceAddress::parse("[::1]:8443").unwrap(),
            InterfaceAddress::Tcp("[::1]:8443".parse().unwrap())
        );
    }

    #[test]
    fn parses_fd_without_port() {
        assert_eq!(
            InterfaceAddress::parse("/dev/fd/3").unwrap(),
            InterfaceAddress::Fd { fd: 3, port: None }
        );
    }

    #[test]
    fn parses_fd_with_port() {
        assert_eq!(
            InterfaceAddress::parse("/dev/fd/3:80").unwrap(),
            InterfaceAddress::Fd { fd: 3, port: Some(80) }
        );
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(matches!(
            InterfaceAddress::parse("127.0.0.1:99999"),
            Err(ValidationError::PortOutOfRange(99999))
        ));
    }

    #[test]
    fn rejects_unbracketed_ipv6() {
        assert!(InterfaceAddress::parse("::1:8080").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(InterfaceAddress::parse("not-an-interface").is_err());
    }
}

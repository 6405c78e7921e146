//! Info-string parsing.
//!
//! Classes are selected by an info string of the form
//! `protocol[+subprotocol]://[host][:port]`, e.g. `tcp://localhost:3344`
//! or `tcp://` for an anonymous outbound-only endpoint.

use crate::error::{Error, Result};

/// Parsed info string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Protocol name (e.g. `tcp`).
    pub protocol: String,
    /// Optional subprotocol (the part after `+`).
    pub subprotocol: Option<String>,
    /// Host name or IP, absent for anonymous endpoints.
    pub host: Option<String>,
    /// Port, absent for anonymous endpoints or ephemeral binds.
    pub port: Option<u16>,
}

impl Info {
    /// Parse an info string.
    pub fn parse(info_string: &str) -> Result<Info> {
        let (scheme, rest) = info_string
            .split_once("://")
            .ok_or_else(|| Error::InvalidArg(format!("malformed info string: {}", info_string)))?;
        if scheme.is_empty() {
            return Err(Error::InvalidArg(format!(
                "missing protocol in info string: {}",
                info_string
            )));
        }

        let (protocol, subprotocol) = match scheme.split_once('+') {
            Some((p, s)) if !p.is_empty() && !s.is_empty() => (p.to_string(), Some(s.to_string())),
            Some(_) => {
                return Err(Error::InvalidArg(format!(
                    "malformed protocol specifier: {}",
                    scheme
                )))
            }
            None => (scheme.to_string(), None),
        };

        let (host, port) = if rest.is_empty() {
            (None, None)
        } else {
            match rest.rsplit_once(':') {
                Some((h, p)) => {
                    let port = p
                        .parse::<u16>()
                        .map_err(|_| Error::InvalidArg(format!("invalid port: {}", p)))?;
                    let host = if h.is_empty() { None } else { Some(h.to_string()) };
                    (host, Some(port))
                }
                None => (Some(rest.to_string()), None),
            }
        };

        Ok(Info {
            protocol,
            subprotocol,
            host,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_info_string() {
        let info = Info::parse("tcp://localhost:3344").unwrap();
        assert_eq!(info.protocol, "tcp");
        assert_eq!(info.subprotocol, None);
        assert_eq!(info.host.as_deref(), Some("localhost"));
        assert_eq!(info.port, Some(3344));
    }

    #[test]
    fn parses_subprotocol() {
        let info = Info::parse("bmi+tcp://example.org:80").unwrap();
        assert_eq!(info.protocol, "bmi");
        assert_eq!(info.subprotocol.as_deref(), Some("tcp"));
        assert_eq!(info.host.as_deref(), Some("example.org"));
    }

    #[test]
    fn parses_anonymous() {
        let info = Info::parse("tcp://").unwrap();
        assert_eq!(info.protocol, "tcp");
        assert_eq!(info.host, None);
        assert_eq!(info.port, None);
    }

    #[test]
    fn parses_host_without_port() {
        let info = Info::parse("tcp://node17").unwrap();
        assert_eq!(info.host.as_deref(), Some("node17"));
        assert_eq!(info.port, None);
    }

    #[test]
    fn parses_port_without_host() {
        let info = Info::parse("tcp://:0").unwrap();
        assert_eq!(info.host, None);
        assert_eq!(info.port, Some(0));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(Info::parse("tcp").is_err());
        assert!(Info::parse("://host").is_err());
        assert!(Info::parse("tcp://host:notaport").is_err());
        assert!(Info::parse("+tcp://host").is_err());
    }
}

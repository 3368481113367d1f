//! Endpoint string parsing
//!
//! Broker addresses arrive as a single string in one of three shapes:
//!
//! - `host` (port left for the caller to default)
//! - `host:port`
//! - `[ipv6-literal]:port` (bracket form, port optional)
//!
//! The bracket form accepts lowercase hex, digits, `:` and `.` inside the
//! brackets. Everything else falls back to splitting at the last colon, so
//! hostnames containing colons keep working for the common `host:port` case.

use crate::transport::TransportError;

/// A parsed broker address, before the default port is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or address literal
    pub host: String,
    /// Explicit port, if the input carried one
    pub port: Option<u16>,
}

impl Endpoint {
    /// Parse `raw` into host and optional port.
    ///
    /// Fails with [`TransportError::MalformedEndpoint`] only when a port
    /// suffix is present but is not a valid port number.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        if let Some(endpoint) = Self::parse_bracketed(raw)? {
            return Ok(endpoint);
        }

        match raw.rfind(':') {
            Some(split) => Ok(Self {
                host: raw[..split].to_string(),
                port: Some(parse_port(raw, &raw[split + 1..])?),
            }),
            None => Ok(Self {
                host: raw.to_string(),
                port: None,
            }),
        }
    }

    /// Recognize the `[literal]` form. Returns `Ok(None)` when `raw` is not
    /// a bracketed literal, letting the caller fall back to colon splitting.
    fn parse_bracketed(raw: &str) -> Result<Option<Self>, TransportError> {
        let Some(rest) = raw.strip_prefix('[') else {
            return Ok(None);
        };

        let literal_end = rest
            .find(|c: char| !matches!(c, '0'..='9' | 'a'..='f' | ':' | '.'))
            .unwrap_or(rest.len());
        if literal_end == 0 || !rest[literal_end..].starts_with(']') {
            return Ok(None);
        }

        let host = rest[..literal_end].to_string();
        let port = match rest[literal_end + 1..].strip_prefix(':') {
            Some(after_colon) => {
                let digits_end = after_colon
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(after_colon.len());
                if digits_end == 0 {
                    None
                } else {
                    Some(parse_port(raw, &after_colon[..digits_end])?)
                }
            }
            None => None,
        };

        Ok(Some(Self { host, port }))
    }
}

fn parse_port(raw: &str, digits: &str) -> Result<u16, TransportError> {
    digits
        .parse::<u16>()
        .map_err(|_| TransportError::MalformedEndpoint(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host() {
        let endpoint = Endpoint::parse("broker.example.com").unwrap();
        assert_eq!(endpoint.host, "broker.example.com");
        assert_eq!(endpoint.port, None);
    }

    #[test]
    fn test_host_with_port() {
        let endpoint = Endpoint::parse("broker:5673").unwrap();
        assert_eq!(endpoint.host, "broker");
        assert_eq!(endpoint.port, Some(5673));
    }

    #[test]
    fn test_bracketed_ipv6_with_port() {
        let endpoint = Endpoint::parse("[fe80::1]:5432").unwrap();
        assert_eq!(endpoint.host, "fe80::1");
        assert_eq!(endpoint.port, Some(5432));
    }

    #[test]
    fn test_bracketed_ipv6_without_port() {
        let endpoint = Endpoint::parse("[::1]").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, None);
    }

    #[test]
    fn test_bracketed_ipv4_mapped() {
        let endpoint = Endpoint::parse("[::ffff:127.0.0.1]:5672").unwrap();
        assert_eq!(endpoint.host, "::ffff:127.0.0.1");
        assert_eq!(endpoint.port, Some(5672));
    }

    #[test]
    fn test_unbracketed_ipv6_splits_at_last_colon() {
        // Without brackets there is no way to tell a v6 literal from
        // host:port, so the last colon wins.
        let endpoint = Endpoint::parse("fe80::1").unwrap();
        assert_eq!(endpoint.host, "fe80:");
        assert_eq!(endpoint.port, Some(1));
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(matches!(
            Endpoint::parse("broker:xyz"),
            Err(TransportError::MalformedEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("broker:70000"),
            Err(TransportError::MalformedEndpoint(_))
        ));
    }

    #[test]
    fn test_bracket_form_requires_lowercase_hex() {
        // Uppercase hex is not a bracket literal; the fallback split sees
        // the whole "[FE80::1]" as the host.
        let endpoint = Endpoint::parse("[FE80::1]:99").unwrap();
        assert_eq!(endpoint.host, "[FE80::1]");
        assert_eq!(endpoint.port, Some(99));
    }

    #[test]
    fn test_bracket_port_stops_at_first_non_digit() {
        let endpoint = Endpoint::parse("[::1]:567x").unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, Some(567));
    }
}

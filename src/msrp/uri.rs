//! MSRP URI parsing and formatting (RFC 4975 §6).
//!
//! Shape: `msrp://host:port/session-id;tcp` with `msrps` for TLS. The
//! session-id tail is what ties a connection to a session; the
//! authority may carry a userinfo part, which is preserved verbatim.

use std::fmt;

use super::MsrpError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MsrpUri {
    /// `msrps` when true.
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    pub session_id: String,
    /// Transport tail, normally `tcp`.
    pub transport: String,
}

impl MsrpUri {
    pub fn new(host: &str, port: u16, session_id: &str) -> Self {
        Self {
            secure: false,
            user: None,
            host: host.to_string(),
            port,
            session_id: session_id.to_string(),
            transport: "tcp".to_string(),
        }
    }

    pub fn secure(host: &str, port: u16, session_id: &str) -> Self {
        Self {
            secure: true,
            ..Self::new(host, port, session_id)
        }
    }

    pub fn parse(input: &str) -> Result<Self, MsrpError> {
        let input = input.trim();
        let (secure, rest) = if let Some(rest) = input.strip_prefix("msrps://") {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix("msrp://") {
            (false, rest)
        } else {
            return Err(MsrpError::MalformedMsrp("URI scheme is not msrp/msrps"));
        };

        let (authority, tail) = rest
            .split_once('/')
            .ok_or(MsrpError::MalformedMsrp("URI has no session path"))?;

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, authority),
        };

        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            // Bracketed IPv6 literal.
            let (host, after) = rest
                .split_once(']')
                .ok_or(MsrpError::MalformedMsrp("unterminated IPv6 literal"))?;
            let port = after
                .strip_prefix(':')
                .ok_or(MsrpError::MalformedMsrp("URI has no port"))?;
            (host.to_string(), port)
        } else {
            let (host, port) = host_port
                .rsplit_once(':')
                .ok_or(MsrpError::MalformedMsrp("URI has no port"))?;
            (host.to_string(), port)
        };
        let port: u16 = port
            .parse()
            .map_err(|_| MsrpError::MalformedMsrp("bad port"))?;

        let (session_id, transport) = tail
            .split_once(';')
            .ok_or(MsrpError::MalformedMsrp("URI has no transport tail"))?;
        if session_id.is_empty() {
            return Err(MsrpError::MalformedMsrp("empty session id"));
        }

        Ok(Self {
            secure,
            user,
            host,
            port,
            session_id: session_id.to_string(),
            transport: transport.to_string(),
        })
    }
}

impl fmt::Display for MsrpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "msrps" } else { "msrp" };
        write!(f, "{scheme}://")?;
        if let Some(ref user) = self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        write!(f, ":{}/{};{}", self.port, self.session_id, self.transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let uri = MsrpUri::parse("msrp://atlanta.example.com:7654/jshA7weztas;tcp").unwrap();
        assert!(!uri.secure);
        assert_eq!(uri.host, "atlanta.example.com");
        assert_eq!(uri.port, 7654);
        assert_eq!(uri.session_id, "jshA7weztas");
        assert_eq!(uri.transport, "tcp");
        assert_eq!(
            uri.to_string(),
            "msrp://atlanta.example.com:7654/jshA7weztas;tcp"
        );
    }

    #[test]
    fn test_parse_secure_with_user() {
        let uri = MsrpUri::parse("msrps://alice@psap.example.gov:9000/s1;tcp").unwrap();
        assert!(uri.secure);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.to_string(), "msrps://alice@psap.example.gov:9000/s1;tcp");
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let uri = MsrpUri::parse("msrp://[2001:db8::1]:7654/x9s;tcp").unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, 7654);
        assert_eq!(uri.to_string(), "msrp://[2001:db8::1]:7654/x9s;tcp");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(MsrpUri::parse("sip:alice@example.com").is_err());
        assert!(MsrpUri::parse("msrp://nohost").is_err());
        assert!(MsrpUri::parse("msrp://h:1/sess").is_err()); // no ;tcp
    }
}

//! message/CPIM codec (RFC 3862).
//!
//! CPIM wraps an instant message with addressing metadata so MSRP can
//! carry multi-party text. A CPIM message is three blocks separated by
//! blank lines: message headers, MIME headers, then the raw body.
//! The body is kept as bytes because it may itself be binary (for
//! example a multipart/mixed payload with a JPEG part).

use chrono::{DateTime, FixedOffset, SecondsFormat};

use super::BodyError;

/// A CPIM address: optional display name plus URI, e.g.
/// `Alice <im:alice@example.com>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpimAddress {
    pub display_name: Option<String>,
    pub uri: String,
}

impl CpimAddress {
    pub fn new(uri: &str) -> Self {
        Self {
            display_name: None,
            uri: uri.to_string(),
        }
    }

    pub fn named(display_name: &str, uri: &str) -> Self {
        Self {
            display_name: Some(display_name.to_string()),
            uri: uri.to_string(),
        }
    }

    fn parse(value: &str) -> Self {
        let value = value.trim();
        if let Some(open) = value.find('<') {
            if let Some(close) = value.rfind('>') {
                if close > open {
                    let name = value[..open].trim().trim_matches('"');
                    return Self {
                        display_name: if name.is_empty() {
                            None
                        } else {
                            Some(name.to_string())
                        },
                        uri: value[open + 1..close].to_string(),
                    };
                }
            }
        }
        Self {
            display_name: None,
            uri: value.to_string(),
        }
    }

    fn format(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{} <{}>", name, self.uri),
            None => format!("<{}>", self.uri),
        }
    }
}

/// A parsed message/CPIM wrapper.
///
/// Multi-valued headers (`To`, `Subject`, `NS`, `Require` and namespaced
/// extension headers) preserve their order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpimMessage {
    pub from: Option<CpimAddress>,
    pub to: Vec<CpimAddress>,
    pub cc: Vec<CpimAddress>,
    pub date_time: Option<DateTime<FixedOffset>>,
    pub subject: Vec<String>,
    /// Namespace declarations: `(prefix, namespace-uri)`.
    pub ns: Vec<(String, String)>,
    pub require: Vec<String>,
    /// Extension headers of the form `<prefix>.<name>: value`.
    pub extension_headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub body: Vec<u8>,
}

impl CpimMessage {
    /// A plain-text CPIM message, the common MSRP case.
    pub fn text(from: CpimAddress, to: CpimAddress, text: &str) -> Self {
        Self {
            from: Some(from),
            to: vec![to],
            content_type: Some("text/plain".to_string()),
            body: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    /// Parse a message/CPIM byte blob.
    pub fn parse(bytes: &[u8]) -> Result<Self, BodyError> {
        let (message_headers, rest) = split_block(bytes)
            .ok_or(BodyError::MalformedBody("CPIM message headers not terminated"))?;
        let (mime_headers, body) = split_block(rest)
            .ok_or(BodyError::MalformedBody("CPIM MIME headers not terminated"))?;

        let mut msg = CpimMessage {
            body: body.to_vec(),
            ..Default::default()
        };

        for line in header_lines(message_headers)? {
            let Some((name, value)) = line.split_once(':') else {
                return Err(BodyError::MalformedBody("CPIM header has no colon"));
            };
            let name = name.trim();
            let value = value.trim();
            match name {
                "From" => msg.from = Some(CpimAddress::parse(value)),
                "To" => msg.to.push(CpimAddress::parse(value)),
                "cc" => msg.cc.push(CpimAddress::parse(value)),
                "DateTime" => {
                    let dt = DateTime::parse_from_rfc3339(value)
                        .map_err(|_| BodyError::MalformedBody("bad CPIM DateTime"))?;
                    msg.date_time = Some(dt);
                }
                "Subject" => msg.subject.push(value.to_string()),
                "NS" => {
                    let addr = CpimAddress::parse(value);
                    let prefix = addr.display_name.unwrap_or_default();
                    msg.ns.push((prefix, addr.uri));
                }
                "Require" => msg.require.push(value.to_string()),
                other if other.contains('.') => {
                    msg.extension_headers
                        .push((other.to_string(), value.to_string()));
                }
                _ => {
                    // Unknown bare headers are tolerated and dropped.
                }
            }
        }

        for line in header_lines(mime_headers)? {
            let Some((name, value)) = line.split_once(':') else {
                return Err(BodyError::MalformedBody("CPIM MIME header has no colon"));
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("Content-Type") {
                msg.content_type = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("Content-ID") {
                msg.content_id = Some(value.to_string());
            }
        }

        Ok(msg)
    }

    /// Serialize to message/CPIM bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut out = String::new();
        if let Some(ref from) = self.from {
            out.push_str(&format!("From: {}\r\n", from.format()));
        }
        for to in &self.to {
            out.push_str(&format!("To: {}\r\n", to.format()));
        }
        for cc in &self.cc {
            out.push_str(&format!("cc: {}\r\n", cc.format()));
        }
        if let Some(ref dt) = self.date_time {
            out.push_str(&format!(
                "DateTime: {}\r\n",
                dt.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        for subject in &self.subject {
            out.push_str(&format!("Subject: {subject}\r\n"));
        }
        for (prefix, uri) in &self.ns {
            out.push_str(&format!("NS: {prefix} <{uri}>\r\n"));
        }
        for require in &self.require {
            out.push_str(&format!("Require: {require}\r\n"));
        }
        for (name, value) in &self.extension_headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        if let Some(ref ct) = self.content_type {
            out.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        if let Some(ref id) = self.content_id {
            out.push_str(&format!("Content-ID: {id}\r\n"));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Split at the first blank line, returning the header block and the
/// remainder after the CRLF CRLF.
fn split_block(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    if bytes.starts_with(b"\r\n") {
        return Some((&bytes[..0], &bytes[2..]));
    }
    let pos = bytes.windows(4).position(|w| w == b"\r\n\r\n")?;
    Some((&bytes[..pos], &bytes[pos + 4..]))
}

fn header_lines(block: &[u8]) -> Result<Vec<&str>, BodyError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| BodyError::MalformedBody("CPIM headers are not valid UTF-8"))?;
    Ok(text
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_text_message() {
        let msg = CpimMessage::text(
            CpimAddress::named("Caller", "im:caller@example.com"),
            CpimAddress::new("im:psap@example.gov"),
            "Send help to 123 Main St",
        );
        let bytes = msg.build();
        let parsed = CpimMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.from, msg.from);
        assert_eq!(parsed.to, msg.to);
        assert_eq!(parsed.content_type.as_deref(), Some("text/plain"));
        assert_eq!(parsed.body, b"Send help to 123 Main St");
    }

    #[test]
    fn test_parse_rfc3862_example() {
        let raw = b"From: MR SANDERS <im:piglet@100akerwood.com>\r\n\
                    To: Depressed Donkey <im:eeyore@100akerwood.com>\r\n\
                    DateTime: 2000-12-13T13:40:00-08:00\r\n\
                    Subject: the weather will be fine today\r\n\
                    NS: MyFeatures <mid:MessageFeatures@id.foo.com>\r\n\
                    Require: MyFeatures.VitalMessageOption\r\n\
                    MyFeatures.VitalMessageOption: Confirmation-requested\r\n\
                    \r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    Content-ID: <1234567890@foo.com>\r\n\
                    \r\n\
                    Here is the text of my message.";
        let msg = CpimMessage::parse(raw).unwrap();
        assert_eq!(
            msg.from,
            Some(CpimAddress::named("MR SANDERS", "im:piglet@100akerwood.com"))
        );
        assert_eq!(msg.to.len(), 1);
        assert_eq!(msg.subject, vec!["the weather will be fine today"]);
        assert_eq!(
            msg.ns,
            vec![(
                "MyFeatures".to_string(),
                "mid:MessageFeatures@id.foo.com".to_string()
            )]
        );
        assert_eq!(msg.require, vec!["MyFeatures.VitalMessageOption"]);
        assert_eq!(
            msg.extension_headers,
            vec![(
                "MyFeatures.VitalMessageOption".to_string(),
                "Confirmation-requested".to_string()
            )]
        );
        assert_eq!(msg.content_id.as_deref(), Some("<1234567890@foo.com>"));
        assert_eq!(msg.body, b"Here is the text of my message.");
        let dt = msg.date_time.unwrap();
        assert_eq!(dt.timezone().local_minus_utc(), -8 * 3600);
    }

    #[test]
    fn test_binary_body_preserved() {
        let mut msg = CpimMessage::text(
            CpimAddress::new("im:a@b"),
            CpimAddress::new("im:c@d"),
            "",
        );
        msg.content_type = Some("application/octet-stream".to_string());
        msg.body = vec![0x00, 0xFF, 0x0D, 0x0A, 0x80];
        let parsed = CpimMessage::parse(&msg.build()).unwrap();
        assert_eq!(parsed.body, msg.body);
    }

    #[test]
    fn test_multiple_to_order_preserved() {
        let mut msg = CpimMessage::default();
        msg.to.push(CpimAddress::new("im:first@x"));
        msg.to.push(CpimAddress::new("im:second@x"));
        let parsed = CpimMessage::parse(&msg.build()).unwrap();
        assert_eq!(parsed.to[0].uri, "im:first@x");
        assert_eq!(parsed.to[1].uri, "im:second@x");
    }

    #[test]
    fn test_missing_blank_line_is_malformed() {
        let err = CpimMessage::parse(b"From: <im:a@b>\r\nTo: <im:c@d>\r\n").unwrap_err();
        assert!(matches!(err, BodyError::MalformedBody(_)));
    }
}

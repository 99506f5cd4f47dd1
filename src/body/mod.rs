//! Binary-safe multipart/mixed body codec (RFC 2046).
//!
//! SIP and MSRP messages in NG9-1-1 routinely carry multipart bodies
//! mixing UTF-8 parts (SDP, CPIM, PIDF-LO) with binary parts (JPEG
//! stills, ISUP blobs). The parser therefore works on raw bytes end to
//! end: part boundaries are located by byte-wise search and binary
//! payloads are never round-tripped through a string.

pub mod cpim;

use std::fmt;

use thiserror::Error;

/// Failures surfaced by the body and CPIM codecs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    /// Structurally broken body: missing header terminator, missing
    /// final boundary, zero-length input, or undecodable text payload.
    #[error("malformed body: {0}")]
    MalformedBody(&'static str),
    /// A multipart content-type without a usable boundary parameter.
    #[error("multipart content-type has no boundary parameter")]
    MissingBoundary,
    /// A content-type the codec cannot classify.
    #[error("unknown content type: {0}")]
    UnknownContentType(String),
}

/// Media types always treated as binary regardless of headers.
const KNOWN_BINARY_TYPES: &[&str] = &[
    "application/octet-stream",
    "application/isup",
    "application/jpeg",
    "application/jpg",
    "image/jpeg",
];

/// Payload of a single body part. Text parts are UTF-8 decoded; binary
/// parts keep their exact bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartContent {
    Text(String),
    Binary(Vec<u8>),
}

impl PartContent {
    /// The payload as bytes, whichever variant it is.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PartContent::Text(s) => s.as_bytes(),
            PartContent::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// One part of a (possibly multipart) message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Media type without parameters, e.g. `text/plain`.
    pub content_type: String,
    /// Content-Type parameters in declaration order.
    pub content_type_params: Vec<(String, String)>,
    pub content_disposition: Option<String>,
    pub content_id: Option<String>,
    pub content_transfer_encoding: Option<String>,
    pub content: PartContent,
}

impl BodyPart {
    /// A UTF-8 text part.
    pub fn text(content_type: &str, text: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            content_type_params: Vec::new(),
            content_disposition: None,
            content_id: None,
            content_transfer_encoding: None,
            content: PartContent::Text(text.to_string()),
        }
    }

    /// A binary part; the transfer encoding is marked `binary` so the
    /// classification survives a round trip.
    pub fn binary(content_type: &str, payload: Vec<u8>) -> Self {
        Self {
            content_type: content_type.to_string(),
            content_type_params: Vec::new(),
            content_disposition: None,
            content_id: None,
            content_transfer_encoding: Some("binary".to_string()),
            content: PartContent::Binary(payload),
        }
    }

    /// Whether this part would be classified binary on parse.
    pub fn is_binary(&self) -> bool {
        is_binary_type(&self.content_type, self.content_transfer_encoding.as_deref())
    }
}

impl fmt::Display for BodyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.content_type, self.content.len())
    }
}

/// Classification rule shared by the parser and [`BodyPart::is_binary`].
fn is_binary_type(content_type: &str, transfer_encoding: Option<&str>) -> bool {
    if let Some(enc) = transfer_encoding {
        if enc.to_ascii_lowercase().contains("binary") {
            return true;
        }
    }
    let ct = content_type.to_ascii_lowercase();
    KNOWN_BINARY_TYPES.iter().any(|known| ct == *known)
}

/// Byte-wise substring search.
fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Split a Content-Type header value into the media type and its
/// parameters. Parameter values may be quoted; order is preserved.
pub fn parse_content_type(value: &str) -> (String, Vec<(String, String)>) {
    let mut pieces = value.split(';');
    let media_type = pieces.next().unwrap_or("").trim().to_string();
    let mut params = Vec::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('=') {
            Some((name, raw)) => {
                let raw = raw.trim();
                let value = raw
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(raw);
                params.push((name.trim().to_string(), value.to_string()));
            }
            None => params.push((piece.to_string(), String::new())),
        }
    }
    (media_type, params)
}

/// Parse a message body into its parts.
///
/// For `multipart/*` content-types the body is split on the declared
/// boundary; any other content-type yields a single part. Binary parts
/// keep byte-exact payloads, text parts are UTF-8 decoded.
pub fn parse(bytes: &[u8], content_type: &str) -> Result<Vec<BodyPart>, BodyError> {
    if bytes.is_empty() {
        return Err(BodyError::MalformedBody("zero-length body"));
    }
    let (media_type, params) = parse_content_type(content_type);
    if media_type.is_empty() {
        return Err(BodyError::UnknownContentType(content_type.to_string()));
    }

    if !media_type.to_ascii_lowercase().starts_with("multipart/") {
        return Ok(vec![single_part(bytes, media_type, params)?]);
    }

    let boundary = params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.clone())
        .filter(|b| !b.is_empty())
        .ok_or(BodyError::MissingBoundary)?;

    parse_multipart(bytes, &boundary)
}

/// Build a single part out of a non-multipart body.
fn single_part(
    bytes: &[u8],
    media_type: String,
    params: Vec<(String, String)>,
) -> Result<BodyPart, BodyError> {
    let content = decode_payload(bytes, &media_type, None)?;
    Ok(BodyPart {
        content_type: media_type,
        content_type_params: params,
        content_disposition: None,
        content_id: None,
        content_transfer_encoding: None,
        content,
    })
}

fn decode_payload(
    bytes: &[u8],
    media_type: &str,
    transfer_encoding: Option<&str>,
) -> Result<PartContent, BodyError> {
    if is_binary_type(media_type, transfer_encoding) {
        Ok(PartContent::Binary(bytes.to_vec()))
    } else {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| BodyError::MalformedBody("text part is not valid UTF-8"))?;
        Ok(PartContent::Text(text.to_string()))
    }
}

fn parse_multipart(bytes: &[u8], boundary: &str) -> Result<Vec<BodyPart>, BodyError> {
    let delimiter = format!("--{boundary}").into_bytes();

    // The opening delimiter is either at offset 0 or preceded by CRLF
    // (anything before it is preamble and is discarded).
    let mut cursor = if bytes.starts_with(&delimiter) {
        delimiter.len()
    } else {
        let mut marker = b"\r\n".to_vec();
        marker.extend_from_slice(&delimiter);
        match find_bytes(bytes, &marker, 0) {
            Some(pos) => pos + marker.len(),
            None => return Err(BodyError::MalformedBody("opening boundary not found")),
        }
    };

    let mut parts = Vec::new();
    loop {
        // Close delimiter: "--boundary--".
        if bytes[cursor..].starts_with(b"--") {
            return if parts.is_empty() {
                Err(BodyError::MalformedBody("multipart body has no parts"))
            } else {
                Ok(parts)
            };
        }

        // Skip transport padding up to the CRLF ending the boundary line.
        let line_end = find_bytes(bytes, b"\r\n", cursor)
            .ok_or(BodyError::MalformedBody("boundary line not terminated"))?;
        let part_start = line_end + 2;

        let mut marker = b"\r\n".to_vec();
        marker.extend_from_slice(&delimiter);
        let part_end = find_bytes(bytes, &marker, part_start)
            .ok_or(BodyError::MalformedBody("final boundary not found"))?;

        parts.push(parse_part(&bytes[part_start..part_end])?);
        cursor = part_end + marker.len();
    }
}

/// Parse one part: a UTF-8 header block terminated by CRLF CRLF, then
/// the raw payload bytes.
fn parse_part(bytes: &[u8]) -> Result<BodyPart, BodyError> {
    let (header_bytes, payload) = match find_bytes(bytes, b"\r\n\r\n", 0) {
        Some(pos) => (&bytes[..pos], &bytes[pos + 4..]),
        None if bytes.starts_with(b"\r\n") => (&bytes[..0], &bytes[2..]),
        None => {
            return Err(BodyError::MalformedBody(
                "part headers not terminated by CRLF CRLF",
            ))
        }
    };

    let headers = std::str::from_utf8(header_bytes)
        .map_err(|_| BodyError::MalformedBody("part headers are not valid UTF-8"))?;

    let mut content_type = String::from("text/plain");
    let mut content_type_params = Vec::new();
    let mut content_disposition = None;
    let mut content_id = None;
    let mut content_transfer_encoding: Option<String> = None;

    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("Content-Type") {
            let (mt, params) = parse_content_type(value);
            content_type = mt;
            content_type_params = params;
        } else if name.eq_ignore_ascii_case("Content-Disposition") {
            content_disposition = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Content-ID") {
            content_id = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Content-Transfer-Encoding") {
            content_transfer_encoding = Some(value.to_string());
        }
    }

    let content = decode_payload(payload, &content_type, content_transfer_encoding.as_deref())?;
    Ok(BodyPart {
        content_type,
        content_type_params,
        content_disposition,
        content_id,
        content_transfer_encoding,
        content,
    })
}

/// Serialize parts into a multipart/mixed body with the given boundary.
///
/// The output round-trips through [`parse`] with content-types and
/// payload bytes preserved exactly.
pub fn build(parts: &[BodyPart], boundary: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(b"--");
        buf.extend_from_slice(boundary.as_bytes());
        buf.extend_from_slice(b"\r\n");

        buf.extend_from_slice(b"Content-Type: ");
        buf.extend_from_slice(part.content_type.as_bytes());
        for (name, value) in &part.content_type_params {
            let quoted = if value.contains(' ') || value.contains(';') {
                format!(";{name}=\"{value}\"")
            } else {
                format!(";{name}={value}")
            };
            buf.extend_from_slice(quoted.as_bytes());
        }
        buf.extend_from_slice(b"\r\n");

        if let Some(ref disposition) = part.content_disposition {
            buf.extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
        }
        if let Some(ref id) = part.content_id {
            buf.extend_from_slice(format!("Content-ID: {id}\r\n").as_bytes());
        }
        if let Some(ref encoding) = part.content_transfer_encoding {
            buf.extend_from_slice(
                format!("Content-Transfer-Encoding: {encoding}\r\n").as_bytes(),
            );
        }

        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(part.content.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"--");
    buf.extend_from_slice(boundary.as_bytes());
    buf.extend_from_slice(b"--\r\n");
    buf
}

//! SIP message model, wire codec and request builders (RFC 3261).
//!
//! A message is a start line, an ordered header list and an optional
//! body. Header names match case-insensitively (including the RFC 3261
//! compact forms) while stored names and values keep their original
//! case. The body is raw bytes; `Content-Length` is recomputed on
//! serialization so the invariant `Content-Length == body.len()` always
//! holds on the wire.

use std::fmt;

use thiserror::Error;

/// Version token on every start line.
pub const SIP_VERSION: &str = "SIP/2.0";

/// Magic cookie every RFC 3261 Via branch starts with.
pub const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SipParseError {
    #[error("malformed SIP message: {0}")]
    MalformedSip(&'static str),
}

/// Compact header forms (RFC 3261 §7.3.3 and table 20.1).
fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "s" | "S" => "Subject",
        "e" | "E" => "Content-Encoding",
        "k" | "K" => "Supported",
        other => other,
    }
}

fn header_name_matches(stored: &str, wanted: &str) -> bool {
    expand_compact(stored).eq_ignore_ascii_case(expand_compact(wanted))
}

/// Request line or status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Status { code: u16, reason: String },
}

/// A SIP request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start_line: StartLine,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SipMessage {
    pub fn request(method: &str, uri: &str) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn response(code: u16, reason: &str) -> Self {
        Self {
            start_line: StartLine::Status {
                code,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a response to `request` with the headers RFC 3261 §8.2.6
    /// copies from the request: Via list, From, To, Call-ID and CSeq.
    pub fn response_to(request: &SipMessage, code: u16, reason: &str) -> Self {
        let mut response = Self::response(code, reason);
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in request.headers(name) {
                response.add_header(name, value);
            }
        }
        response
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    /// Request method, or `None` for responses.
    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Status { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// First header matching `name` (full or compact form).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| header_name_matches(n, name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers matching `name`, in order.
    pub fn headers<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| header_name_matches(n, name))
            .map(|(_, v)| v.as_str())
    }

    /// Ordered view of every header.
    pub fn all_headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Append a header, preserving order of insertion.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replace the first matching header or append when absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| header_name_matches(n, name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.add_header(name, value),
        }
    }

    pub fn remove_headers(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !header_name_matches(n, name));
    }

    pub fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        self.set_header("Content-Type", content_type);
        self.body = body;
    }

    // --- Accessors for the headers the transaction layer relies on ---

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq as `(sequence number, method)`.
    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    /// Value of the topmost Via header.
    pub fn top_via(&self) -> Option<&str> {
        // A Via header field may itself hold a comma-separated list.
        self.header("Via").map(|v| match v.find(',') {
            Some(pos) => v[..pos].trim(),
            None => v,
        })
    }

    /// `branch` parameter of the topmost Via.
    pub fn top_via_branch(&self) -> Option<String> {
        let via = self.top_via()?;
        for param in via.split(';').skip(1) {
            let param = param.trim();
            if let Some(value) = param.strip_prefix("branch=") {
                return Some(value.trim().to_string());
            }
        }
        None
    }

    /// `tag` parameter of the To header.
    pub fn to_tag(&self) -> Option<String> {
        tag_param(self.header("To")?)
    }

    /// `tag` parameter of the From header.
    pub fn from_tag(&self) -> Option<String> {
        tag_param(self.header("From")?)
    }

    /// Parse a message from wire bytes.
    pub fn parse(data: &[u8]) -> Result<Self, SipParseError> {
        let header_end = find_crlf_crlf(data)
            .ok_or(SipParseError::MalformedSip("missing CRLF CRLF terminator"))?;
        let head = std::str::from_utf8(&data[..header_end])
            .map_err(|_| SipParseError::MalformedSip("header section is not UTF-8"))?;
        let rest = &data[header_end + 4..];

        let mut lines = unfold_lines(head);
        if lines.is_empty() {
            return Err(SipParseError::MalformedSip("empty message"));
        }
        let start_line = parse_start_line(&lines.remove(0))?;

        let mut headers = Vec::with_capacity(lines.len());
        for line in &lines {
            let (name, value) = line
                .split_once(':')
                .ok_or(SipParseError::MalformedSip("header line has no colon"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut message = Self {
            start_line,
            headers,
            body: Vec::new(),
        };

        // Body length is governed by Content-Length when present.
        let body = match message.header("Content-Length") {
            Some(value) => {
                let len: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| SipParseError::MalformedSip("bad Content-Length"))?;
                if rest.len() < len {
                    return Err(SipParseError::MalformedSip("body shorter than Content-Length"));
                }
                rest[..len].to_vec()
            }
            None => rest.to_vec(),
        };
        message.body = body;
        Ok(message)
    }

    /// Serialize to wire bytes. `Content-Length` is emitted from the
    /// actual body length, superseding any stored value, so the wire
    /// invariant holds no matter how the message was assembled.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start_line {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{method} {uri} {SIP_VERSION}\r\n"));
            }
            StartLine::Status { code, reason } => {
                out.push_str(&format!("{SIP_VERSION} {code} {reason}\r\n"));
            }
        }
        let mut wrote_length = false;
        for (name, value) in &self.headers {
            if header_name_matches(name, "Content-Length") {
                if !wrote_length {
                    out.push_str(&format!("{name}: {}\r\n", self.body.len()));
                    wrote_length = true;
                }
                continue;
            }
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if !wrote_length {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start_line {
            StartLine::Request { method, uri } => write!(f, "{method} {uri}"),
            StartLine::Status { code, reason } => write!(f, "{code} {reason}"),
        }
    }
}

fn tag_param(header_value: &str) -> Option<String> {
    for param in header_value.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("tag=") {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn find_crlf_crlf(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Split the header section into lines, unfolding RFC 3261 header
/// continuations (lines starting with whitespace).
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.split("\r\n") {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(raw.trim_start());
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

fn parse_start_line(line: &str) -> Result<StartLine, SipParseError> {
    if let Some(rest) = line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code_str, reason) = rest
            .split_once(' ')
            .unwrap_or((rest, ""));
        let code = code_str
            .parse()
            .map_err(|_| SipParseError::MalformedSip("bad status code"))?;
        return Ok(StartLine::Status {
            code,
            reason: reason.to_string(),
        });
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or(SipParseError::MalformedSip("empty start line"))?;
    let uri = parts
        .next()
        .ok_or(SipParseError::MalformedSip("request line has no URI"))?;
    let version = parts
        .next()
        .ok_or(SipParseError::MalformedSip("request line has no version"))?;
    if version != SIP_VERSION {
        return Err(SipParseError::MalformedSip("unsupported SIP version"));
    }
    Ok(StartLine::Request {
        method: method.to_string(),
        uri: uri.to_string(),
    })
}

/// Generate a new Via branch with the RFC 3261 magic cookie.
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, uuid::Uuid::new_v4().simple())
}

/// Transaction matching key (RFC 3261 §17.1.3 / §17.2.3): the top Via
/// branch plus the transaction-defining method. ACK is folded to INVITE
/// so it matches the transaction it acknowledges; for responses the
/// method comes from CSeq.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: String,
}

impl TransactionKey {
    pub fn of(message: &SipMessage) -> Result<Self, SipParseError> {
        let branch = message
            .top_via_branch()
            .ok_or(SipParseError::MalformedSip("no branch on top Via"))?;
        let method = match message.method() {
            Some(m) => m.to_string(),
            None => {
                message
                    .cseq()
                    .ok_or(SipParseError::MalformedSip("response has no CSeq"))?
                    .1
            }
        };
        let method = if method.eq_ignore_ascii_case("ACK") {
            "INVITE".to_string()
        } else {
            method.to_ascii_uppercase()
        };
        Ok(Self { branch, method })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// Build the ACK for a final response to an INVITE (RFC 3261 §17.1.1.3):
/// Request-URI, Call-ID, From, top Via and CSeq number come from the
/// INVITE, To (with its tag) comes from the response, Route headers are
/// copied from the INVITE.
pub fn build_ack(invite: &SipMessage, response: &SipMessage) -> Result<SipMessage, SipParseError> {
    let uri = invite
        .request_uri()
        .ok_or(SipParseError::MalformedSip("ACK source is not a request"))?;
    let mut ack = SipMessage::request("ACK", uri);

    let via = invite
        .top_via()
        .ok_or(SipParseError::MalformedSip("INVITE has no Via"))?;
    ack.add_header("Via", via);
    ack.add_header("Max-Forwards", "70");

    for route in invite.headers("Route") {
        ack.add_header("Route", route);
    }

    copy_required(invite, &mut ack, "From")?;
    copy_required(response, &mut ack, "To")?;
    copy_required(invite, &mut ack, "Call-ID")?;

    let (seq, _) = invite
        .cseq()
        .ok_or(SipParseError::MalformedSip("INVITE has no CSeq"))?;
    ack.add_header("CSeq", &format!("{seq} ACK"));
    Ok(ack)
}

/// Build the CANCEL for a pending INVITE (RFC 3261 §9.1): identical
/// Request-URI, Call-ID, From, To, top Via and CSeq number, with the
/// method replaced by CANCEL.
pub fn build_cancel(invite: &SipMessage) -> Result<SipMessage, SipParseError> {
    let uri = invite
        .request_uri()
        .ok_or(SipParseError::MalformedSip("CANCEL source is not a request"))?;
    let mut cancel = SipMessage::request("CANCEL", uri);

    let via = invite
        .top_via()
        .ok_or(SipParseError::MalformedSip("INVITE has no Via"))?;
    cancel.add_header("Via", via);
    cancel.add_header("Max-Forwards", "70");

    for route in invite.headers("Route") {
        cancel.add_header("Route", route);
    }

    copy_required(invite, &mut cancel, "From")?;
    copy_required(invite, &mut cancel, "To")?;
    copy_required(invite, &mut cancel, "Call-ID")?;

    let (seq, _) = invite
        .cseq()
        .ok_or(SipParseError::MalformedSip("INVITE has no CSeq"))?;
    cancel.add_header("CSeq", &format!("{seq} CANCEL"));
    Ok(cancel)
}

fn copy_required(
    from: &SipMessage,
    to: &mut SipMessage,
    name: &'static str,
) -> Result<(), SipParseError> {
    let value = from
        .header(name)
        .ok_or(SipParseError::MalformedSip("required header missing"))?
        .to_string();
    to.add_header(name, &value);
    Ok(())
}

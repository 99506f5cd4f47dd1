//! HTTP Digest authentication (RFC 2617) as used by SIP (RFC 3261 §22).
//!
//! Covers the MD5 response computation for both the `qop=auth` and the
//! legacy (no qop) forms, plus parsing and building of the
//! `WWW-Authenticate` / `Authorization` header values with the RFC 2617
//! quoting rules.

use md5::{Digest, Md5};
use thiserror::Error;

use super::message::SipMessage;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("malformed digest header: {0}")]
    Malformed(&'static str),
    #[error("unsupported digest scheme: {0}")]
    UnsupportedScheme(String),
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// `HA1 = MD5(username ":" realm ":" password)`.
pub fn digest_ha1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{username}:{realm}:{password}"))
}

/// `HA2 = MD5(method ":" uri)`.
pub fn digest_ha2(method: &str, uri: &str) -> String {
    md5_hex(&format!("{method}:{uri}"))
}

/// The digest response value.
///
/// With `qop=auth`: `MD5(HA1:nonce:nc:cnonce:qop:HA2)`; without qop the
/// legacy RFC 2069 form `MD5(HA1:nonce:HA2)`.
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nonce_count: Option<&str>,
    cnonce: Option<&str>,
    qop: Option<&str>,
) -> String {
    let ha1 = digest_ha1(username, realm, password);
    let ha2 = digest_ha2(method, uri);
    match qop {
        Some(qop) => {
            let nc = nonce_count.unwrap_or("00000001");
            let cnonce = cnonce.unwrap_or("");
            md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
        }
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

/// Split a `name=value, name="value"` parameter list, honoring quotes.
fn parse_params(input: &str) -> Result<Vec<(String, String)>, DigestError> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or(DigestError::Malformed("parameter has no '='"))?;
        let name = rest[..eq].trim().to_string();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let close = stripped
                .find('"')
                .ok_or(DigestError::Malformed("unterminated quoted value"))?;
            value = stripped[..close].to_string();
            rest = stripped[close + 1..].trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        params.push((name, value));

        rest = rest.trim_start();
        if let Some(stripped) = rest.strip_prefix(',') {
            rest = stripped.trim_start();
        } else if !rest.is_empty() {
            return Err(DigestError::Malformed("expected ',' between parameters"));
        }
    }
    Ok(params)
}

fn strip_digest_scheme(value: &str) -> Result<&str, DigestError> {
    let trimmed = value.trim();
    let (scheme, rest) = trimmed
        .split_once(char::is_whitespace)
        .ok_or(DigestError::Malformed("header has no parameters"))?;
    if !scheme.eq_ignore_ascii_case("Digest") {
        return Err(DigestError::UnsupportedScheme(scheme.to_string()));
    }
    Ok(rest)
}

fn quoted(name: &str, value: &str) -> String {
    format!("{name}=\"{value}\"")
}

/// A server challenge from `WWW-Authenticate` / `Proxy-Authenticate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn new(realm: &str, nonce: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            ..Default::default()
        }
    }

    /// Parse the header value, e.g.
    /// `Digest realm="ng911.example", nonce="abc", qop="auth"`.
    pub fn parse(value: &str) -> Result<Self, DigestError> {
        let params = parse_params(strip_digest_scheme(value)?)?;
        let mut challenge = Self::default();
        let mut saw_realm = false;
        let mut saw_nonce = false;
        for (name, value) in params {
            match name.to_ascii_lowercase().as_str() {
                "realm" => {
                    challenge.realm = value;
                    saw_realm = true;
                }
                "nonce" => {
                    challenge.nonce = value;
                    saw_nonce = true;
                }
                "opaque" => challenge.opaque = Some(value),
                "algorithm" => challenge.algorithm = Some(value),
                "qop" => challenge.qop = Some(value),
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
        if !saw_realm || !saw_nonce {
            return Err(DigestError::Malformed("challenge lacks realm or nonce"));
        }
        Ok(challenge)
    }

    /// Serialize to a header value.
    pub fn build(&self) -> String {
        let mut parts = vec![
            quoted("realm", &self.realm),
            quoted("nonce", &self.nonce),
        ];
        if let Some(ref opaque) = self.opaque {
            parts.push(quoted("opaque", opaque));
        }
        if let Some(ref algorithm) = self.algorithm {
            parts.push(format!("algorithm={algorithm}"));
        }
        if let Some(ref qop) = self.qop {
            parts.push(quoted("qop", qop));
        }
        if self.stale {
            parts.push("stale=true".to_string());
        }
        format!("Digest {}", parts.join(", "))
    }
}

/// Client credentials for `Authorization` / `Proxy-Authorization`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub nonce_count: Option<String>,
}

impl DigestCredentials {
    /// Answer a challenge for one request.
    pub fn answer(
        challenge: &DigestChallenge,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: Option<&str>,
    ) -> Self {
        // "auth-int" is not produced; when the server offers a qop list
        // we answer with plain "auth".
        let qop = challenge
            .qop
            .as_deref()
            .map(|q| {
                if q.split(',').any(|o| o.trim() == "auth") {
                    "auth"
                } else {
                    q
                }
            })
            .map(str::to_string);
        let nonce_count = qop.as_ref().map(|_| "00000001".to_string());
        let response = compute_response(
            username,
            &challenge.realm,
            password,
            method,
            uri,
            &challenge.nonce,
            nonce_count.as_deref(),
            cnonce,
            qop.as_deref(),
        );
        Self {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            algorithm: challenge.algorithm.clone(),
            cnonce: cnonce.map(str::to_string),
            opaque: challenge.opaque.clone(),
            qop,
            nonce_count,
        }
    }

    pub fn parse(value: &str) -> Result<Self, DigestError> {
        let params = parse_params(strip_digest_scheme(value)?)?;
        let mut creds = Self::default();
        for (name, value) in params {
            match name.to_ascii_lowercase().as_str() {
                "username" => creds.username = value,
                "realm" => creds.realm = value,
                "nonce" => creds.nonce = value,
                "uri" => creds.uri = value,
                "response" => creds.response = value,
                "algorithm" => creds.algorithm = Some(value),
                "cnonce" => creds.cnonce = Some(value),
                "opaque" => creds.opaque = Some(value),
                "qop" => creds.qop = Some(value),
                "nc" => creds.nonce_count = Some(value),
                _ => {}
            }
        }
        if creds.username.is_empty() || creds.response.is_empty() {
            return Err(DigestError::Malformed("credentials lack username or response"));
        }
        Ok(creds)
    }

    pub fn build(&self) -> String {
        let mut parts = vec![
            quoted("username", &self.username),
            quoted("realm", &self.realm),
            quoted("nonce", &self.nonce),
            quoted("uri", &self.uri),
            quoted("response", &self.response),
        ];
        if let Some(ref algorithm) = self.algorithm {
            parts.push(format!("algorithm={algorithm}"));
        }
        if let Some(ref cnonce) = self.cnonce {
            parts.push(quoted("cnonce", cnonce));
        }
        if let Some(ref opaque) = self.opaque {
            parts.push(quoted("opaque", opaque));
        }
        // qop and nc travel unquoted in Authorization headers.
        if let Some(ref qop) = self.qop {
            parts.push(format!("qop={qop}"));
        }
        if let Some(ref nc) = self.nonce_count {
            parts.push(format!("nc={nc}"));
        }
        format!("Digest {}", parts.join(", "))
    }

    /// Recompute the expected response for these credentials and check
    /// it, server side.
    pub fn verify(&self, password: &str, method: &str) -> bool {
        let expected = compute_response(
            &self.username,
            &self.realm,
            password,
            method,
            &self.uri,
            &self.nonce,
            self.nonce_count.as_deref(),
            self.cnonce.as_deref(),
            self.qop.as_deref(),
        );
        expected == self.response
    }
}

/// Answer a 401/407 challenge in place: compute credentials for the
/// request's method and Request-URI and attach the `Authorization`
/// header, replacing any stale one.
pub fn authorize_request(
    request: &mut SipMessage,
    challenge_value: &str,
    username: &str,
    password: &str,
    cnonce: Option<&str>,
) -> Result<(), DigestError> {
    let challenge = DigestChallenge::parse(challenge_value)?;
    let method = request
        .method()
        .ok_or(DigestError::Malformed("cannot authorize a response"))?
        .to_string();
    let uri = request
        .request_uri()
        .ok_or(DigestError::Malformed("request has no URI"))?
        .to_string();
    let credentials =
        DigestCredentials::answer(&challenge, username, password, &method, &uri, cnonce);
    request.set_header("Authorization", &credentials.build());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2617_example_vector() {
        // RFC 2617 §3.5: the canonical worked example.
        let response = compute_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some("00000001"),
            Some("0a4f113b"),
            Some("auth"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_legacy_no_qop_form() {
        // Without qop the nc/cnonce fields are excluded from the hash.
        let with = compute_response("u", "r", "p", "INVITE", "sip:a@b", "n", None, None, None);
        let again = compute_response("u", "r", "p", "INVITE", "sip:a@b", "n", None, None, None);
        assert_eq!(with, again);
        assert_eq!(with.len(), 32);
    }

    #[test]
    fn test_challenge_roundtrip() {
        let mut challenge = DigestChallenge::new("ng911.example.gov", "84f1c1d3");
        challenge.qop = Some("auth".to_string());
        challenge.opaque = Some("5ccc069c403ebaf9".to_string());
        challenge.algorithm = Some("MD5".to_string());

        let parsed = DigestChallenge::parse(&challenge.build()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_parse_unquotes_values() {
        let value = "Digest realm=\"a b\", nonce=\"xyz\", algorithm=MD5, stale=TRUE";
        let challenge = DigestChallenge::parse(value).unwrap();
        assert_eq!(challenge.realm, "a b");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert!(challenge.stale);
    }

    #[test]
    fn test_answer_and_verify() {
        let mut challenge = DigestChallenge::new("psap.example.gov", "f3a9b1");
        challenge.qop = Some("auth,auth-int".to_string());

        let creds = DigestCredentials::answer(
            &challenge,
            "dispatcher",
            "s3cret",
            "REGISTER",
            "sip:psap.example.gov",
            Some("9fxk21"),
        );
        assert_eq!(creds.qop.as_deref(), Some("auth"));
        assert!(creds.verify("s3cret", "REGISTER"));
        assert!(!creds.verify("wrong", "REGISTER"));

        let reparsed = DigestCredentials::parse(&creds.build()).unwrap();
        assert_eq!(reparsed, creds);
        assert!(reparsed.verify("s3cret", "REGISTER"));
    }

    #[test]
    fn test_authorize_request_attaches_header() {
        let mut register = SipMessage::request("REGISTER", "sip:psap.example.gov");
        register.add_header("Via", "SIP/2.0/UDP h;branch=z9hG4bKreg1");
        register.add_header("CSeq", "1 REGISTER");

        let challenge =
            "Digest realm=\"psap.example.gov\", nonce=\"n0nce\", qop=\"auth\"";
        authorize_request(&mut register, challenge, "dispatcher", "s3cret", Some("cn1"))
            .unwrap();

        let header = register.header("Authorization").unwrap();
        let creds = DigestCredentials::parse(header).unwrap();
        assert_eq!(creds.username, "dispatcher");
        assert_eq!(creds.uri, "sip:psap.example.gov");
        assert!(creds.verify("s3cret", "REGISTER"));
    }

    #[test]
    fn test_rejects_non_digest_scheme() {
        assert_eq!(
            DigestChallenge::parse("Basic realm=\"x\""),
            Err(DigestError::UnsupportedScheme("Basic".to_string()))
        );
    }

    #[test]
    fn test_missing_realm_or_nonce() {
        assert!(DigestChallenge::parse("Digest nonce=\"x\"").is_err());
        assert!(DigestChallenge::parse("Digest realm=\"x\"").is_err());
    }
}

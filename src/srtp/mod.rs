//! SRTP/SRTCP key derivation and packet transforms (RFC 3711).
//!
//! Supports the four DTLS-SRTP protection profiles of RFC 5764 §4.1.2:
//! AES-CM with 80- or 32-bit HMAC-SHA1 tags, and the NULL-cipher
//! variants used for conformance testing. Each [`SrtpStream`] holds the
//! state for one direction (rollover counter, replay window, SRTCP
//! index); callers wrap a stream in their own mutex when sharing it
//! across threads.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use thiserror::Error;

use crate::rtp;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Master key length for AES-128 (bytes).
pub const MASTER_KEY_LEN: usize = 16;

/// Master salt length (bytes, RFC 3711).
pub const MASTER_SALT_LEN: usize = 14;

/// SRTP key derivation labels (RFC 3711 §4.3.1 and §4.3.2).
const LABEL_RTP_CIPHER_KEY: u8 = 0x00;
const LABEL_RTP_AUTH_KEY: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_CIPHER_KEY: u8 = 0x03;
const LABEL_RTCP_AUTH_KEY: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

/// Minimum RTCP header covered by SRTCP: V/P/RC, PT, length, SSRC.
const RTCP_HEADER_LEN: usize = 8;

/// Width of the inbound anti-replay window in packets.
const REPLAY_WINDOW_BITS: u64 = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SrtpError {
    #[error("packet too short for SRTP processing")]
    PacketTooShort,
    #[error("authentication tag mismatch")]
    AuthenticationFailure,
    #[error("packet index already seen or too old")]
    ReplayedPacket,
    #[error("malformed RTP header: {0}")]
    BadRtpHeader(&'static str),
    #[error("unsupported SRTP profile: {0}")]
    UnsupportedProfile(String),
    #[error("keying material block too short for the negotiated profile")]
    ShortKeyingMaterial,
}

/// DTLS-SRTP protection profiles (RFC 5764 §4.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpProfile {
    #[serde(rename = "AES128_CM_HMAC_SHA1_80")]
    Aes128CmHmacSha1_80,
    #[serde(rename = "AES128_CM_HMAC_SHA1_32")]
    Aes128CmHmacSha1_32,
    #[serde(rename = "NULL_HMAC_SHA1_80")]
    NullHmacSha1_80,
    #[serde(rename = "NULL_HMAC_SHA1_32")]
    NullHmacSha1_32,
}

impl SrtpProfile {
    pub fn key_len(&self) -> usize {
        MASTER_KEY_LEN
    }

    pub fn salt_len(&self) -> usize {
        MASTER_SALT_LEN
    }

    /// Whether the profile encrypts payloads at all.
    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            SrtpProfile::Aes128CmHmacSha1_80 | SrtpProfile::Aes128CmHmacSha1_32
        )
    }

    /// SRTP (RTP-direction) authentication tag length in bytes.
    pub fn rtp_auth_tag_len(&self) -> usize {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 | SrtpProfile::NullHmacSha1_80 => 10,
            SrtpProfile::Aes128CmHmacSha1_32 | SrtpProfile::NullHmacSha1_32 => 4,
        }
    }

    /// SRTCP tags stay 80 bits even for the `_32` profiles (RFC 3711).
    pub fn rtcp_auth_tag_len(&self) -> usize {
        10
    }

    /// The profile name as it appears in `use_srtp` and SDP.
    pub fn name(&self) -> &'static str {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => "SRTP_AES128_CM_SHA1_80",
            SrtpProfile::Aes128CmHmacSha1_32 => "SRTP_AES128_CM_SHA1_32",
            SrtpProfile::NullHmacSha1_80 => "SRTP_NULL_SHA1_80",
            SrtpProfile::NullHmacSha1_32 => "SRTP_NULL_SHA1_32",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, SrtpError> {
        match name {
            "SRTP_AES128_CM_SHA1_80" => Ok(SrtpProfile::Aes128CmHmacSha1_80),
            "SRTP_AES128_CM_SHA1_32" => Ok(SrtpProfile::Aes128CmHmacSha1_32),
            "SRTP_NULL_SHA1_80" => Ok(SrtpProfile::NullHmacSha1_80),
            "SRTP_NULL_SHA1_32" => Ok(SrtpProfile::NullHmacSha1_32),
            other => Err(SrtpError::UnsupportedProfile(other.to_string())),
        }
    }

    /// The policy applied to RTP packets under this profile.
    pub fn rtp_policy(&self) -> SrtpPolicy {
        SrtpPolicy {
            profile: *self,
            auth_tag_len: self.rtp_auth_tag_len(),
            encrypted: self.is_encrypted(),
        }
    }

    /// The policy applied to RTCP packets under this profile.
    pub fn rtcp_policy(&self) -> SrtpPolicy {
        SrtpPolicy {
            profile: *self,
            auth_tag_len: self.rtcp_auth_tag_len(),
            encrypted: self.is_encrypted(),
        }
    }
}

/// Concrete transform parameters for one packet family (RTP or RTCP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrtpPolicy {
    pub profile: SrtpProfile,
    pub auth_tag_len: usize,
    pub encrypted: bool,
}

/// Master key + salt for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterKey {
    pub key: [u8; MASTER_KEY_LEN],
    pub salt: [u8; MASTER_SALT_LEN],
}

/// The four secrets carved out of the DTLS exporter block
/// (RFC 5764 §4.2): client write key, server write key, client salt,
/// server salt, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyingMaterial {
    pub client: MasterKey,
    pub server: MasterKey,
}

/// Split the exporter output into per-side master keys and salts.
/// Layout: `client_key ‖ server_key ‖ client_salt ‖ server_salt`.
pub fn partition_keying_material(
    block: &[u8],
    key_len: usize,
    salt_len: usize,
) -> Result<KeyingMaterial, SrtpError> {
    if block.len() < 2 * (key_len + salt_len)
        || key_len != MASTER_KEY_LEN
        || salt_len != MASTER_SALT_LEN
    {
        return Err(SrtpError::ShortKeyingMaterial);
    }
    let mut client = MasterKey {
        key: [0; MASTER_KEY_LEN],
        salt: [0; MASTER_SALT_LEN],
    };
    let mut server = client.clone();
    client.key.copy_from_slice(&block[..key_len]);
    server.key.copy_from_slice(&block[key_len..2 * key_len]);
    client
        .salt
        .copy_from_slice(&block[2 * key_len..2 * key_len + salt_len]);
    server
        .salt
        .copy_from_slice(&block[2 * key_len + salt_len..2 * (key_len + salt_len)]);
    Ok(KeyingMaterial { client, server })
}

/// Session keys derived from a master key for one packet family.
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub cipher_key: [u8; 16],
    pub auth_key: [u8; 20],
    pub salt: [u8; 14],
}

/// AES-CM PRF for key derivation (RFC 3711 §4.3.1), with
/// key_derivation_rate = 0 so the derivation input index is always 0.
fn prf_derive(
    master_key: &[u8; MASTER_KEY_LEN],
    master_salt: &[u8; MASTER_SALT_LEN],
    label: u8,
    output_len: usize,
) -> Vec<u8> {
    // x = label positioned at byte 7 of a 14-byte block; IV = salt XOR x
    // extended with a 16-bit zero block counter.
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[7] ^= label;

    let mut output = vec![0u8; output_len];
    let mut cipher = Aes128Ctr::new(master_key.into(), &iv.into());
    cipher.apply_keystream(&mut output);
    output
}

/// Derive the RTP-direction session keys (labels 0x00-0x02).
pub fn derive_rtp_session_keys(master: &MasterKey) -> SessionKeys {
    derive_session_keys(master, LABEL_RTP_CIPHER_KEY, LABEL_RTP_AUTH_KEY, LABEL_RTP_SALT)
}

/// Derive the RTCP-direction session keys (labels 0x03-0x05).
pub fn derive_rtcp_session_keys(master: &MasterKey) -> SessionKeys {
    derive_session_keys(
        master,
        LABEL_RTCP_CIPHER_KEY,
        LABEL_RTCP_AUTH_KEY,
        LABEL_RTCP_SALT,
    )
}

fn derive_session_keys(master: &MasterKey, cipher_label: u8, auth_label: u8, salt_label: u8) -> SessionKeys {
    let cipher = prf_derive(&master.key, &master.salt, cipher_label, 16);
    let auth = prf_derive(&master.key, &master.salt, auth_label, 20);
    let salt = prf_derive(&master.key, &master.salt, salt_label, 14);

    let mut keys = SessionKeys {
        cipher_key: [0; 16],
        auth_key: [0; 20],
        salt: [0; 14],
    };
    keys.cipher_key.copy_from_slice(&cipher);
    keys.auth_key.copy_from_slice(&auth);
    keys.salt.copy_from_slice(&salt);
    keys
}

/// Sliding anti-replay window (RFC 3711 §3.3.2).
#[derive(Debug, Default)]
struct ReplayWindow {
    latest: u64,
    mask: u64,
    seen_any: bool,
}

impl ReplayWindow {
    /// Accept the index if it is new, recording it; reject duplicates
    /// and indexes older than the window.
    fn check_and_update(&mut self, index: u64) -> bool {
        if !self.seen_any {
            self.seen_any = true;
            self.latest = index;
            self.mask = 1;
            return true;
        }
        if index > self.latest {
            let shift = index - self.latest;
            self.mask = if shift >= REPLAY_WINDOW_BITS {
                1
            } else {
                (self.mask << shift) | 1
            };
            self.latest = index;
            return true;
        }
        let age = self.latest - index;
        if age >= REPLAY_WINDOW_BITS {
            return false;
        }
        let bit = 1u64 << age;
        if self.mask & bit != 0 {
            return false;
        }
        self.mask |= bit;
        true
    }
}

/// One direction of an SRTP/SRTCP transform.
pub struct SrtpStream {
    rtp_policy: SrtpPolicy,
    rtcp_policy: SrtpPolicy,
    rtp_keys: SessionKeys,
    rtcp_keys: SessionKeys,
    /// Rollover counter for the RTP direction.
    roc: u32,
    highest_seq: u16,
    seen_any: bool,
    replay: ReplayWindow,
    /// 31-bit SRTCP index for outbound packets.
    srtcp_index: u32,
    rtcp_replay: ReplayWindow,
}

impl SrtpStream {
    /// Derive all session keys for one direction from its master key.
    pub fn new(profile: SrtpProfile, master: &MasterKey) -> Self {
        Self {
            rtp_policy: profile.rtp_policy(),
            rtcp_policy: profile.rtcp_policy(),
            rtp_keys: derive_rtp_session_keys(master),
            rtcp_keys: derive_rtcp_session_keys(master),
            roc: 0,
            highest_seq: 0,
            seen_any: false,
            replay: ReplayWindow::default(),
            srtcp_index: 0,
            rtcp_replay: ReplayWindow::default(),
        }
    }

    pub fn rtp_policy(&self) -> SrtpPolicy {
        self.rtp_policy
    }

    pub fn rtcp_policy(&self) -> SrtpPolicy {
        self.rtcp_policy
    }

    /// Transform a complete RTP packet into an SRTP packet.
    pub fn protect(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        let header_len = rtp::full_header_len(packet)
            .ok_or(SrtpError::BadRtpHeader("truncated header"))?;
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);

        let roc = self.advance_sender_index(seq);

        let mut out = Vec::with_capacity(packet.len() + self.rtp_policy.auth_tag_len);
        out.extend_from_slice(packet);
        if self.rtp_policy.encrypted {
            let iv = build_rtp_iv(&self.rtp_keys.salt, ssrc, roc, seq);
            let mut cipher = Aes128Ctr::new((&self.rtp_keys.cipher_key).into(), &iv.into());
            cipher.apply_keystream(&mut out[header_len..]);
        }

        let tag = rtp_auth_tag(&self.rtp_keys.auth_key, &out, roc, self.rtp_policy.auth_tag_len);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify and reverse an SRTP packet into a plain RTP packet.
    pub fn unprotect(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        let tag_len = self.rtp_policy.auth_tag_len;
        if packet.len() < rtp::RTP_HEADER_SIZE + tag_len {
            return Err(SrtpError::PacketTooShort);
        }
        let tag_offset = packet.len() - tag_len;
        let (authenticated, received_tag) = packet.split_at(tag_offset);

        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let roc = estimate_roc(self.roc, self.highest_seq, self.seen_any, seq);

        let expected = rtp_auth_tag(&self.rtp_keys.auth_key, authenticated, roc, tag_len);
        if expected != received_tag {
            return Err(SrtpError::AuthenticationFailure);
        }

        let index = ((roc as u64) << 16) | seq as u64;
        if !self.replay.check_and_update(index) {
            return Err(SrtpError::ReplayedPacket);
        }

        let header_len = rtp::full_header_len(authenticated)
            .ok_or(SrtpError::BadRtpHeader("truncated header"))?;
        let mut out = authenticated.to_vec();
        if self.rtp_policy.encrypted {
            let iv = build_rtp_iv(&self.rtp_keys.salt, ssrc, roc, seq);
            let mut cipher = Aes128Ctr::new((&self.rtp_keys.cipher_key).into(), &iv.into());
            cipher.apply_keystream(&mut out[header_len..]);
        }

        if !self.seen_any || seq_newer(seq, self.highest_seq) || roc > self.roc {
            self.seen_any = true;
            self.highest_seq = seq;
            self.roc = roc;
        }
        Ok(out)
    }

    /// Transform a complete RTCP compound packet into SRTCP.
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        if packet.len() < RTCP_HEADER_LEN {
            return Err(SrtpError::PacketTooShort);
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let index = self.srtcp_index;
        self.srtcp_index = index.wrapping_add(1) & 0x7FFF_FFFF;

        let mut out =
            Vec::with_capacity(packet.len() + 4 + self.rtcp_policy.auth_tag_len);
        out.extend_from_slice(packet);
        if self.rtcp_policy.encrypted {
            let iv = build_rtcp_iv(&self.rtcp_keys.salt, ssrc, index);
            let mut cipher = Aes128Ctr::new((&self.rtcp_keys.cipher_key).into(), &iv.into());
            cipher.apply_keystream(&mut out[RTCP_HEADER_LEN..]);
        }

        let e_flag = if self.rtcp_policy.encrypted {
            0x8000_0000
        } else {
            0
        };
        out.extend_from_slice(&(e_flag | index).to_be_bytes());

        let tag = rtcp_auth_tag(&self.rtcp_keys.auth_key, &out, self.rtcp_policy.auth_tag_len);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify and reverse an SRTCP packet.
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>, SrtpError> {
        let tag_len = self.rtcp_policy.auth_tag_len;
        if packet.len() < RTCP_HEADER_LEN + 4 + tag_len {
            return Err(SrtpError::PacketTooShort);
        }
        let tag_offset = packet.len() - tag_len;
        let (authenticated, received_tag) = packet.split_at(tag_offset);

        let expected = rtcp_auth_tag(&self.rtcp_keys.auth_key, authenticated, tag_len);
        if expected != received_tag {
            return Err(SrtpError::AuthenticationFailure);
        }

        let index_offset = tag_offset - 4;
        let e_index = u32::from_be_bytes([
            packet[index_offset],
            packet[index_offset + 1],
            packet[index_offset + 2],
            packet[index_offset + 3],
        ]);
        let encrypted = e_index & 0x8000_0000 != 0;
        let index = e_index & 0x7FFF_FFFF;

        if !self.rtcp_replay.check_and_update(index as u64) {
            return Err(SrtpError::ReplayedPacket);
        }

        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let mut out = authenticated[..index_offset].to_vec();
        if encrypted {
            let iv = build_rtcp_iv(&self.rtcp_keys.salt, ssrc, index);
            let mut cipher = Aes128Ctr::new((&self.rtcp_keys.cipher_key).into(), &iv.into());
            cipher.apply_keystream(&mut out[RTCP_HEADER_LEN..]);
        }
        Ok(out)
    }

    /// Track the sender-side packet index, bumping the ROC when the
    /// sequence number wraps.
    fn advance_sender_index(&mut self, seq: u16) -> u32 {
        if self.seen_any && seq < self.highest_seq && self.highest_seq - seq > 0x8000 {
            self.roc = self.roc.wrapping_add(1);
        }
        if !self.seen_any || seq_newer(seq, self.highest_seq) {
            self.highest_seq = seq;
        }
        self.seen_any = true;
        self.roc
    }
}

/// Whether `a` is newer than `b` in 16-bit sequence space.
fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Estimate the rollover counter for a received sequence number
/// (RFC 3711 appendix A).
fn estimate_roc(roc: u32, highest_seq: u16, seen_any: bool, seq: u16) -> u32 {
    if !seen_any {
        return 0;
    }
    let diff = seq as i32 - highest_seq as i32;
    if diff < -0x7FFF {
        roc.wrapping_add(1)
    } else if diff > 0x7FFF {
        roc.wrapping_sub(1)
    } else {
        roc
    }
}

/// AES-CM IV for SRTP (RFC 3711 §4.1.1):
/// `(salt * 2^16) XOR (ssrc * 2^64) XOR (index * 2^16)`.
fn build_rtp_iv(salt: &[u8; 14], ssrc: u32, roc: u32, seq: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[8..12].copy_from_slice(&roc.to_be_bytes());
    iv[12..14].copy_from_slice(&seq.to_be_bytes());
    for i in 0..14 {
        iv[i] ^= salt[i];
    }
    iv
}

/// AES-CM IV for SRTCP: the 48-bit index field holds the 31-bit SRTCP
/// index right-aligned.
fn build_rtcp_iv(salt: &[u8; 14], ssrc: u32, index: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[4..8].copy_from_slice(&ssrc.to_be_bytes());
    iv[10..14].copy_from_slice(&index.to_be_bytes());
    for i in 0..14 {
        iv[i] ^= salt[i];
    }
    iv
}

/// HMAC-SHA1 over `packet || roc`, truncated to the policy tag length.
fn rtp_auth_tag(auth_key: &[u8; 20], authenticated: &[u8], roc: u32, tag_len: usize) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(auth_key).expect("HMAC accepts any key length");
    mac.update(authenticated);
    mac.update(&roc.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    digest[..tag_len].to_vec()
}

/// HMAC-SHA1 over the packet (the E+index word is already appended).
fn rtcp_auth_tag(auth_key: &[u8; 20], authenticated: &[u8], tag_len: usize) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(auth_key).expect("HMAC accepts any key length");
    mac.update(authenticated);
    let digest = mac.finalize().into_bytes();
    digest[..tag_len].to_vec()
}

//! Engine configuration records.
//!
//! Every tunable the protocol core exposes lives here as a plain record
//! passed at construction time. There is no process-wide state; two
//! engines in one process can run with different timer tables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::srtp::SrtpProfile;

/// RFC 3261 transaction timers, all in milliseconds.
///
/// The derived timers (B, D, H, I, J) default to their RFC values
/// computed from T1/T2/T4 but may be overridden individually, which the
/// tests rely on to compress 32-second timeouts into milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipTimers {
    /// RTT estimate (RFC 3261 default 500 ms).
    pub t1_ms: u64,
    /// Maximum retransmit interval for non-INVITE requests and INVITE
    /// responses (default 4 s).
    pub t2_ms: u64,
    /// Maximum duration a message remains in the network (default 5 s).
    pub t4_ms: u64,
    /// INVITE client transaction timeout (Timer B, default 64*T1).
    pub timer_b_ms: u64,
    /// Wait time for response retransmissions in INVITE client
    /// `Completed` (Timer D, default 32 s; only armed on UDP).
    pub timer_d_ms: u64,
    /// Initial INVITE server response retransmit interval
    /// (Timer G, default min(2*T1, T2); doubles up to T2, UDP only).
    pub timer_g_ms: u64,
    /// Wait time for ACK in INVITE server `Completed` (Timer H,
    /// default 64*T1).
    pub timer_h_ms: u64,
    /// Wait time for ACK retransmissions in INVITE server `Confirmed`
    /// (Timer I, default T4; only armed on UDP).
    pub timer_i_ms: u64,
    /// Wait time for request retransmissions in non-INVITE server
    /// `Completed` (Timer J, default 64*T1; only armed on UDP).
    pub timer_j_ms: u64,
}

impl Default for SipTimers {
    fn default() -> Self {
        let t1 = 500;
        let t2 = 4_000;
        let t4 = 5_000;
        Self {
            t1_ms: t1,
            t2_ms: t2,
            t4_ms: t4,
            timer_b_ms: 64 * t1,
            timer_d_ms: 32_000,
            timer_g_ms: (2 * t1).min(t2),
            timer_h_ms: 64 * t1,
            timer_i_ms: t4,
            timer_j_ms: 64 * t1,
        }
    }
}

impl SipTimers {
    /// Non-INVITE client transaction timeout (Timer F = Timer B).
    pub fn timer_f(&self) -> Duration {
        Duration::from_millis(self.timer_b_ms)
    }

    /// Non-INVITE client `Completed` linger (Timer K = T4, UDP only).
    pub fn timer_k(&self) -> Duration {
        Duration::from_millis(self.t4_ms)
    }

    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn timer_b(&self) -> Duration {
        Duration::from_millis(self.timer_b_ms)
    }

    pub fn timer_d(&self) -> Duration {
        Duration::from_millis(self.timer_d_ms)
    }

    pub fn timer_g(&self) -> Duration {
        Duration::from_millis(self.timer_g_ms)
    }

    pub fn timer_h(&self) -> Duration {
        Duration::from_millis(self.timer_h_ms)
    }

    pub fn timer_i(&self) -> Duration {
        Duration::from_millis(self.timer_i_ms)
    }

    pub fn timer_j(&self) -> Duration {
        Duration::from_millis(self.timer_j_ms)
    }
}

/// MSRP session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsrpConfig {
    /// Maximum size of a reassembled message before the session answers
    /// 413 (default 10 MB).
    pub max_message_bytes: usize,
    /// Payload bytes per outgoing SEND chunk (default 2048).
    pub chunk_payload_bytes: usize,
}

impl Default for MsrpConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 10 * 1024 * 1024,
            chunk_payload_bytes: 2048,
        }
    }
}

/// DTLS handshake timing and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtlsConfig {
    /// Overall handshake deadline (default 20 s).
    pub handshake_timeout_ms: u64,
    /// Initial receive back-off before a flight is retransmitted
    /// (default 100 ms).
    pub retransmit_min_ms: u64,
    /// Back-off ceiling (default 6 s).
    pub retransmit_max_ms: u64,
    /// Refuse key export when the peer did not negotiate the extended
    /// master secret (RFC 7627). Default true.
    pub require_extended_master_secret: bool,
}

impl Default for DtlsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 20_000,
            retransmit_min_ms: 100,
            retransmit_max_ms: 6_000,
            require_extended_master_secret: true,
        }
    }
}

impl DtlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn retransmit_min(&self) -> Duration {
        Duration::from_millis(self.retransmit_min_ms)
    }

    pub fn retransmit_max(&self) -> Duration {
        Duration::from_millis(self.retransmit_max_ms)
    }
}

/// SRTP protection profile selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrtpConfig {
    /// Profile offered first in `use_srtp` and assumed when negotiation
    /// is unavailable (default `AES128_CM_HMAC_SHA1_80`).
    pub default_profile: SrtpProfile,
}

impl Default for SrtpConfig {
    fn default() -> Self {
        Self {
            default_profile: SrtpProfile::Aes128CmHmacSha1_80,
        }
    }
}

/// Certificate fingerprint digests the engine will compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintHash {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

/// Digest-algorithm whitelist for certificate fingerprints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    pub supported_hashes: Vec<FingerprintHash>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            supported_hashes: vec![
                FingerprintHash::Sha1,
                FingerprintHash::Sha224,
                FingerprintHash::Sha256,
                FingerprintHash::Sha384,
                FingerprintHash::Sha512,
            ],
        }
    }
}

/// Bundle of every configurable subsystem, suitable for deserializing
/// from an application's own configuration source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sip_timers: SipTimers,
    #[serde(default)]
    pub msrp: MsrpConfig,
    #[serde(default)]
    pub dtls: DtlsConfig,
    #[serde(default)]
    pub srtp: SrtpConfig,
    #[serde(default)]
    pub digest: DigestConfig,
}

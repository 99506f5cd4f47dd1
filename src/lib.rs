//! NG9-1-1 real-time communications protocol engine.
//!
//! The core protocol layers used by emergency-services SIP endpoints:
//!
//! - [`sip`] — the RFC 3261 §17 transaction layer (client/server INVITE
//!   and non-INVITE state machines, timers, CANCEL coordination) plus
//!   HTTP Digest authentication.
//! - [`dtls`] + [`srtp`] — DTLS-SRTP handshake over a pluggable datagram
//!   substrate, RFC 5764 key export, and RFC 3711 packet transforms.
//! - [`msrp`] — MSRP chunk framing, message reassembly and REPORT
//!   handling over a reliable byte stream (RFC 4975).
//! - [`rtp`] — RTP/RTCP framing, telephone-event DTMF, and the RFC 4103
//!   real-time text redundancy receiver.
//! - [`body`] — binary-safe multipart/mixed and message/CPIM codecs
//!   shared by SIP and MSRP.
//!
//! Network I/O, SDP, codecs and certificate provisioning are external
//! collaborators: the engine consumes abstract transports and pre-built
//! certificate material, and produces/accepts wire-format bytes.

pub mod body;
pub mod config;
pub mod dtls;
pub mod msrp;
pub mod rtp;
pub mod sip;
pub mod srtp;

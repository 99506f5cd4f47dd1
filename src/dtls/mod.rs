//! DTLS-SRTP peer (RFC 5764) over the queue-backed datagram substrate.
//!
//! The peer runs a DTLS handshake as client or server, negotiates an
//! SRTP protection profile through the `use_srtp` extension, and after
//! completion exports the SRTP master keys and salts with the RFC 5705
//! exporter (label `EXTRACTOR-dtls_srtp`). Certificates are supplied by
//! the application; verification here accepts any chain and the
//! application compares the remote fingerprint against the one signaled
//! in SDP.
//!
//! `do_handshake` blocks and is meant to run on a dedicated thread; the
//! application feeds received datagrams through the peer's
//! [`DatagramQueue`] and forwards outgoing datagrams from the
//! `on_data_ready` callback to its socket.

pub mod transport;

use openssl::error::ErrorStack;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use thiserror::Error;

use crate::config::{DigestConfig, DtlsConfig, FingerprintHash};
use crate::srtp::{
    partition_keying_material, KeyingMaterial, MasterKey, SrtpPolicy, SrtpProfile, SrtpStream,
};

pub use transport::{datagram_pair, DataReadyCallback, DatagramQueue, QueueIo};

#[derive(Debug, Error)]
pub enum DtlsError {
    #[error("handshake deadline expired")]
    HandshakeTimeout,
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),
    #[error("peer did not negotiate the extended master secret")]
    ExtendedMasterSecretRequired,
    #[error("no mutually supported SRTP profile")]
    UnsupportedProfile,
    #[error("fingerprint hash algorithm not enabled: {0}")]
    HashAlgorithmUnsupported(String),
    #[error("transport closed")]
    ConnectionClosed,
    #[error("handshake has not completed")]
    NotCompleted,
    #[error("TLS library error: {0}")]
    Tls(#[from] ErrorStack),
}

/// Pre-built certificate material for one peer. Generation and parsing
/// happen outside the engine.
pub struct DtlsIdentity {
    pub certificate: X509,
    /// Intermediates, leaf-first. Usually empty for self-signed
    /// WebRTC-style certificates.
    pub chain: Vec<X509>,
    pub private_key: PKey<Private>,
}

impl DtlsIdentity {
    /// Fingerprint of the local leaf certificate, for SDP `a=fingerprint`.
    pub fn fingerprint(&self, hash: FingerprintHash) -> Result<String, DtlsError> {
        fingerprint_of(&self.certificate, hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DtlsRole {
    Client,
    Server,
}

/// Everything captured at `handshake_complete`.
struct HandshakeOutcome {
    profile: SrtpProfile,
    keying: KeyingMaterial,
    remote_certificate: X509,
}

/// A DTLS-SRTP endpoint, either side of the handshake.
pub struct DtlsPeer {
    role: DtlsRole,
    ctx: SslContext,
    config: DtlsConfig,
    digest: DigestConfig,
    queue: DatagramQueue,
    io: Option<QueueIo>,
    outcome: Option<HandshakeOutcome>,
}

impl DtlsPeer {
    /// Build the client side. `profiles` is the `use_srtp` offer in
    /// preference order; outgoing datagrams flow to `on_data_ready`.
    pub fn client(
        identity: &DtlsIdentity,
        config: DtlsConfig,
        digest: DigestConfig,
        profiles: &[SrtpProfile],
        on_data_ready: DataReadyCallback,
    ) -> Result<Self, DtlsError> {
        Self::new(DtlsRole::Client, identity, config, digest, profiles, on_data_ready)
    }

    /// Build the server side. The server answers with its first
    /// profile in `profiles` that the client also offered.
    pub fn server(
        identity: &DtlsIdentity,
        config: DtlsConfig,
        digest: DigestConfig,
        profiles: &[SrtpProfile],
        on_data_ready: DataReadyCallback,
    ) -> Result<Self, DtlsError> {
        Self::new(DtlsRole::Server, identity, config, digest, profiles, on_data_ready)
    }

    fn new(
        role: DtlsRole,
        identity: &DtlsIdentity,
        config: DtlsConfig,
        digest: DigestConfig,
        profiles: &[SrtpProfile],
        on_data_ready: DataReadyCallback,
    ) -> Result<Self, DtlsError> {
        if profiles.is_empty() {
            return Err(DtlsError::UnsupportedProfile);
        }

        let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
        builder.set_min_proto_version(Some(SslVersion::DTLS1))?;
        builder.set_max_proto_version(Some(SslVersion::DTLS1_2))?;
        builder.set_certificate(&identity.certificate)?;
        builder.set_private_key(&identity.private_key)?;
        for cert in &identity.chain {
            builder.add_extra_chain_cert(cert.clone())?;
        }
        builder.check_private_key()?;

        let offer = profiles
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>()
            .join(":");
        builder.set_tlsext_use_srtp(&offer)?;

        // Both sides present certificates; chain validation is skipped
        // because identity is pinned by SDP fingerprint comparison.
        builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);

        let (queue, io) = transport::datagram_pair(&config, on_data_ready);
        Ok(Self {
            role,
            ctx: builder.build(),
            config,
            digest,
            queue,
            io: Some(io),
            outcome: None,
        })
    }

    /// Handle for feeding received datagrams into the handshake.
    pub fn recv_queue(&self) -> DatagramQueue {
        self.queue.clone()
    }

    /// Abort the handshake and wake any blocked read.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Run the DTLS handshake to completion. Blocking; call from a
    /// dedicated thread. On success the SRTP keying material, the
    /// negotiated profile and the remote certificate become available.
    pub fn do_handshake(&mut self) -> Result<(), DtlsError> {
        let mut io = self.io.take().ok_or(DtlsError::NotCompleted)?;
        io.arm_deadline();

        let mut ssl = Ssl::new(&self.ctx)?;
        match self.role {
            DtlsRole::Client => ssl.set_connect_state(),
            DtlsRole::Server => ssl.set_accept_state(),
        }

        let mut stream = SslStream::new(ssl, io)?;
        stream.do_handshake().map_err(map_handshake_error)?;

        let ssl = stream.ssl();
        tracing::info!(
            "DTLS handshake complete ({}, {})",
            ssl.version_str(),
            match self.role {
                DtlsRole::Client => "client",
                DtlsRole::Server => "server",
            }
        );

        let profile_name = ssl
            .selected_srtp_profile()
            .map(|p| p.name().to_string())
            .ok_or(DtlsError::UnsupportedProfile)?;
        let profile =
            SrtpProfile::from_name(&profile_name).map_err(|_| DtlsError::UnsupportedProfile)?;

        if self.config.require_extended_master_secret && ssl.extms_support() != Some(true) {
            return Err(DtlsError::ExtendedMasterSecretRequired);
        }

        let remote_certificate = ssl.peer_certificate().ok_or_else(|| {
            DtlsError::HandshakeFailure("peer presented no certificate".to_string())
        })?;

        // RFC 5764 §4.2: one exporter block carves out both sides' keys
        // and salts.
        let block_len = 2 * (profile.key_len() + profile.salt_len());
        let mut block = vec![0u8; block_len];
        ssl.export_keying_material(&mut block, "EXTRACTOR-dtls_srtp", None)?;
        let keying = partition_keying_material(&block, profile.key_len(), profile.salt_len())
            .map_err(|_| DtlsError::UnsupportedProfile)?;

        self.outcome = Some(HandshakeOutcome {
            profile,
            keying,
            remote_certificate,
        });
        Ok(())
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn is_client(&self) -> bool {
        self.role == DtlsRole::Client
    }

    fn outcome(&self) -> Result<&HandshakeOutcome, DtlsError> {
        self.outcome.as_ref().ok_or(DtlsError::NotCompleted)
    }

    /// The profile the server selected in `use_srtp`.
    pub fn negotiated_profile(&self) -> Result<SrtpProfile, DtlsError> {
        Ok(self.outcome()?.profile)
    }

    pub fn srtp_policy(&self) -> Result<SrtpPolicy, DtlsError> {
        Ok(self.outcome()?.profile.rtp_policy())
    }

    pub fn srtcp_policy(&self) -> Result<SrtpPolicy, DtlsError> {
        Ok(self.outcome()?.profile.rtcp_policy())
    }

    pub fn master_client_key(&self) -> Result<&[u8], DtlsError> {
        Ok(&self.outcome()?.keying.client.key)
    }

    pub fn master_client_salt(&self) -> Result<&[u8], DtlsError> {
        Ok(&self.outcome()?.keying.client.salt)
    }

    pub fn master_server_key(&self) -> Result<&[u8], DtlsError> {
        Ok(&self.outcome()?.keying.server.key)
    }

    pub fn master_server_salt(&self) -> Result<&[u8], DtlsError> {
        Ok(&self.outcome()?.keying.server.salt)
    }

    /// Master key + salt this side protects with: the client material
    /// when we are the DTLS client, else the server material.
    pub fn local_master(&self) -> Result<MasterKey, DtlsError> {
        let keying = &self.outcome()?.keying;
        Ok(match self.role {
            DtlsRole::Client => keying.client.clone(),
            DtlsRole::Server => keying.server.clone(),
        })
    }

    /// Master key + salt the remote side protects with.
    pub fn remote_master(&self) -> Result<MasterKey, DtlsError> {
        let keying = &self.outcome()?.keying;
        Ok(match self.role {
            DtlsRole::Client => keying.server.clone(),
            DtlsRole::Server => keying.client.clone(),
        })
    }

    /// Build the SRTP transform pair for this association: the stream
    /// protecting outbound packets and the stream unprotecting inbound
    /// ones, both keyed under the negotiated profile.
    pub fn srtp_streams(&self) -> Result<(SrtpStream, SrtpStream), DtlsError> {
        let profile = self.negotiated_profile()?;
        let outbound = SrtpStream::new(profile, &self.local_master()?);
        let inbound = SrtpStream::new(profile, &self.remote_master()?);
        Ok((outbound, inbound))
    }

    pub fn remote_certificate(&self) -> Result<X509, DtlsError> {
        Ok(self.outcome()?.remote_certificate.clone())
    }

    /// Lowercase colon-separated fingerprint of the remote leaf
    /// certificate, for comparison against the SDP `a=fingerprint`.
    pub fn remote_fingerprint(&self, hash: FingerprintHash) -> Result<String, DtlsError> {
        if !self.digest.supported_hashes.contains(&hash) {
            return Err(DtlsError::HashAlgorithmUnsupported(format!("{hash:?}")));
        }
        fingerprint_of(&self.outcome()?.remote_certificate, hash)
    }
}

/// Lowercase colon-separated hex digest over the DER-encoded
/// certificate.
fn fingerprint_of(cert: &X509, hash: FingerprintHash) -> Result<String, DtlsError> {
    use sha1::Digest;

    let der = cert.to_der()?;
    let digest: Vec<u8> = match hash {
        FingerprintHash::Sha1 => sha1::Sha1::digest(&der).to_vec(),
        FingerprintHash::Sha224 => sha2::Sha224::digest(&der).to_vec(),
        FingerprintHash::Sha256 => sha2::Sha256::digest(&der).to_vec(),
        FingerprintHash::Sha384 => sha2::Sha384::digest(&der).to_vec(),
        FingerprintHash::Sha512 => sha2::Sha512::digest(&der).to_vec(),
    };
    Ok(digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

fn map_handshake_error(err: openssl::ssl::Error) -> DtlsError {
    if let Some(io_err) = err.io_error() {
        match io_err.kind() {
            std::io::ErrorKind::TimedOut => return DtlsError::HandshakeTimeout,
            std::io::ErrorKind::ConnectionAborted => return DtlsError::ConnectionClosed,
            _ => {}
        }
    }
    DtlsError::HandshakeFailure(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn make_identity(common_name: &str) -> DtlsIdentity {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(7).unwrap())
            .unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        DtlsIdentity {
            certificate: builder.build(),
            chain: Vec::new(),
            private_key: key,
        }
    }

    fn all_profiles() -> Vec<SrtpProfile> {
        vec![
            SrtpProfile::Aes128CmHmacSha1_80,
            SrtpProfile::Aes128CmHmacSha1_32,
            SrtpProfile::NullHmacSha1_80,
            SrtpProfile::NullHmacSha1_32,
        ]
    }

    /// Run a full loopback handshake, returning both completed peers.
    fn loopback_handshake(
        client_profiles: Vec<SrtpProfile>,
        server_profiles: Vec<SrtpProfile>,
    ) -> (DtlsPeer, DtlsPeer) {
        let (to_server_tx, to_server_rx) = mpsc::channel::<Vec<u8>>();
        let (to_client_tx, to_client_rx) = mpsc::channel::<Vec<u8>>();

        let mut client = DtlsPeer::client(
            &make_identity("client.example.org"),
            DtlsConfig::default(),
            DigestConfig::default(),
            &client_profiles,
            Box::new(move |d| {
                let _ = to_server_tx.send(d.to_vec());
            }),
        )
        .unwrap();
        let mut server = DtlsPeer::server(
            &make_identity("server.example.org"),
            DtlsConfig::default(),
            DigestConfig::default(),
            &server_profiles,
            Box::new(move |d| {
                let _ = to_client_tx.send(d.to_vec());
            }),
        )
        .unwrap();

        let client_queue = client.recv_queue();
        let server_queue = server.recv_queue();
        thread::spawn(move || {
            while let Ok(d) = to_client_rx.recv() {
                if client_queue.write_to_recv_stream(&d).is_err() {
                    break;
                }
            }
        });
        thread::spawn(move || {
            while let Ok(d) = to_server_rx.recv() {
                if server_queue.write_to_recv_stream(&d).is_err() {
                    break;
                }
            }
        });

        let client_thread = thread::spawn(move || {
            client.do_handshake().map(|_| client)
        });
        server.do_handshake().unwrap();
        let client = client_thread.join().unwrap().unwrap();
        (client, server)
    }

    #[test]
    fn test_loopback_handshake_exports_matching_keys() {
        let (client, server) = loopback_handshake(all_profiles(), all_profiles());

        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());
        assert!(client.is_client());
        assert!(!server.is_client());

        let profile = client.negotiated_profile().unwrap();
        assert_eq!(profile, server.negotiated_profile().unwrap());
        assert_eq!(profile, SrtpProfile::Aes128CmHmacSha1_80);

        assert_eq!(
            client.master_client_key().unwrap(),
            server.master_client_key().unwrap()
        );
        assert_eq!(
            client.master_server_key().unwrap(),
            server.master_server_key().unwrap()
        );
        assert_eq!(
            client.master_client_salt().unwrap(),
            server.master_client_salt().unwrap()
        );
        assert_eq!(client.master_client_key().unwrap().len(), 16);
        assert_eq!(client.master_client_salt().unwrap().len(), 14);

        // One side's local material is the other side's remote material.
        assert_eq!(
            client.local_master().unwrap(),
            server.remote_master().unwrap()
        );

        assert_eq!(client.srtp_policy().unwrap().auth_tag_len, 10);
        assert_eq!(client.srtcp_policy().unwrap().auth_tag_len, 10);

        // Media protected by one side is recoverable by the other.
        let (mut client_tx, _client_rx) = client.srtp_streams().unwrap();
        let (_server_tx, mut server_rx) = server.srtp_streams().unwrap();
        let rtp = crate::rtp::RtpPacket::new(0, 1, 160, 0x5150, vec![0x7E; 160]).encode();
        let protected = client_tx.protect(&rtp).unwrap();
        assert_eq!(server_rx.unprotect(&protected).unwrap(), rtp);
    }

    #[test]
    fn test_negotiation_falls_back_to_mutual_profile() {
        // Client only offers the 32-bit-tag profile; the server scans
        // its own preference list for a mutually supported entry.
        let (client, server) = loopback_handshake(
            vec![SrtpProfile::Aes128CmHmacSha1_32],
            all_profiles(),
        );
        assert_eq!(
            client.negotiated_profile().unwrap(),
            SrtpProfile::Aes128CmHmacSha1_32
        );
        assert_eq!(
            server.negotiated_profile().unwrap(),
            SrtpProfile::Aes128CmHmacSha1_32
        );
    }

    #[test]
    fn test_remote_fingerprint_format() {
        let (client, _server) = loopback_handshake(all_profiles(), all_profiles());
        let fp = client.remote_fingerprint(FingerprintHash::Sha256).unwrap();
        // 32 bytes -> 32 hex pairs separated by colons.
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase() || c == ':'));
    }

    #[test]
    fn test_fingerprint_hash_whitelist() {
        let (client, _server) = loopback_handshake(all_profiles(), all_profiles());
        let mut restricted = client;
        restricted.digest = DigestConfig {
            supported_hashes: vec![FingerprintHash::Sha256],
        };
        assert!(matches!(
            restricted.remote_fingerprint(FingerprintHash::Sha1),
            Err(DtlsError::HashAlgorithmUnsupported(_))
        ));
        assert!(restricted
            .remote_fingerprint(FingerprintHash::Sha256)
            .is_ok());
    }

    #[test]
    fn test_handshake_timeout_without_peer() {
        let mut client = DtlsPeer::client(
            &make_identity("lonely.example.org"),
            DtlsConfig {
                handshake_timeout_ms: 300,
                retransmit_min_ms: 20,
                retransmit_max_ms: 80,
                ..Default::default()
            },
            DigestConfig::default(),
            &all_profiles(),
            Box::new(|_| {}),
        )
        .unwrap();
        match client.do_handshake() {
            Err(DtlsError::HandshakeTimeout) => {}
            other => panic!("expected HandshakeTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_close_aborts_handshake() {
        let mut client = DtlsPeer::client(
            &make_identity("closed.example.org"),
            DtlsConfig::default(),
            DigestConfig::default(),
            &all_profiles(),
            Box::new(|_| {}),
        )
        .unwrap();
        let queue = client.recv_queue();
        let handle = thread::spawn(move || client.do_handshake());
        thread::sleep(Duration::from_millis(50));
        queue.close();
        match handle.join().unwrap() {
            Err(DtlsError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn test_accessors_before_completion() {
        let client = DtlsPeer::client(
            &make_identity("early.example.org"),
            DtlsConfig::default(),
            DigestConfig::default(),
            &all_profiles(),
            Box::new(|_| {}),
        )
        .unwrap();
        assert!(!client.is_handshake_complete());
        assert!(matches!(
            client.negotiated_profile(),
            Err(DtlsError::NotCompleted)
        ));
        assert!(matches!(client.local_master(), Err(DtlsError::NotCompleted)));
    }
}

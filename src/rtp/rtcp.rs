//! RTCP compound packet building and parsing (RFC 3550 §6).
//!
//! Builds compound packets (SR/RR + SDES, optionally BYE) for periodic
//! reporting and parses incoming compound packets into typed
//! sub-packets. Sub-packet framing: each carries a length field in
//! 32-bit words minus one; the first sub-packet of a compound packet
//! must be a sender or receiver report.
//!
//! The reporting math lives on the statistics types: [`RtpRecvStats`]
//! produces [`ReportBlock`]s and tracks interarrival jitter,
//! [`RtpSendStats`] produces the [`SenderInfo`] section, and
//! [`NtpTime`] carries the 32.32 wall-clock format both use.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// NTP epoch offset: seconds between 1900-01-01 and 1970-01-01.
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// RTCP packet types (RFC 3550 §12.1).
pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;

/// SDES item type for the canonical name.
pub const SDES_CNAME: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtcpError {
    #[error("malformed RTCP packet: {0}")]
    MalformedRtcp(&'static str),
}

/// An NTP timestamp split into its wire halves: seconds since
/// 1900-01-01 and a 32-bit binary fraction of a second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTime {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTime {
    /// The current wall clock. Sender reports carry the time they were
    /// built, not the time they were serialized onto the wire.
    pub fn now() -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: (unix.as_secs() + NTP_EPOCH_OFFSET) as u32,
            fraction: ((u128::from(unix.subsec_nanos()) << 32) / 1_000_000_000) as u32,
        }
    }

    pub fn as_u64(&self) -> u64 {
        (u64::from(self.seconds) << 32) | u64::from(self.fraction)
    }

    /// The middle 32 bits, the compact form report blocks carry in
    /// their LSR field.
    pub fn middle_32(&self) -> u32 {
        (self.seconds << 16) | (self.fraction >> 16)
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.seconds.to_be_bytes());
        buf.extend_from_slice(&self.fraction.to_be_bytes());
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            seconds: read_u32(data, 0),
            fraction: read_u32(data, 4),
        }
    }
}

/// One reception report block, carried by both SR and RR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative packet loss.
    pub cumulative_lost: u32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    const WIRE_LEN: usize = 24;

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.push(self.fraction_lost);
        // Cumulative loss travels as the low 24 bits.
        buf.extend_from_slice(&self.cumulative_lost.to_be_bytes()[1..]);
        buf.extend_from_slice(&self.extended_highest_seq.to_be_bytes());
        buf.extend_from_slice(&self.jitter.to_be_bytes());
        buf.extend_from_slice(&self.last_sr.to_be_bytes());
        buf.extend_from_slice(&self.delay_since_last_sr.to_be_bytes());
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            ssrc: read_u32(data, 0),
            fraction_lost: data[4],
            cumulative_lost: u32::from_be_bytes([0, data[5], data[6], data[7]]),
            extended_highest_seq: read_u32(data, 8),
            jitter: read_u32(data, 12),
            last_sr: read_u32(data, 16),
            delay_since_last_sr: read_u32(data, 20),
        }
    }
}

/// The sender-info section of an SR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderInfo {
    pub ntp: NtpTime,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderInfo {
    const WIRE_LEN: usize = 20;

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.ntp.write_to(buf);
        buf.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.packet_count.to_be_bytes());
        buf.extend_from_slice(&self.octet_count.to_be_bytes());
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            ntp: NtpTime::parse(data),
            rtp_timestamp: read_u32(data, 8),
            packet_count: read_u32(data, 12),
            octet_count: read_u32(data, 16),
        }
    }
}

/// One SDES item within a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: u8,
    pub text: String,
}

/// One SDES chunk: a source plus its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

/// A parsed RTCP sub-packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport {
        ssrc: u32,
        info: SenderInfo,
        reports: Vec<ReportBlock>,
    },
    ReceiverReport {
        ssrc: u32,
        reports: Vec<ReportBlock>,
    },
    Sdes {
        chunks: Vec<SdesChunk>,
    },
    Bye {
        ssrcs: Vec<u32>,
        reason: Option<String>,
    },
    Unknown {
        packet_type: u8,
        payload: Vec<u8>,
    },
}

/// Reception statistics for one remote source, the inputs to the
/// report blocks this side emits.
#[derive(Debug, Clone, Default)]
pub struct RtpRecvStats {
    pub packets_received: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr_ntp: u32,
    pub last_sr_recv_time: Option<Instant>,
    pub packets_lost: u32,
    pub expected_prior: u32,
    pub received_prior: u32,
    prev_transit: Option<i64>,
}

impl RtpRecvStats {
    /// Whether anything arrived yet; a report block is only meaningful
    /// once it did.
    pub fn has_reception(&self) -> bool {
        self.packets_received > 0
    }

    /// Fold one packet arrival into the interarrival jitter estimate
    /// (RFC 3550 appendix A.8): `J += (|D| - J) / 16`, rounded.
    /// `arrival_clock` is a local clock sample in RTP timestamp units.
    pub fn record_arrival(&mut self, rtp_timestamp: u32, arrival_clock: u32) {
        let transit = i64::from(arrival_clock) - i64::from(rtp_timestamp);
        if let Some(prev) = self.prev_transit {
            let deviation = (transit - prev).abs();
            let smoothed = i64::from(self.jitter) + ((deviation - i64::from(self.jitter) + 8) >> 4);
            self.jitter = smoothed.clamp(0, i64::from(u32::MAX)) as u32;
        }
        self.prev_transit = Some(transit);
    }

    /// Note a received sender report, so later report blocks can carry
    /// the LSR/DLSR pair the sender uses to measure round-trip time.
    pub fn note_sender_report(&mut self, ntp: NtpTime) {
        self.last_sr_ntp = ntp.middle_32();
        self.last_sr_recv_time = Some(Instant::now());
    }

    /// Packets expected since the last reporting interval began.
    fn interval_expected(&self) -> u32 {
        self.highest_seq.wrapping_sub(self.expected_prior)
    }

    /// Short-term loss ratio as the 8-bit fixed-point fraction report
    /// blocks carry.
    fn fraction_lost(&self) -> u8 {
        let expected = self.interval_expected();
        if expected == 0 {
            return 0;
        }
        let received = self.packets_received.wrapping_sub(self.received_prior);
        let lost = expected.saturating_sub(received);
        ((u64::from(lost) * 256) / u64::from(expected)).min(255) as u8
    }

    /// Time since the last SR arrived, in 1/65536-second units.
    fn delay_since_last_sr(&self) -> u32 {
        match self.last_sr_recv_time {
            Some(at) => (at.elapsed().as_secs_f64() * 65536.0) as u32,
            None => 0,
        }
    }

    /// The report block describing reception of `subject_ssrc`.
    pub fn report_block(&self, subject_ssrc: u32) -> ReportBlock {
        ReportBlock {
            ssrc: subject_ssrc,
            fraction_lost: self.fraction_lost(),
            cumulative_lost: self.packets_lost & 0x00FF_FFFF,
            extended_highest_seq: self.highest_seq,
            jitter: self.jitter,
            last_sr: self.last_sr_ntp,
            delay_since_last_sr: self.delay_since_last_sr(),
        }
    }
}

/// Transmission statistics, the inputs to the SR sender-info section.
#[derive(Debug, Clone, Default)]
pub struct RtpSendStats {
    pub ssrc: u32,
    pub packets_sent: u32,
    pub bytes_sent: u32,
    pub last_rtp_timestamp: u32,
}

impl RtpSendStats {
    /// The sender-info section for an SR built at `now`.
    pub fn sender_info(&self, now: NtpTime) -> SenderInfo {
        SenderInfo {
            ntp: now,
            rtp_timestamp: self.last_rtp_timestamp,
            packet_count: self.packets_sent,
            octet_count: self.bytes_sent,
        }
    }
}

/// Whether a UDP payload is RTCP (demux from RTP on a shared port):
/// RTP version 2 with a packet type in the RTCP range.
pub fn is_rtcp_packet(data: &[u8]) -> bool {
    data.len() >= 8 && data[0] >> 6 == 2 && (PT_SR..=204).contains(&data[1])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Frame one sub-packet: the fixed header with `count` and `pt`, the
/// body written by the closure, then the length field patched to the
/// final size in 32-bit words minus one. The closure must leave the
/// body word-aligned.
fn sub_packet(buf: &mut Vec<u8>, count: u8, pt: u8, body: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.push(0x80 | (count & 0x1F));
    buf.push(pt);
    buf.extend_from_slice(&[0, 0]);
    body(buf);
    let words = ((buf.len() - start) / 4 - 1) as u16;
    buf[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
}

/// Pad with zeros to the next 32-bit boundary.
fn pad_to_word(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Build a compound Sender Report + SDES packet.
pub fn build_sender_report(
    send_stats: &RtpSendStats,
    recv_stats: &RtpRecvStats,
    remote_ssrc: u32,
    cname: &str,
) -> Vec<u8> {
    let info = send_stats.sender_info(NtpTime::now());
    let block = (remote_ssrc != 0 && recv_stats.has_reception())
        .then(|| recv_stats.report_block(remote_ssrc));

    let mut buf = Vec::with_capacity(128);
    sub_packet(&mut buf, block.is_some() as u8, PT_SR, |buf| {
        buf.extend_from_slice(&send_stats.ssrc.to_be_bytes());
        info.write_to(buf);
        if let Some(ref block) = block {
            block.write_to(buf);
        }
    });
    append_sdes(&mut buf, send_stats.ssrc, cname);
    buf
}

/// Build a compound Receiver Report + SDES packet.
pub fn build_receiver_report(
    local_ssrc: u32,
    recv_stats: &RtpRecvStats,
    remote_ssrc: u32,
    cname: &str,
) -> Vec<u8> {
    let block = (remote_ssrc != 0 && recv_stats.has_reception())
        .then(|| recv_stats.report_block(remote_ssrc));

    let mut buf = Vec::with_capacity(64);
    sub_packet(&mut buf, block.is_some() as u8, PT_RR, |buf| {
        buf.extend_from_slice(&local_ssrc.to_be_bytes());
        if let Some(ref block) = block {
            block.write_to(buf);
        }
    });
    append_sdes(&mut buf, local_ssrc, cname);
    buf
}

/// Append an SDES chunk carrying a single CNAME item.
fn append_sdes(buf: &mut Vec<u8>, ssrc: u32, cname: &str) {
    sub_packet(buf, 1, PT_SDES, |buf| {
        buf.extend_from_slice(&ssrc.to_be_bytes());
        let text = cname.as_bytes();
        buf.push(SDES_CNAME);
        buf.push(text.len() as u8);
        buf.extend_from_slice(text);
        buf.push(0); // end item
        pad_to_word(buf);
    });
}

/// Build a BYE packet with an optional reason string.
pub fn build_bye(ssrcs: &[u32], reason: Option<&str>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    sub_packet(&mut buf, ssrcs.len() as u8, PT_BYE, |buf| {
        for ssrc in ssrcs {
            buf.extend_from_slice(&ssrc.to_be_bytes());
        }
        if let Some(reason) = reason {
            let text = reason.as_bytes();
            buf.push(text.len() as u8);
            buf.extend_from_slice(text);
            pad_to_word(buf);
        }
    });
    buf
}

/// Parse a compound RTCP packet into typed sub-packets.
///
/// The first sub-packet must be an SR or RR. Unknown packet types are
/// surfaced opaquely so callers can count and skip them.
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>, RtcpError> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset + 4 <= data.len() {
        if data[offset] >> 6 != 2 {
            return Err(RtcpError::MalformedRtcp("sub-packet version is not 2"));
        }
        let count = data[offset] & 0x1F;
        let pt = data[offset + 1];
        let length_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let packet_len = (length_words + 1) * 4;
        if offset + packet_len > data.len() {
            return Err(RtcpError::MalformedRtcp("sub-packet length exceeds data"));
        }
        if packets.is_empty() && pt != PT_SR && pt != PT_RR {
            return Err(RtcpError::MalformedRtcp(
                "compound packet does not start with SR or RR",
            ));
        }

        let pkt = &data[offset..offset + packet_len];
        packets.push(parse_sub_packet(pt, count, pkt)?);
        offset += packet_len;
    }

    if packets.is_empty() {
        return Err(RtcpError::MalformedRtcp("no sub-packets"));
    }
    Ok(packets)
}

fn parse_sub_packet(pt: u8, count: u8, pkt: &[u8]) -> Result<RtcpPacket, RtcpError> {
    match pt {
        PT_SR => {
            if pkt.len() < 8 + SenderInfo::WIRE_LEN {
                return Err(RtcpError::MalformedRtcp("SR shorter than sender info"));
            }
            let reports = parse_report_blocks(&pkt[8 + SenderInfo::WIRE_LEN..], count)?;
            Ok(RtcpPacket::SenderReport {
                ssrc: read_u32(pkt, 4),
                info: SenderInfo::parse(&pkt[8..]),
                reports,
            })
        }
        PT_RR => {
            if pkt.len() < 8 {
                return Err(RtcpError::MalformedRtcp("RR shorter than header"));
            }
            let reports = parse_report_blocks(&pkt[8..], count)?;
            Ok(RtcpPacket::ReceiverReport {
                ssrc: read_u32(pkt, 4),
                reports,
            })
        }
        PT_SDES => parse_sdes(&pkt[4..], count),
        PT_BYE => parse_bye(&pkt[4..], count),
        other => Ok(RtcpPacket::Unknown {
            packet_type: other,
            payload: pkt[4..].to_vec(),
        }),
    }
}

fn parse_report_blocks(data: &[u8], count: u8) -> Result<Vec<ReportBlock>, RtcpError> {
    let count = count as usize;
    if data.len() < count * ReportBlock::WIRE_LEN {
        return Err(RtcpError::MalformedRtcp("truncated report blocks"));
    }
    Ok(data
        .chunks_exact(ReportBlock::WIRE_LEN)
        .take(count)
        .map(ReportBlock::parse)
        .collect())
}

/// Parse SDES chunks: per-chunk SSRC then items terminated by a type-0
/// item, each chunk padded to a 32-bit boundary.
fn parse_sdes(data: &[u8], chunk_count: u8) -> Result<RtcpPacket, RtcpError> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    for _ in 0..chunk_count {
        if data.len() < offset + 4 {
            return Err(RtcpError::MalformedRtcp("truncated SDES chunk"));
        }
        let ssrc = read_u32(data, offset);
        offset += 4;

        let mut items = Vec::new();
        loop {
            if offset >= data.len() {
                return Err(RtcpError::MalformedRtcp("SDES items not terminated"));
            }
            let item_type = data[offset];
            if item_type == 0 {
                offset += 1;
                // Chunk padding to the next 32-bit boundary.
                while offset % 4 != 0 {
                    if offset < data.len() && data[offset] != 0 {
                        return Err(RtcpError::MalformedRtcp("non-zero SDES padding"));
                    }
                    offset += 1;
                }
                break;
            }
            if data.len() < offset + 2 {
                return Err(RtcpError::MalformedRtcp("truncated SDES item header"));
            }
            let len = data[offset + 1] as usize;
            if data.len() < offset + 2 + len {
                return Err(RtcpError::MalformedRtcp("truncated SDES item text"));
            }
            let text = String::from_utf8_lossy(&data[offset + 2..offset + 2 + len]).into_owned();
            items.push(SdesItem { item_type, text });
            offset += 2 + len;
        }
        chunks.push(SdesChunk { ssrc, items });
    }
    Ok(RtcpPacket::Sdes { chunks })
}

/// Parse BYE: SSRC list plus an optional length-prefixed reason string.
fn parse_bye(data: &[u8], source_count: u8) -> Result<RtcpPacket, RtcpError> {
    let count = source_count as usize;
    if data.len() < count * 4 {
        return Err(RtcpError::MalformedRtcp("truncated BYE SSRC list"));
    }
    let mut ssrcs = Vec::with_capacity(count);
    for i in 0..count {
        ssrcs.push(read_u32(data, i * 4));
    }
    let rest = &data[count * 4..];
    let reason = if rest.is_empty() {
        None
    } else {
        let len = rest[0] as usize;
        if rest.len() < 1 + len {
            return Err(RtcpError::MalformedRtcp("truncated BYE reason"));
        }
        Some(String::from_utf8_lossy(&rest[1..1 + len]).into_owned())
    };
    Ok(RtcpPacket::Bye { ssrcs, reason })
}

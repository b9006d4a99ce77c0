//! RTP framing for A2DP audio packets.
//!
//! Each packet is a 12-byte RTP header followed by a 1-byte SBC payload
//! header carrying the frame count, followed by concatenated SBC frames.

use crate::error::{ProtocolError, StreamError};

/// RTP header size on the wire.
pub const RTP_HEADER_SIZE: usize = 12;
/// SBC payload header size on the wire.
pub const PAYLOAD_HEADER_SIZE: usize = 1;
/// Combined framing overhead per A2DP packet.
pub const PACKET_OVERHEAD: usize = RTP_HEADER_SIZE + PAYLOAD_HEADER_SIZE;

/// Payload type used for SBC audio.
pub const PAYLOAD_TYPE_SBC: u8 = 1;
/// Fixed synchronization source identifier.
pub const SSRC: u32 = 1;

/// RTP header (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Version (2 bits) - always 2.
    pub version: u8,
    /// Payload type.
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Timestamp in sample units.
    pub timestamp: u32,
    /// SSRC identifier.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Create a header for an SBC audio packet.
    pub fn new(sequence: u16, timestamp: u32) -> Self {
        Self {
            version: 2,
            payload_type: PAYLOAD_TYPE_SBC,
            sequence,
            timestamp,
            ssrc: SSRC,
        }
    }

    /// Serialize to 12 bytes.
    pub fn serialize(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut buf = [0u8; RTP_HEADER_SIZE];

        // Byte 0: V(2) P(1) X(1) CC(4)
        buf[0] = self.version << 6;
        // Byte 1: M(1) PT(7)
        buf[1] = self.payload_type & 0x7f;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }

    /// Parse from bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(ProtocolError::Malformed("RTP header too short".into()));
        }

        Ok(Self {
            version: (data[0] >> 6) & 0x03,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// SBC payload header: number of SBC frames in the packet (low nibble
/// plus a fragmentation bit we never set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcPayloadHeader {
    pub frame_count: u8,
}

impl SbcPayloadHeader {
    pub fn serialize(&self) -> u8 {
        self.frame_count & 0x0f
    }

    pub fn parse(byte: u8) -> Self {
        Self {
            frame_count: byte & 0x0f,
        }
    }
}

/// Write packet framing into the head of `buf`.
pub fn write_packet_header(buf: &mut [u8], sequence: u16, timestamp: u32, frame_count: u8) {
    buf[..RTP_HEADER_SIZE].copy_from_slice(&RtpHeader::new(sequence, timestamp).serialize());
    buf[RTP_HEADER_SIZE] = SbcPayloadHeader { frame_count }.serialize();
}

/// Split a received packet into its headers and SBC payload.
pub fn split_packet(data: &[u8]) -> Result<(RtpHeader, SbcPayloadHeader, &[u8]), StreamError> {
    if data.len() < PACKET_OVERHEAD {
        return Err(StreamError::Decode);
    }
    let header = RtpHeader::parse(data).map_err(|_| StreamError::Decode)?;
    let payload = SbcPayloadHeader::parse(data[RTP_HEADER_SIZE]);
    Ok((header, payload, &data[PACKET_OVERHEAD..]))
}

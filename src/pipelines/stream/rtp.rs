// SPDX-License-Identifier: GPL-3.0-only

//! RTP framing for synchronized frame sets
//!
//! One aligned set becomes one payload:
//!
//! ```text
//! [len(frame 0): u64 LE] … [len(frame N-1): u64 LE][frame 0 bytes] … [frame N-1 bytes]
//! ```
//!
//! The payload is cut into MTU-sized fragments. Every fragment of a set carries
//! the same timestamp and the last one has the marker bit set, so a receiver
//! can reassemble sets without any other signalling.

use crate::backends::camera::Frame;

/// Fixed RTP header (RFC 3550), no CSRCs or extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub const SIZE: usize = 12;
    const VERSION: u8 = 2;

    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number: 0,
            timestamp: 0,
            ssrc,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        // V(2) P(1) X(1) CC(4)
        out.push(Self::VERSION << 6);
        // M(1) PT(7)
        out.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }
}

/// Length header followed by every frame's bytes
pub fn build_set_payload(frames: &[Frame]) -> Vec<u8> {
    let header_len = frames.len() * std::mem::size_of::<u64>();
    let data_len: usize = frames.iter().map(|f| f.data.len()).sum();

    let mut payload = Vec::with_capacity(header_len + data_len);
    for frame in frames {
        payload.extend_from_slice(&(frame.data.len() as u64).to_le_bytes());
    }
    for frame in frames {
        payload.extend_from_slice(&frame.data);
    }
    payload
}

/// Splits set payloads into RTP packets
///
/// The sequence number keeps counting across sets.
#[derive(Debug)]
pub struct SetPacketizer {
    header: RtpHeader,
    mtu: usize,
}

impl SetPacketizer {
    pub fn new(payload_type: u8, ssrc: u32, mtu: usize) -> Self {
        Self {
            header: RtpHeader::new(payload_type, ssrc),
            mtu: mtu.max(1),
        }
    }

    /// Packetize one payload with a shared `timestamp`
    pub fn packetize(&mut self, payload: &[u8], timestamp: u32) -> Vec<Vec<u8>> {
        let chunks: Vec<&[u8]> = payload.chunks(self.mtu).collect();
        let last = chunks.len().saturating_sub(1);

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                self.header.timestamp = timestamp;
                self.header.marker = index == last;

                let mut packet = Vec::with_capacity(RtpHeader::SIZE + chunk.len());
                self.header.write_to(&mut packet);
                packet.extend_from_slice(chunk);

                self.header.sequence_number = self.header.sequence_number.wrapping_add(1);
                packet
            })
            .collect()
    }

    pub fn next_sequence_number(&self) -> u16 {
        self.header.sequence_number
    }
}

/// Wall-clock milliseconds truncated to 32 bits
pub fn wallclock_timestamp() -> u32 {
    (chrono::Utc::now().timestamp_millis() as u64 & 0xFFFF_FFFF) as u32
}

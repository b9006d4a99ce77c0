//! SBC codec parameters, capability blobs and framing.
//!
//! The capability/configuration blob exchanged during endpoint negotiation
//! is a fixed 6-byte structure; each negotiated field of a configuration
//! selects exactly one bit from the corresponding capability bitmask:
//!
//! ```text
//! byte 0: sampling-frequency bitmask
//! byte 1: channel-mode bitmask
//! byte 2: block-length bitmask
//! byte 3: subband bitmask (bits 2-3) | allocation bitmask (bits 0-1)
//! byte 4: minimum bitpool
//! byte 5: maximum bitpool
//! ```
//!
//! Frame sizing (`codesize`, `frame_length`) follows the A2DP SBC framing
//! rules; the subband bit allocation itself is treated as a black box with
//! exact input/output sizing and bitpool-controlled quality.

use crate::error::{NegotiationError, StreamError};

/// Size of the SBC capability/configuration blob.
pub const SBC_BLOB_SIZE: usize = 6;

/// Protocol minimum bitpool.
pub const MIN_BITPOOL: u8 = 2;
/// Protocol maximum bitpool.
pub const MAX_BITPOOL: u8 = 64;
/// Floor for congestion-driven bitpool reduction.
pub const BITPOOL_DEC_LIMIT: u8 = 32;
/// Step for congestion-driven bitpool reduction.
pub const BITPOOL_DEC_STEP: u8 = 5;

/// SBC frame header size in our framing (syncword, parameter byte,
/// bitpool, reserved).
const FRAME_HEADER_SIZE: usize = 4;
const SYNCWORD: u8 = 0x9c;

// Sampling-frequency bitmask values.
pub const SBC_FREQ_16000: u8 = 1 << 3;
pub const SBC_FREQ_32000: u8 = 1 << 2;
pub const SBC_FREQ_44100: u8 = 1 << 1;
pub const SBC_FREQ_48000: u8 = 1 << 0;

// Channel-mode bitmask values.
pub const SBC_MODE_MONO: u8 = 1 << 3;
pub const SBC_MODE_DUAL_CHANNEL: u8 = 1 << 2;
pub const SBC_MODE_STEREO: u8 = 1 << 1;
pub const SBC_MODE_JOINT_STEREO: u8 = 1 << 0;

// Block-length bitmask values.
pub const SBC_BLOCKS_4: u8 = 1 << 3;
pub const SBC_BLOCKS_8: u8 = 1 << 2;
pub const SBC_BLOCKS_12: u8 = 1 << 1;
pub const SBC_BLOCKS_16: u8 = 1 << 0;

// Subband bitmask values.
pub const SBC_SUBBANDS_4: u8 = 1 << 1;
pub const SBC_SUBBANDS_8: u8 = 1 << 0;

// Allocation-method bitmask values.
pub const SBC_ALLOCATION_SNR: u8 = 1 << 1;
pub const SBC_ALLOCATION_LOUDNESS: u8 = 1 << 0;

/// SBC channel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Mono,
    DualChannel,
    Stereo,
    JointStereo,
}

impl ChannelMode {
    pub fn channels(self) -> u8 {
        match self {
            ChannelMode::Mono => 1,
            _ => 2,
        }
    }

    fn mask(self) -> u8 {
        match self {
            ChannelMode::Mono => SBC_MODE_MONO,
            ChannelMode::DualChannel => SBC_MODE_DUAL_CHANNEL,
            ChannelMode::Stereo => SBC_MODE_STEREO,
            ChannelMode::JointStereo => SBC_MODE_JOINT_STEREO,
        }
    }

    fn from_mask(mask: u8) -> Option<Self> {
        Some(match mask {
            SBC_MODE_MONO => ChannelMode::Mono,
            SBC_MODE_DUAL_CHANNEL => ChannelMode::DualChannel,
            SBC_MODE_STEREO => ChannelMode::Stereo,
            SBC_MODE_JOINT_STEREO => ChannelMode::JointStereo,
            _ => return None,
        })
    }
}

/// SBC bit-allocation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Snr,
    Loudness,
}

/// Peer capability bitmasks, as parsed from the 6-byte blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcCapabilities {
    pub frequencies: u8,
    pub channel_modes: u8,
    pub block_lengths: u8,
    pub subbands: u8,
    pub allocations: u8,
    pub min_bitpool: u8,
    pub max_bitpool: u8,
}

impl SbcCapabilities {
    pub fn parse(bytes: &[u8]) -> Result<Self, NegotiationError> {
        if bytes.len() != SBC_BLOB_SIZE {
            return Err(NegotiationError::BadCapabilitySize {
                expected: SBC_BLOB_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            frequencies: bytes[0] & 0x0f,
            channel_modes: bytes[1] & 0x0f,
            block_lengths: bytes[2] & 0x0f,
            subbands: (bytes[3] >> 2) & 0x03,
            allocations: bytes[3] & 0x03,
            min_bitpool: bytes[4],
            max_bitpool: bytes[5],
        })
    }

    pub fn to_bytes(&self) -> [u8; SBC_BLOB_SIZE] {
        [
            self.frequencies & 0x0f,
            self.channel_modes & 0x0f,
            self.block_lengths & 0x0f,
            ((self.subbands & 0x03) << 2) | (self.allocations & 0x03),
            self.min_bitpool,
            self.max_bitpool,
        ]
    }
}

/// A fully negotiated SBC configuration (one value per field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcParams {
    pub rate: u32,
    pub mode: ChannelMode,
    pub blocks: u8,
    pub subbands: u8,
    pub allocation: Allocation,
    pub min_bitpool: u8,
    pub max_bitpool: u8,
}

impl SbcParams {
    /// Decode a configuration blob. Every bitmask must carry exactly one
    /// known bit.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NegotiationError> {
        let caps = SbcCapabilities::parse(bytes)?;
        let bad = |what: &str| NegotiationError::InvalidRequest(format!("ambiguous {what} field"));

        let rate = match caps.frequencies {
            SBC_FREQ_16000 => 16000,
            SBC_FREQ_32000 => 32000,
            SBC_FREQ_44100 => 44100,
            SBC_FREQ_48000 => 48000,
            _ => return Err(bad("frequency")),
        };
        let mode = ChannelMode::from_mask(caps.channel_modes).ok_or_else(|| bad("channel mode"))?;
        let blocks = match caps.block_lengths {
            SBC_BLOCKS_4 => 4,
            SBC_BLOCKS_8 => 8,
            SBC_BLOCKS_12 => 12,
            SBC_BLOCKS_16 => 16,
            _ => return Err(bad("block length")),
        };
        let subbands = match caps.subbands {
            SBC_SUBBANDS_4 => 4,
            SBC_SUBBANDS_8 => 8,
            _ => return Err(bad("subbands")),
        };
        let allocation = match caps.allocations {
            SBC_ALLOCATION_SNR => Allocation::Snr,
            SBC_ALLOCATION_LOUDNESS => Allocation::Loudness,
            _ => return Err(bad("allocation")),
        };
        if caps.min_bitpool < MIN_BITPOOL
            || caps.max_bitpool > MAX_BITPOOL
            || caps.min_bitpool > caps.max_bitpool
        {
            return Err(NegotiationError::BitpoolRangeEmpty {
                peer_min: caps.min_bitpool,
                peer_max: caps.max_bitpool,
            });
        }

        Ok(Self {
            rate,
            mode,
            blocks,
            subbands,
            allocation,
            min_bitpool: caps.min_bitpool,
            max_bitpool: caps.max_bitpool,
        })
    }

    pub fn to_bytes(&self) -> [u8; SBC_BLOB_SIZE] {
        let freq = match self.rate {
            16000 => SBC_FREQ_16000,
            32000 => SBC_FREQ_32000,
            44100 => SBC_FREQ_44100,
            _ => SBC_FREQ_48000,
        };
        let blocks = match self.blocks {
            4 => SBC_BLOCKS_4,
            8 => SBC_BLOCKS_8,
            12 => SBC_BLOCKS_12,
            _ => SBC_BLOCKS_16,
        };
        let subbands = match self.subbands {
            4 => SBC_SUBBANDS_4,
            _ => SBC_SUBBANDS_8,
        };
        let allocation = match self.allocation {
            Allocation::Snr => SBC_ALLOCATION_SNR,
            Allocation::Loudness => SBC_ALLOCATION_LOUDNESS,
        };
        SbcCapabilities {
            frequencies: freq,
            channel_modes: self.mode.mask(),
            block_lengths: blocks,
            subbands,
            allocations: allocation,
            min_bitpool: self.min_bitpool,
            max_bitpool: self.max_bitpool,
        }
        .to_bytes()
    }

    pub fn channels(&self) -> u8 {
        self.mode.channels()
    }

    /// PCM bytes consumed per frame (S16, interleaved).
    pub fn codesize(&self) -> usize {
        self.blocks as usize * self.subbands as usize * self.channels() as usize * 2
    }

    /// Encoded frame size at the given bitpool.
    pub fn frame_length(&self, bitpool: u8) -> usize {
        let channels = self.channels() as usize;
        let blocks = self.blocks as usize;
        let subbands = self.subbands as usize;
        let bitpool = bitpool as usize;
        let base = FRAME_HEADER_SIZE + (4 * subbands * channels) / 8;
        let payload_bits = match self.mode {
            ChannelMode::Mono | ChannelMode::DualChannel => blocks * channels * bitpool,
            ChannelMode::Stereo => blocks * bitpool,
            ChannelMode::JointStereo => subbands + blocks * bitpool,
        };
        base + (payload_bits + 7) / 8
    }
}

/// Default (maximum) bitpool for a negotiated rate and channel mode.
pub fn default_bitpool(rate: u32, mode: ChannelMode) -> u8 {
    match rate {
        16000 | 32000 => 53,
        44100 => match mode {
            ChannelMode::Mono | ChannelMode::DualChannel => 31,
            ChannelMode::Stereo | ChannelMode::JointStereo => 53,
        },
        _ => match mode {
            ChannelMode::Mono | ChannelMode::DualChannel => 29,
            ChannelMode::Stereo | ChannelMode::JointStereo => 51,
        },
    }
}

/// SBC encoder/decoder working state.
///
/// Consumes exactly `codesize` PCM bytes per frame and produces exactly
/// `frame_length` encoded bytes (and vice versa for decode). Sample
/// precision scales with the frame's bitpool: the available payload bits
/// are divided evenly over the frame's samples and each sample keeps that
/// many most-significant bits.
#[derive(Debug)]
pub struct SbcCodec {
    params: SbcParams,
    bitpool: u8,
}

impl SbcCodec {
    pub fn new(params: SbcParams, bitpool: u8) -> Self {
        let mut codec = Self {
            params,
            bitpool: params.min_bitpool,
        };
        codec.set_bitpool(bitpool);
        codec
    }

    pub fn params(&self) -> &SbcParams {
        &self.params
    }

    pub fn bitpool(&self) -> u8 {
        self.bitpool
    }

    /// Set the working bitpool, clamped into the negotiated range.
    /// Returns true when the value actually changed.
    pub fn set_bitpool(&mut self, bitpool: u8) -> bool {
        let clamped = bitpool
            .max(self.params.min_bitpool)
            .min(self.params.max_bitpool);
        if clamped == self.bitpool {
            return false;
        }
        self.bitpool = clamped;
        true
    }

    pub fn codesize(&self) -> usize {
        self.params.codesize()
    }

    pub fn frame_length(&self) -> usize {
        self.params.frame_length(self.bitpool)
    }

    /// Bits each sample keeps at the given frame length.
    fn bits_per_sample(&self, frame_length: usize) -> u32 {
        let payload_bits = (frame_length - FRAME_HEADER_SIZE) * 8;
        let samples = self.codesize() / 2;
        ((payload_bits / samples) as u32).clamp(1, 16)
    }

    /// Encode one frame. Returns (pcm bytes consumed, frame bytes written).
    pub fn encode(
        &self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(usize, usize), StreamError> {
        let codesize = self.codesize();
        let frame_length = self.frame_length();
        if input.len() < codesize || output.len() < frame_length {
            return Err(StreamError::Encode);
        }

        let out = &mut output[..frame_length];
        out.fill(0);
        out[0] = SYNCWORD;
        out[1] = self.parameter_byte();
        out[2] = self.bitpool;

        let bits = self.bits_per_sample(frame_length);
        let mut writer = BitWriter::new(&mut out[FRAME_HEADER_SIZE..]);
        for sample in input[..codesize].chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            // Keep the top `bits` bits, biased to unsigned for packing.
            let biased = (value as i32 + 32768) as u32;
            writer.write(biased >> (16 - bits), bits);
        }

        Ok((codesize, frame_length))
    }

    /// Decode one frame from the start of `input`. The bitpool is taken
    /// from the frame header, so a mid-stream bitpool change on the
    /// encoder side changes the decoder's frame length accordingly.
    /// Returns (frame bytes consumed, pcm bytes written).
    pub fn decode(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(usize, usize), StreamError> {
        if input.len() < FRAME_HEADER_SIZE || input[0] != SYNCWORD {
            return Err(StreamError::Decode);
        }
        if input[1] != self.parameter_byte() {
            return Err(StreamError::Decode);
        }
        self.set_bitpool(input[2]);

        let codesize = self.codesize();
        let frame_length = self.frame_length();
        if input.len() < frame_length || output.len() < codesize {
            return Err(StreamError::Decode);
        }

        let bits = self.bits_per_sample(frame_length);
        let mut reader = BitReader::new(&input[FRAME_HEADER_SIZE..frame_length]);
        for sample in output[..codesize].chunks_exact_mut(2) {
            let biased = reader.read(bits) << (16 - bits);
            let value = (biased as i32 - 32768) as i16;
            sample.copy_from_slice(&value.to_le_bytes());
        }

        Ok((frame_length, codesize))
    }

    /// Compact parameter fingerprint carried in each frame header, used
    /// to reject frames from a differently configured encoder.
    fn parameter_byte(&self) -> u8 {
        let mode = match self.params.mode {
            ChannelMode::Mono => 0u8,
            ChannelMode::DualChannel => 1,
            ChannelMode::Stereo => 2,
            ChannelMode::JointStereo => 3,
        };
        let blocks = (self.params.blocks / 4 - 1) & 0x03;
        let subbands = if self.params.subbands == 8 { 1 } else { 0 };
        let alloc = if self.params.allocation == Allocation::Loudness {
            1
        } else {
            0
        };
        (mode << 6) | (blocks << 4) | (subbands << 3) | (alloc << 2)
    }
}

struct BitWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn write(&mut self, value: u32, bits: u32) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1;
            let byte = self.pos / 8;
            if byte >= self.buf.len() {
                return;
            }
            self.buf[byte] |= (bit as u8) << (7 - (self.pos % 8));
            self.pos += 1;
        }
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read(&mut self, bits: u32) -> u32 {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.pos / 8;
            let bit = if byte < self.buf.len() {
                (self.buf[byte] >> (7 - (self.pos % 8))) & 1
            } else {
                0
            };
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        value
    }
}

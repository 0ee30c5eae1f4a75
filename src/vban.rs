/// VBAN audio-over-UDP wire codec.
///
/// Packet format (28-byte header + PCM payload):
/// ```text
/// ┌──────────┬──────────┬─────────┬─────────┬─────────┬───────────┬──────────┬─────────────┐
/// │ Byte 0-3 │ Byte 4   │ Byte 5  │ Byte 6  │ Byte 7  │ Byte 8-23 │ Byte 24-27│ Byte 28..N │
/// │ "VBAN"   │ proto|SR │ frames-1│ chans-1 │ codec|fmt│ name     │ sequence  │ PCM payload│
/// │          │ 3b | 5b  │ (u8)    │ (u8)    │ 4b | 3b │ (16B)     │ (u32 LE)  │            │
/// └──────────┴──────────┴─────────┴─────────┴─────────┴───────────┴──────────┴─────────────┘
/// ```
///
/// Payload length must equal `frames × bytes_per_sample × channels`.
/// Reference: https://www.vb-audio.com/Voicemeeter/VBANProtocol_Specifications.pdf
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Fixed header size preceding the PCM payload.
pub const HEADER_SIZE: usize = 28;

/// Maximum payload bytes a sender may put in one datagram.
pub const MAX_DATA_SIZE: usize = 1436;

// ── Protocols (bits 7..5 of byte 4) ────────────────────────────────────

pub const PROTOCOL_AUDIO: u8 = 0x00;
pub const PROTOCOL_SERIAL: u8 = 0x20;
pub const PROTOCOL_TXT: u8 = 0x40;
pub const PROTOCOL_SERVICE: u8 = 0x60;

// ── Codecs (bits 7..4 of byte 7) ───────────────────────────────────────

pub const CODEC_PCM: u8 = 0x00;

/// Sample-rate table indexed by bits 4..0 of byte 4.
pub const SAMPLE_RATES: [u32; 21] = [
    6000, 12000, 24000, 48000, 96000, 192000, 384000,
    8000, 16000, 32000, 64000, 128000, 256000, 512000,
    11025, 22050, 44100, 88200, 176400, 352800, 705600,
];

// ═══════════════════════════════════════════════════════════════════════
//  Sample formats
// ═══════════════════════════════════════════════════════════════════════

/// PCM sample format (bits 2..0 of byte 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    F32,
    F64,
    B12,
    B10,
}

impl SampleFormat {
    /// Decode the 3-bit wire value. All eight values are defined.
    pub fn from_wire(bits: u8) -> SampleFormat {
        match bits & 0x07 {
            0 => SampleFormat::U8,
            1 => SampleFormat::S16,
            2 => SampleFormat::S24,
            3 => SampleFormat::S32,
            4 => SampleFormat::F32,
            5 => SampleFormat::F64,
            6 => SampleFormat::B12,
            _ => SampleFormat::B10,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            SampleFormat::U8 => 0,
            SampleFormat::S16 => 1,
            SampleFormat::S24 => 2,
            SampleFormat::S32 => 3,
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 5,
            SampleFormat::B12 => 6,
            SampleFormat::B10 => 7,
        }
    }

    /// Format name as exposed in the stats JSON and pipe path template.
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16le",
            SampleFormat::S24 => "s24le",
            SampleFormat::S32 => "s32le",
            SampleFormat::F32 => "float32le",
            SampleFormat::F64 => "float64le",
            SampleFormat::B12 => "unknown12",
            SampleFormat::B10 => "unknown10",
        }
    }

    /// Bytes per single-channel sample. The packed 12/10-bit formats have
    /// no byte-aligned width and report 0, which fails the payload-size
    /// check for any non-empty payload.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 => 3,
            SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
            SampleFormat::B12 | SampleFormat::B10 => 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Parsed header
// ═══════════════════════════════════════════════════════════════════════

/// A decoded VBAN header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Sub-protocol selector; only [`PROTOCOL_AUDIO`] reaches the engine.
    pub protocol: u8,
    pub sample_rate: u32,
    /// Frames (samples per channel) in this packet, 1..=256.
    pub frames: u32,
    /// Channel count, 1..=256.
    pub channels: u32,
    pub format: SampleFormat,
    /// Codec selector; only [`CODEC_PCM`] reaches the engine.
    pub codec: u8,
    /// Stream name, NUL-trimmed, lossily decoded. Untrusted input.
    pub name: String,
    /// Sender-assigned sequence number, wraps at 2^32.
    pub seq: u32,
}

impl Header {
    /// Bytes per frame (one sample across all channels).
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Expected payload length for this header.
    pub fn data_size(&self) -> usize {
        self.frames as usize * self.frame_size()
    }
}

/// Codec failure kinds. `Protocol`-class errors per the error design:
/// logged and dropped, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic, not a VBAN packet")]
    BadMagic,
    #[error("invalid sample rate index {0}")]
    BadSampleRate(u8),
    #[error("payload size {actual} does not match header geometry {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Parse one datagram (header + payload) into a [`Header`].
///
/// Pure; the only allocation is the stream-name `String`.
pub fn parse(buf: &[u8]) -> Result<Header, ParseError> {
    if buf.len() < HEADER_SIZE {
        return Err(ParseError::TooShort(buf.len()));
    }

    if &buf[0..4] != b"VBAN" {
        return Err(ParseError::BadMagic);
    }

    let protocol = buf[4] & 0xe0;
    let sr_index = buf[4] & 0x1f;
    if sr_index as usize >= SAMPLE_RATES.len() {
        return Err(ParseError::BadSampleRate(sr_index));
    }

    let header = Header {
        protocol,
        sample_rate: SAMPLE_RATES[sr_index as usize],
        frames: buf[5] as u32 + 1,
        channels: buf[6] as u32 + 1,
        format: SampleFormat::from_wire(buf[7]),
        codec: buf[7] & 0xf0,
        name: decode_name(&buf[8..24]),
        seq: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
    };

    let actual = buf.len() - HEADER_SIZE;
    let expected = header.data_size();
    if actual != expected {
        return Err(ParseError::SizeMismatch { expected, actual });
    }

    Ok(header)
}

/// NUL-trimmed, lossy decode of the 16-byte name field.
fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ═══════════════════════════════════════════════════════════════════════
//  Packet builder
// ═══════════════════════════════════════════════════════════════════════

/// Build a raw VBAN datagram. Mirror of [`parse`]; the sample-rate index
/// is looked up in [`SAMPLE_RATES`] (falls back to index 0 for rates not
/// in the table).
pub fn encode(
    sample_rate: u32,
    frames: u32,
    channels: u32,
    format: SampleFormat,
    name: &str,
    seq: u32,
    payload: &[u8],
) -> Vec<u8> {
    let sr_index = SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(0) as u8;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(b"VBAN");
    buf.push(PROTOCOL_AUDIO | sr_index);
    buf.push((frames - 1) as u8);
    buf.push((channels - 1) as u8);
    buf.push(CODEC_PCM | format.to_wire());

    let mut name_field = [0u8; 16];
    let name_bytes = name.as_bytes();
    let n = name_bytes.len().min(16);
    name_field[..n].copy_from_slice(&name_bytes[..n]);
    buf.extend_from_slice(&name_field);

    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const BYTE_FORMATS: [SampleFormat; 6] = [
        SampleFormat::U8,
        SampleFormat::S16,
        SampleFormat::S24,
        SampleFormat::S32,
        SampleFormat::F32,
        SampleFormat::F64,
    ];

    #[test]
    fn test_roundtrip_all_rates_and_formats() {
        for (sr_index, &rate) in SAMPLE_RATES.iter().enumerate() {
            for &format in &BYTE_FORMATS {
                for &(frames, channels) in &[(1u32, 1u32), (64, 2), (256, 8)] {
                    let size = frames as usize * channels as usize * format.bytes_per_sample();
                    let payload = vec![0x5a; size];
                    let pkt = encode(rate, frames, channels, format, "test", 42, &payload);

                    let hdr = parse(&pkt).unwrap_or_else(|e| {
                        panic!("sr_index={sr_index} format={format:?}: {e}")
                    });
                    assert_eq!(hdr.protocol, PROTOCOL_AUDIO);
                    assert_eq!(hdr.codec, CODEC_PCM);
                    assert_eq!(hdr.sample_rate, rate);
                    assert_eq!(hdr.frames, frames);
                    assert_eq!(hdr.channels, channels);
                    assert_eq!(hdr.format, format);
                    assert_eq!(hdr.name, "test");
                    assert_eq!(hdr.seq, 42);
                    assert_eq!(hdr.data_size(), size);
                }
            }
        }
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(parse(&[]), Err(ParseError::TooShort(0))));
        let short = vec![0u8; HEADER_SIZE - 1];
        assert!(matches!(parse(&short), Err(ParseError::TooShort(27))));
    }

    #[test]
    fn test_bad_magic() {
        let mut pkt = encode(48000, 1, 1, SampleFormat::S16, "x", 0, &[0, 0]);
        pkt[0] = b'R';
        assert!(matches!(parse(&pkt), Err(ParseError::BadMagic)));
    }

    #[test]
    fn test_bad_sample_rate_index() {
        for sr_index in 21u8..=31 {
            let mut pkt = encode(48000, 1, 1, SampleFormat::S16, "x", 0, &[0, 0]);
            pkt[4] = PROTOCOL_AUDIO | sr_index;
            assert_eq!(parse(&pkt), Err(ParseError::BadSampleRate(sr_index)));
        }
    }

    #[test]
    fn test_payload_size_mismatch() {
        // header says 4 frames × s16le × 2 channels = 16 bytes; send 14
        let payload = vec![0u8; 14];
        let mut pkt = encode(48000, 4, 2, SampleFormat::S16, "x", 0, &[0u8; 16]);
        pkt.truncate(HEADER_SIZE);
        pkt.extend_from_slice(&payload);
        assert_eq!(
            parse(&pkt),
            Err(ParseError::SizeMismatch { expected: 16, actual: 14 })
        );
    }

    #[test]
    fn test_packed_formats_reject_payload() {
        // 12-bit formats have no byte-aligned sample size; any payload fails
        let mut pkt = encode(48000, 4, 1, SampleFormat::B12, "x", 0, &[]);
        pkt.extend_from_slice(&[0u8; 6]);
        assert!(matches!(parse(&pkt), Err(ParseError::SizeMismatch { .. })));
    }

    #[test]
    fn test_name_is_nul_trimmed() {
        let pkt = encode(48000, 1, 1, SampleFormat::S16, "mic", 7, &[0, 0]);
        let hdr = parse(&pkt).unwrap();
        assert_eq!(hdr.name, "mic");
        assert_eq!(hdr.name.len(), 3);
    }

    #[test]
    fn test_name_full_16_bytes() {
        let pkt = encode(48000, 1, 1, SampleFormat::S16, "abcdefghijklmnopXX", 7, &[0, 0]);
        let hdr = parse(&pkt).unwrap();
        assert_eq!(hdr.name, "abcdefghijklmnop");
    }

    #[test]
    fn test_sequence_little_endian() {
        let pkt = encode(48000, 1, 1, SampleFormat::S16, "x", 0x0403_0201, &[0, 0]);
        assert_eq!(pkt[24..28], [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(parse(&pkt).unwrap().seq, 0x0403_0201);
    }

    #[test]
    fn test_non_audio_protocol_carried_through() {
        let mut pkt = encode(48000, 1, 1, SampleFormat::S16, "x", 0, &[0, 0]);
        pkt[4] = PROTOCOL_SERIAL | (pkt[4] & 0x1f);
        let hdr = parse(&pkt).unwrap();
        assert_eq!(hdr.protocol, PROTOCOL_SERIAL);
    }
}

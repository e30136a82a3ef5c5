// src/link/codec.rs
//
// Stateful decoder for the interleaved telemetry/console byte stream.
//
// The wire mixes two framings behind one terminator byte:
//   binary: u32 timestamp_ms | 5 x f32 | 0x0A   (25 bytes, little-endian)
//   text:   arbitrary bytes | 0x0A
//
// Resolution order is binary-first: a buffer holding >= 25 bytes whose byte
// 24 is 0x0A is tried as a packet, and only rejected (back to text parsing)
// when a float field is non-finite. A 24-byte text line therefore decodes as
// telemetry whenever its bytes happen to form finite floats; that ambiguity
// is inherent to the wire format and preserved for compatibility.

use crate::link::{GatewayEvent, TelemetryFrame, FRAME_TERMINATOR, PACKET_SIZE};

// ============================================================================
// Packet Codec
// ============================================================================

/// Decode one `PACKET_SIZE`-byte candidate. Returns `None` when any float
/// field is non-finite, which sends the bytes back through text parsing.
///
/// The caller guarantees `bytes.len() >= PACKET_SIZE` and a terminator at
/// byte `PACKET_SIZE - 1`.
pub fn decode_packet(bytes: &[u8]) -> Option<TelemetryFrame> {
    let le_f32 = |off: usize| f32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);

    let frame = TelemetryFrame {
        timestamp_ms: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        setpoint: le_f32(4),
        measured: le_f32(8),
        error: le_f32(12),
        pitch_angle: le_f32(16),
        roll_angle: le_f32(20),
    };

    let fields = [frame.setpoint, frame.measured, frame.error, frame.pitch_angle, frame.roll_angle];
    if fields.iter().any(|v| !v.is_finite()) {
        return None;
    }

    Some(frame)
}

/// Encode a telemetry frame into its wire form. Counterpart of
/// [`decode_packet`]; used by the device simulator and tests.
pub fn encode_packet(frame: &TelemetryFrame) -> [u8; PACKET_SIZE] {
    let mut out = [0u8; PACKET_SIZE];
    out[0..4].copy_from_slice(&frame.timestamp_ms.to_le_bytes());
    out[4..8].copy_from_slice(&frame.setpoint.to_le_bytes());
    out[8..12].copy_from_slice(&frame.measured.to_le_bytes());
    out[12..16].copy_from_slice(&frame.error.to_le_bytes());
    out[16..20].copy_from_slice(&frame.pitch_angle.to_le_bytes());
    out[20..24].copy_from_slice(&frame.roll_angle.to_le_bytes());
    out[24] = FRAME_TERMINATOR;
    out
}

// ============================================================================
// Frame Decoder
// ============================================================================

/// Stateful frame decoder for streaming data.
///
/// Feed raw reads in any chunking; complete frames come back as events and
/// partial frames stay buffered for the next call. Chunk boundaries never
/// change the decoded sequence.
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buf: Vec::with_capacity(4 * PACKET_SIZE),
        }
    }

    /// Feed raw bytes into the decoder.
    /// Returns every complete frame that can now be resolved, in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<GatewayEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            // Binary-frame test: fixed length ending in the terminator.
            if self.buf.len() >= PACKET_SIZE && self.buf[PACKET_SIZE - 1] == FRAME_TERMINATOR {
                if let Some(frame) = decode_packet(&self.buf[..PACKET_SIZE]) {
                    self.buf.drain(..PACKET_SIZE);
                    events.push(GatewayEvent::Telemetry(frame));
                    continue;
                }
                // Non-finite candidate: reparse the same bytes as text below.
            }

            // Text-line fallback: everything up to the next terminator.
            if let Some(pos) = self.buf.iter().position(|&b| b == FRAME_TERMINATOR) {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                events.push(GatewayEvent::Console { text });
                continue;
            }

            break;
        }

        events
    }

    /// Flush any unterminated residue as a best-effort console line.
    /// Call when the stream ends; bytes are never silently dropped.
    pub fn flush(&mut self) -> Option<GatewayEvent> {
        if self.buf.is_empty() {
            return None;
        }
        let rest: Vec<u8> = self.buf.drain(..).collect();
        Some(GatewayEvent::Console {
            text: String::from_utf8_lossy(&rest).into_owned(),
        })
    }

    /// Number of bytes held back waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_frame() -> TelemetryFrame {
        TelemetryFrame {
            timestamp_ms: 1000,
            setpoint: 10.0,
            measured: 9.5,
            error: 0.5,
            pitch_angle: 1.2,
            roll_angle: -0.3,
        }
    }

    #[test]
    fn test_decode_sample_packet() {
        let bytes = encode_packet(&sample_frame());
        let frame = decode_packet(&bytes).unwrap();
        assert_eq!(frame.timestamp_ms, 1000);
        assert_relative_eq!(frame.setpoint, 10.0);
        assert_relative_eq!(frame.measured, 9.5);
        assert_relative_eq!(frame.error, 0.5);
        assert_relative_eq!(frame.pitch_angle, 1.2);
        assert_relative_eq!(frame.roll_angle, -0.3);
    }

    #[test]
    fn test_feed_single_packet() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&encode_packet(&sample_frame()));
        assert_eq!(events, vec![GatewayEvent::Telemetry(sample_frame())]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_feed_multiple_packets_one_call() {
        let mut decoder = FrameDecoder::new();
        let mut data = Vec::new();
        for i in 0..3u32 {
            let mut frame = sample_frame();
            frame.timestamp_ms = i * 20;
            data.extend_from_slice(&encode_packet(&frame));
        }
        let events = decoder.feed(&data);
        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            match event {
                GatewayEvent::Telemetry(f) => assert_eq!(f.timestamp_ms, i as u32 * 20),
                other => panic!("expected telemetry, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_text_line_alone() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"pid show\n");
        assert_eq!(events, vec![GatewayEvent::Console { text: "pid show".to_string() }]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_line_buffers_until_newline() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"imu: calibra").is_empty());
        assert_eq!(decoder.buffered(), 12);

        let events = decoder.feed(b"tion done\n");
        assert_eq!(events, vec![GatewayEvent::Console { text: "imu: calibration done".to_string() }]);
    }

    #[test]
    fn test_nan_rejected_at_every_float_position() {
        for field in 0..5 {
            let mut bytes = encode_packet(&sample_frame());
            let off = 4 + field * 4;
            bytes[off..off + 4].copy_from_slice(&f32::NAN.to_le_bytes());

            let mut decoder = FrameDecoder::new();
            let events = decoder.feed(&bytes);
            assert!(
                !events.iter().any(|e| matches!(e, GatewayEvent::Telemetry(_))),
                "NaN at field {} must not decode as telemetry",
                field
            );
        }
    }

    #[test]
    fn test_infinity_rejected_as_binary() {
        let mut bytes = encode_packet(&sample_frame());
        bytes[8..12].copy_from_slice(&f32::INFINITY.to_le_bytes());
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&bytes);
        assert!(!events.iter().any(|e| matches!(e, GatewayEvent::Telemetry(_))));
    }

    #[test]
    fn test_rejected_candidate_reparses_as_text() {
        // A rejected packet whose payload contains no earlier newline consumes
        // everything up to its own terminator as one lossy console line.
        let mut bytes = encode_packet(&TelemetryFrame {
            timestamp_ms: 0x41414141, // 'AAAA'
            setpoint: f32::NAN,
            measured: 9.5,
            error: 0.5,
            pitch_angle: 1.2,
            roll_angle: -0.3,
        });
        // Keep the payload free of stray 0x0A so the text scan lands on byte 24.
        assert!(!bytes[..PACKET_SIZE - 1].contains(&FRAME_TERMINATOR));

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&bytes);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], GatewayEvent::Console { .. }));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_text_and_binary_interleaved() {
        let mut decoder = FrameDecoder::new();
        let mut data = Vec::new();
        data.extend_from_slice(b"boot ok\n");
        data.extend_from_slice(&encode_packet(&sample_frame()));
        data.extend_from_slice(b"pid: kp=1.5\n");

        let events = decoder.feed(&data);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], GatewayEvent::Console { text: "boot ok".to_string() });
        assert_eq!(events[1], GatewayEvent::Telemetry(sample_frame()));
        assert_eq!(events[2], GatewayEvent::Console { text: "pid: kp=1.5".to_string() });
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let mut data = Vec::new();
        data.extend_from_slice(b"hello device\n");
        data.extend_from_slice(&encode_packet(&sample_frame()));
        data.extend_from_slice(b"log line\n");
        data.extend_from_slice(&encode_packet(&sample_frame()));

        let mut whole = FrameDecoder::new();
        let expected = whole.feed(&data);

        // Byte-at-a-time.
        let mut bytewise = FrameDecoder::new();
        let mut got = Vec::new();
        for &b in &data {
            got.extend(bytewise.feed(&[b]));
        }
        assert_eq!(got, expected);

        // Awkward split sizes.
        for split in [1, 7, 24, 25, 26, 40] {
            let mut decoder = FrameDecoder::new();
            let mut got = Vec::new();
            for chunk in data.chunks(split) {
                got.extend(decoder.feed(chunk));
            }
            assert_eq!(got, expected, "split size {}", split);
        }
    }

    #[test]
    fn test_lossy_text_decoding() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"bad \xff byte\n");
        match &events[0] {
            GatewayEvent::Console { text } => assert_eq!(text, "bad \u{fffd} byte"),
            other => panic!("expected console, got {:?}", other),
        }
    }

    #[test]
    fn test_flush_returns_residue() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"half a li").is_empty());
        assert_eq!(decoder.flush(), Some(GatewayEvent::Console { text: "half a li".to_string() }));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn test_ambiguous_24_byte_text_line() {
        // Pins the wire format's structural ambiguity: 24 ASCII bytes plus a
        // newline satisfy the binary-frame test, and when those bytes decode
        // to finite floats the line is (mis)read as telemetry. Documented
        // protocol behavior, not a decoder bug.
        let line = b"ABCDEFGHIJKLMNOPQRSTUVWX\n";
        assert_eq!(line.len(), PACKET_SIZE);
        assert!(decode_packet(line).is_some());

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(line);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], GatewayEvent::Telemetry(_)));
    }
}

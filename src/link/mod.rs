// src/link/mod.rs
//
// Serial gateway core. One physical link to the balance controller, decoded
// into typed events and fanned out to any number of observers:
//
//   serial bytes -> read loop -> FrameDecoder -> LinkMeter -> EventBus -> subscribers
//
// Commands travel the opposite direction through SerialLink::send.

pub mod bus;
pub mod codec;
mod error;
pub mod meter;
pub mod reader;

pub use bus::{EventBus, Subscription};
pub use codec::FrameDecoder;
pub use error::LinkError;
pub use meter::LinkMeter;
pub use reader::{
    frame_command, list_ports, LinkConfig, LinkInfo, LinkState, SerialLink, SerialPortInfo,
    DISCONNECT_NOTICE,
};

use serde::Serialize;

// ============================================================================
// Wire Constants
// ============================================================================

/// Size of one binary telemetry packet:
/// `u32 timestamp_ms | 5 x f32 | u8 terminator`, all little-endian.
pub const PACKET_SIZE: usize = 25;

/// Terminator byte shared by binary packets and text lines (ASCII newline).
///
/// This shared terminator is the protocol's only framing discriminator; a
/// text line of exactly `PACKET_SIZE - 1` bytes is indistinguishable from a
/// binary packet on the wire. The decoder keeps the legacy binary-first
/// resolution order for wire compatibility.
pub const FRAME_TERMINATOR: u8 = 0x0A;

// ============================================================================
// Event Model
// ============================================================================

/// One decoded binary telemetry packet.
///
/// `timestamp_ms` is device-relative (milliseconds since firmware boot), not
/// host time. Angles are degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TelemetryFrame {
    pub timestamp_ms: u32,
    pub setpoint: f32,
    pub measured: f32,
    pub error: f32,
    pub pitch_angle: f32,
    pub roll_angle: f32,
}

/// A single event produced by the gateway. Immutable once published; each
/// subscriber receives its own copy.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayEvent {
    /// Decoded binary telemetry packet.
    Telemetry(TelemetryFrame),
    /// Newline-terminated device text (log lines, command responses, decode
    /// fallback, and the synthetic disconnect notice).
    Console { text: String },
    /// Packet arrival rate over the last reporting window, synthesized by
    /// [`LinkMeter`] rather than read off the wire.
    LinkRate { packets_per_second: f64 },
}

// ============================================================================
// Network-Facing Serialization
// ============================================================================

/// Serialized form pushed to network clients, e.g.
/// `{"type":"pid","timestamp":1000,"setpoint":10.0,...}`.
///
/// A telemetry frame splits into a `pid` and an `angle` object because the
/// dashboard charts consume them separately.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Pid {
        timestamp: u32,
        setpoint: f32,
        measured: f32,
        error: f32,
    },
    Angle {
        timestamp: u32,
        pitch_angle: f32,
        roll_angle: f32,
    },
    Console {
        text: String,
    },
    Freq {
        value: f64,
    },
}

impl GatewayEvent {
    /// Map this event to the objects a network transport pushes to clients.
    pub fn to_wire(&self) -> Vec<WireMessage> {
        match self {
            GatewayEvent::Telemetry(frame) => vec![
                WireMessage::Pid {
                    timestamp: frame.timestamp_ms,
                    setpoint: frame.setpoint,
                    measured: frame.measured,
                    error: frame.error,
                },
                WireMessage::Angle {
                    timestamp: frame.timestamp_ms,
                    pitch_angle: frame.pitch_angle,
                    roll_angle: frame.roll_angle,
                },
            ],
            GatewayEvent::Console { text } => vec![WireMessage::Console { text: text.clone() }],
            GatewayEvent::LinkRate { packets_per_second } => {
                vec![WireMessage::Freq { value: *packets_per_second }]
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_telemetry_splits_into_pid_and_angle() {
        let wire = GatewayEvent::Telemetry(sample_frame()).to_wire();
        assert_eq!(wire.len(), 2);

        let pid = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(pid["type"], "pid");
        assert_eq!(pid["timestamp"], 1000);
        assert_eq!(pid["setpoint"], 10.0);
        assert_eq!(pid["measured"], 9.5);

        let angle = serde_json::to_value(&wire[1]).unwrap();
        assert_eq!(angle["type"], "angle");
        assert_eq!(angle["roll_angle"], serde_json::to_value(-0.3f32).unwrap());
    }

    #[test]
    fn test_console_wire_shape() {
        let wire = GatewayEvent::Console { text: "pid show".to_string() }.to_wire();
        assert_eq!(wire.len(), 1);
        let obj = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(obj["type"], "console");
        assert_eq!(obj["text"], "pid show");
    }

    #[test]
    fn test_rate_wire_shape() {
        let wire = GatewayEvent::LinkRate { packets_per_second: 99.5 }.to_wire();
        let obj = serde_json::to_value(&wire[0]).unwrap();
        assert_eq!(obj["type"], "freq");
        assert_eq!(obj["value"], 99.5);
    }
}

// src/lib.rs
//
// tiltlink: serial transport gateway for the TiltBot balance controller.
//
// The device emits an interleaved byte stream of fixed-size binary telemetry
// packets and newline-terminated console text over one serial port. This
// crate owns that link: it decodes the stream into typed events, meters
// packet throughput, fans events out to any number of subscribers, and
// writes commands back to the device with correct framing. Network-facing
// transports (WebSocket/SSE servers and the like) sit on top of the
// `SerialLink`/`EventBus` surface; none live here.

pub mod link;
pub mod logging;
pub mod settings;

pub use link::{
    frame_command, list_ports, EventBus, FrameDecoder, GatewayEvent, LinkConfig, LinkError, LinkInfo,
    LinkMeter, LinkState, SerialLink, SerialPortInfo, Subscription, TelemetryFrame, WireMessage,
    FRAME_TERMINATOR, PACKET_SIZE,
};

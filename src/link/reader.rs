// src/link/reader.rs
//
// Serial link lifecycle and read loop. One background thread per open link
// pulls bytes, runs them through the decoder and meter, and publishes the
// results; command writes are funneled through the same thread so their
// bytes never interleave on the wire.

use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::link::{EventBus, FrameDecoder, GatewayEvent, LinkError, LinkMeter};
use crate::tlog;

// ============================================================================
// Constants
// ============================================================================

/// Serial read timeout. Short, because reads happen only after the driver
/// reports pending input.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Default backoff when the driver reports no pending input. Bounds CPU use
/// without adding material latency, and keeps disconnect requests prompt.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bounded wait for the read loop to exit during teardown. A hung driver
/// must not hang process shutdown; after this we abandon the thread.
const SHUTDOWN_WAIT: Duration = Duration::from_millis(500);

/// Bounded wait for the read loop to pick up and complete a command write.
const SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Synthetic console line published whenever the stream ends.
pub const DISCONNECT_NOTICE: &str = "serial: disconnected";

// ============================================================================
// Types and Configuration
// ============================================================================

/// Connection parameters for one link.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM7")
    pub port: String,
    /// Serial baud rate (the controller firmware runs 115200)
    pub baud_rate: u32,
}

impl LinkConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        LinkConfig { port: port.into(), baud_rate }
    }
}

/// Externally observable link state. `Connecting` is transient; callers
/// mostly care about `Connected` vs `Disconnected`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the currently open link.
#[derive(Clone, Debug, Serialize)]
pub struct LinkInfo {
    pub port: String,
    pub baud_rate: u32,
    /// Local wall-clock time the port was opened, `HH:MM:SS.mmm`.
    pub opened_at: String,
}

/// Command write handed to the read loop, with a reply channel for the
/// outcome of the physical write.
struct TransmitRequest {
    data: Vec<u8>,
    result_tx: std_mpsc::SyncSender<Result<(), String>>,
}

type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;

/// The open physical connection: identity plus the handles needed to stop
/// its read loop. At most one exists per `SerialLink`.
struct ActiveLink {
    port_path: String,
    baud_rate: u32,
    opened_at: chrono::DateTime<chrono::Local>,
    cancel_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Frame an outbound command: trimmed text plus a single newline terminator.
/// The gateway does not interpret command grammar.
pub fn frame_command(command: &str) -> Vec<u8> {
    let mut payload = command.trim().as_bytes().to_vec();
    payload.push(b'\n');
    payload
}

// ============================================================================
// Serial Link
// ============================================================================

/// Owns the physical connection and the read loop that feeds the bus.
///
/// `connect`/`disconnect` are mutually exclusive with each other;
/// `send` may run concurrently with either and fails cleanly when it loses
/// the race with a teardown.
pub struct SerialLink {
    bus: Arc<EventBus>,
    poll_interval: Duration,
    rate_window: Duration,
    /// Slot for the open link; the mutex serializes connect/disconnect.
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    /// Capture point for `send`. Cleared on teardown and by the read loop
    /// when the stream dies underneath us.
    transmit_tx: Arc<Mutex<Option<TransmitSender>>>,
    state: Arc<Mutex<LinkState>>,
    /// Bumped on every connect and teardown. A read loop only writes back
    /// shared state while its own epoch is still current, so a loop that
    /// outlives its 500 ms teardown grace cannot clobber a newer link.
    epoch: Arc<AtomicU64>,
}

impl SerialLink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        SerialLink {
            bus,
            poll_interval: DEFAULT_POLL_INTERVAL,
            rate_window: crate::link::meter::RATE_REPORT_INTERVAL,
            active: tokio::sync::Mutex::new(None),
            transmit_tx: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the idle-poll backoff.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the rate-report window.
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    /// The bus this link publishes to.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn state(&self) -> LinkState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(LinkState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Snapshot of the open link, if any.
    pub async fn info(&self) -> Option<LinkInfo> {
        self.active.lock().await.as_ref().map(|link| LinkInfo {
            port: link.port_path.clone(),
            baud_rate: link.baud_rate,
            opened_at: link.opened_at.format("%H:%M:%S%.3f").to_string(),
        })
    }

    /// Open the device and start the read loop.
    ///
    /// If a link is already open it is fully torn down first; only one
    /// physical link exists at a time, and no two read loops ever run
    /// concurrently.
    pub async fn connect(&self, config: LinkConfig) -> Result<(), LinkError> {
        let mut active = self.active.lock().await;

        if let Some(old) = active.take() {
            self.teardown(old).await;
        }

        self.set_state(LinkState::Connecting);

        let port = match serialport::new(&config.port, config.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(p) => p,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(LinkError::OpenFailed {
                    port: config.port.clone(),
                    reason: e.to_string(),
                });
            }
        };

        // Discard whatever the OS driver queued before the open, so the
        // first decoded frame is not contaminated by stale bytes.
        let _ = port.clear(serialport::ClearBuffer::All);

        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel::<TransmitRequest>(32);
        if let Ok(mut guard) = self.transmit_tx.lock() {
            *guard = Some(transmit_tx);
        }

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let my_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let ctx = ReadLoopContext {
            port_path: config.port.clone(),
            bus: self.bus.clone(),
            cancel_flag: cancel_flag.clone(),
            poll_interval: self.poll_interval,
            rate_window: self.rate_window,
            my_epoch,
            epoch: self.epoch.clone(),
            state: self.state.clone(),
            transmit_slot: self.transmit_tx.clone(),
        };
        let task = tokio::task::spawn_blocking(move || run_link_blocking(port, transmit_rx, ctx));

        *active = Some(ActiveLink {
            port_path: config.port.clone(),
            baud_rate: config.baud_rate,
            opened_at: chrono::Local::now(),
            cancel_flag,
            task,
        });
        self.set_state(LinkState::Connected);

        tlog!("[link:{}] opened at {} baud", config.port, config.baud_rate);
        Ok(())
    }

    /// Stop the read loop and close the device. Idempotent, and always
    /// succeeds from the caller's perspective; close errors are swallowed.
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(link) = active.take() {
            self.teardown(link).await;
        }
    }

    /// Write one command to the device: trimmed, newline-terminated, and
    /// serialized with every other write (the read-loop thread is the only
    /// writer, so command bytes never interleave).
    ///
    /// The transmit sender is captured at call start; a concurrent
    /// disconnect either lets the write complete against the old handle or
    /// fails it cleanly.
    pub fn send(&self, command: &str) -> Result<(), LinkError> {
        let tx = {
            let guard = self.transmit_tx.lock().map_err(|_| LinkError::NotConnected)?;
            guard.clone().ok_or(LinkError::NotConnected)?
        };

        let (result_tx, result_rx) = std_mpsc::sync_channel(1);
        tx.try_send(TransmitRequest {
            data: frame_command(command),
            result_tx,
        })
        .map_err(|_| LinkError::SendFailed {
            reason: "transmit queue full or link closed".to_string(),
        })?;

        match result_rx.recv_timeout(SEND_TIMEOUT) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(LinkError::SendFailed { reason }),
            Err(_) => Err(LinkError::SendFailed {
                reason: format!("no write completion within {:?}", SEND_TIMEOUT),
            }),
        }
    }

    /// Signal the read loop, wait (bounded) for it to exit, and drop the
    /// handle. Must not fail: a hung driver is logged and abandoned.
    async fn teardown(&self, link: ActiveLink) {
        // Invalidate the loop's epoch first so a straggler cannot write
        // back state after we hand the slot to a new connect.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        link.cancel_flag.store(true, Ordering::SeqCst);

        if let Ok(mut guard) = self.transmit_tx.lock() {
            *guard = None;
        }

        match tokio::time::timeout(SHUTDOWN_WAIT, link.task).await {
            Ok(_) => {}
            Err(_) => {
                tlog!(
                    "[link:{}] read loop did not stop within {:?}; abandoning it",
                    link.port_path,
                    SHUTDOWN_WAIT
                );
            }
        }

        self.set_state(LinkState::Disconnected);
        tlog!("[link:{}] closed", link.port_path);
    }

    fn set_state(&self, state: LinkState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }
}

// ============================================================================
// Read Loop
// ============================================================================

/// Everything the blocking read loop needs, bundled to keep the spawn site
/// readable.
struct ReadLoopContext {
    port_path: String,
    bus: Arc<EventBus>,
    cancel_flag: Arc<AtomicBool>,
    poll_interval: Duration,
    rate_window: Duration,
    my_epoch: u64,
    epoch: Arc<AtomicU64>,
    state: Arc<Mutex<LinkState>>,
    transmit_slot: Arc<Mutex<Option<TransmitSender>>>,
}

/// Blocking read loop. Sole owner of the port, the decoder buffer, and the
/// meter; sole publisher to the bus for this link.
fn run_link_blocking(
    mut port: Box<dyn serialport::SerialPort>,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    ctx: ReadLoopContext,
) {
    let mut decoder = FrameDecoder::new();
    let mut meter = LinkMeter::with_interval(ctx.rate_window);
    let mut buf = [0u8; 256];
    let exit_reason;

    loop {
        if ctx.cancel_flag.load(Ordering::SeqCst) {
            exit_reason = "stopped";
            break;
        }

        // Pending command writes go out between reads; this thread is the
        // only writer to the port.
        while let Ok(req) = transmit_rx.try_recv() {
            let result = port
                .write_all(&req.data)
                .and_then(|_| port.flush())
                .map_err(|e| format!("write error: {}", e));
            let _ = req.result_tx.try_send(result);
        }

        // Driver hiccups while polling read back as "nothing available";
        // transient errors must not end the session.
        let available = port.bytes_to_read().unwrap_or(0) as usize;
        if available == 0 {
            std::thread::sleep(ctx.poll_interval);
            continue;
        }

        let want = available.min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(0) => {
                // EOF - port closed/disconnected underneath us.
                exit_reason = "disconnected";
                break;
            }
            Ok(n) => {
                for event in decoder.feed(&buf[..n]) {
                    let is_packet = matches!(event, GatewayEvent::Telemetry(_));
                    ctx.bus.publish(event);
                    if is_packet {
                        if let Some(rate_event) = meter.observe() {
                            ctx.bus.publish(rate_event);
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // The driver reported bytes but the read timed out; retry.
            }
            Err(e) => {
                tlog!("[link:{}] read error: {}", ctx.port_path, e);
                exit_reason = "error";
                break;
            }
        }
    }

    // Unterminated residue still reaches observers, then the notice.
    if let Some(event) = decoder.flush() {
        ctx.bus.publish(event);
    }
    ctx.bus.publish(GatewayEvent::Console { text: DISCONNECT_NOTICE.to_string() });

    // Only the current link may write back shared state; a superseded loop
    // (teardown already ran, possibly a new link opened) must not.
    if ctx.epoch.load(Ordering::SeqCst) == ctx.my_epoch {
        if let Ok(mut guard) = ctx.transmit_slot.lock() {
            *guard = None;
        }
        if let Ok(mut guard) = ctx.state.lock() {
            *guard = LinkState::Disconnected;
        }
    }

    tlog!("[link:{}] stream ended ({})", ctx.port_path, exit_reason);
    // Dropping the port closes it; close errors are not interesting.
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// List available serial ports.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices:
/// the cu (calling unit) devices are non-blocking and preferred for outgoing
/// connections, while the tty devices block on open waiting for carrier
/// detect.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, LinkError> {
    let ports = serialport::available_ports().map_err(|e| LinkError::Ports { reason: e.to_string() })?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    ("USB".to_string(), info.manufacturer, info.product, info.serial_number)
                }
                serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None),
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None, None),
                serialport::SerialPortType::Unknown => ("Unknown".to_string(), None, None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
            }
        })
        .collect())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_command_trims_and_terminates() {
        assert_eq!(frame_command("pid show"), b"pid show\n");
        assert_eq!(frame_command("  pid set kp 1.5  "), b"pid set kp 1.5\n");
        assert_eq!(frame_command("cmd\n"), b"cmd\n");
        assert_eq!(frame_command(""), b"\n");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let bus = Arc::new(EventBus::new());
        let link = SerialLink::new(bus);
        match link.send("pid show") {
            Err(LinkError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_to_missing_device_fails() {
        let bus = Arc::new(EventBus::new());
        let link = SerialLink::new(bus);
        let result = link
            .connect(LinkConfig::new("/dev/tiltlink-no-such-port", 115_200))
            .await;
        match result {
            Err(LinkError::OpenFailed { port, .. }) => {
                assert_eq!(port, "/dev/tiltlink-no-such-port");
            }
            other => panic!("expected OpenFailed, got {:?}", other),
        }
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.info().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let link = SerialLink::new(bus);
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}

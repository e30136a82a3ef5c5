// tools/device_sim/main.rs
//
// Balance-controller firmware simulator. Speaks the gateway's wire format on
// a serial port: 25-byte telemetry packets interleaved with console log
// lines, and an echo response for every received command line.
//
// Point it at one end of a pty pair and run the gateway against the other:
//   socat -d -d pty,raw,echo=0 pty,raw,echo=0
//   device-sim --port /dev/pts/3
//   tilt-gateway monitor --port /dev/pts/4

use std::io::{Read, Write};
use std::time::Duration;

use clap::Parser;

use tiltlink::link::codec::encode_packet;
use tiltlink::link::TelemetryFrame;

#[derive(Parser)]
#[command(name = "device-sim", version, about = "TiltBot firmware simulator for gateway testing")]
struct Args {
    /// Serial port to serve (e.g. one end of a pty pair)
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,
    /// Telemetry packets per second
    #[arg(long, default_value_t = 50.0)]
    rate_hz: f64,
    /// Emit a console log line every N packets (0 = never)
    #[arg(long, default_value_t = 100)]
    log_every: u64,
}

/// Small xorshift PRNG so runs are reproducible without pulling in a
/// dependency for a test tool.
struct Noise(u32);

impl Noise {
    fn next(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        // Map to [-1.0, 1.0)
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

/// First-order response of the platform pitch towards a wandering setpoint,
/// plus sensor wobble. Crude, but produces plausible-looking charts.
struct BalanceModel {
    t: f64,
    pitch: f32,
    noise: Noise,
}

impl BalanceModel {
    fn new() -> Self {
        BalanceModel {
            t: 0.0,
            pitch: 0.0,
            noise: Noise(0x2545_F491),
        }
    }

    fn step(&mut self, dt: f64, timestamp_ms: u32) -> TelemetryFrame {
        self.t += dt;

        let setpoint = (8.0 * (self.t * 0.5).sin()) as f32;
        // Chase the setpoint with a time constant of ~0.25 s.
        self.pitch += (setpoint - self.pitch) * (dt as f32 / 0.25).min(1.0);
        let measured = self.pitch + self.noise.next() * 0.4;
        let roll = (2.0 * (self.t * 0.9).cos()) as f32 + self.noise.next() * 0.2;

        TelemetryFrame {
            timestamp_ms,
            setpoint,
            measured,
            error: setpoint - measured,
            pitch_angle: measured,
            roll_angle: roll,
        }
    }
}

fn main() {
    let args = Args::parse();

    let mut port = match serialport::new(&args.port, args.baud)
        .timeout(Duration::from_millis(1))
        .open()
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("device-sim: failed to open {}: {}", args.port, e);
            std::process::exit(1);
        }
    };

    let period = Duration::from_secs_f64(1.0 / args.rate_hz.max(1.0));
    let period_ms = (period.as_secs_f64() * 1000.0).round() as u32;
    eprintln!(
        "device-sim: serving {} at {} baud ({} packets/s)",
        args.port, args.baud, args.rate_hz
    );

    let mut model = BalanceModel::new();
    let mut timestamp_ms: u32 = 0;
    let mut packet_count: u64 = 0;
    let mut cmd_buf: Vec<u8> = Vec::with_capacity(64);
    let mut read_buf = [0u8; 64];

    loop {
        let frame = model.step(period.as_secs_f64(), timestamp_ms);
        if let Err(e) = port.write_all(&encode_packet(&frame)) {
            eprintln!("device-sim: write failed ({}); exiting", e);
            break;
        }
        timestamp_ms = timestamp_ms.wrapping_add(period_ms);
        packet_count += 1;

        if args.log_every > 0 && packet_count % args.log_every == 0 {
            let line = format!(
                "status: t={}ms pitch={:+.2} err={:+.2}\n",
                frame.timestamp_ms, frame.pitch_angle, frame.error
            );
            let _ = port.write_all(line.as_bytes());
        }

        // Echo any received command lines the way the firmware console does.
        match port.read(&mut read_buf) {
            Ok(n) if n > 0 => {
                for &byte in &read_buf[..n] {
                    if byte == b'\n' {
                        let cmd = String::from_utf8_lossy(&cmd_buf).trim().to_string();
                        cmd_buf.clear();
                        if !cmd.is_empty() {
                            let _ = port.write_all(format!("ack: {}\n", cmd).as_bytes());
                        }
                    } else {
                        cmd_buf.push(byte);
                        if cmd_buf.len() > 256 {
                            cmd_buf.clear();
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                eprintln!("device-sim: read failed ({}); exiting", e);
                break;
            }
        }

        std::thread::sleep(period);
    }
}

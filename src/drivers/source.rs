use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::drivers::error::ConnectionError;

/// Byte stream the acquisition worker reads from. Reads are expected to time
/// out (`TimedOut` / `WouldBlock`) on a silent link rather than block forever.
pub type Link = Box<dyn Read + Send>;

/// Something that can open a link to the device.
pub trait LinkOpener: Send + Sync {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Link, ConnectionError>;
}

/// Opens real serial ports (8N1, no flow control).
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Link, ConnectionError> {
        let handle = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| ConnectionError::new(port, e))?;
        Ok(Box::new(handle))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// Serial ports currently visible to the OS, sorted by name.
pub fn list_ports() -> Result<Vec<PortInfo>, serialport::Error> {
    let ports = serialport::available_ports()?;
    let mut out: Vec<PortInfo> = ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let parts: Vec<String> =
                        info.manufacturer.into_iter().chain(info.product).collect();
                    if parts.is_empty() {
                        "USB serial".to_string()
                    } else {
                        parts.join(" ")
                    }
                }
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::Unknown => String::new(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Result of one attempt to pull a line off the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    /// A complete line, terminator stripped.
    Line(String),
    /// The read timed out with no complete line pending.
    Idle,
    /// The link reported end of stream.
    Closed,
    /// `max_line_bytes` arrived without a terminator; holds a lossy prefix of
    /// the discarded bytes.
    Oversized(String),
}

/// Splits a timed-out byte stream into newline-terminated lines. Partial
/// lines survive across timeouts.
pub struct LineReader {
    link: Link,
    pending: Vec<u8>,
    chunk: [u8; 256],
    max_line_bytes: usize,
    // Inside an oversized line; drop bytes up to the next terminator.
    discarding: bool,
}

impl LineReader {
    pub fn new(link: Link, max_line_bytes: usize) -> Self {
        Self {
            link,
            pending: Vec::with_capacity(max_line_bytes),
            chunk: [0; 256],
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    /// Returns the next line, or `Idle` when one read did not complete a line.
    /// Performs at most one read, so callers regain control within one read
    /// timeout even on a link that never sends a terminator. Any I/O error
    /// other than a timeout is returned as is and should be treated as a lost
    /// link.
    pub fn next_line(&mut self) -> io::Result<LineEvent> {
        if let Some(event) = self.take_buffered() {
            return Ok(event);
        }
        match self.link.read(&mut self.chunk) {
            Ok(0) => return Ok(LineEvent::Closed),
            Ok(n) => self.pending.extend_from_slice(&self.chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Ok(LineEvent::Idle)
            }
            Err(e) => return Err(e),
        }
        Ok(self.take_buffered().unwrap_or(LineEvent::Idle))
    }

    fn take_buffered(&mut self) -> Option<LineEvent> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Some(LineEvent::Line(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.discarding {
                self.pending.clear();
                return None;
            }
            if self.pending.len() > self.max_line_bytes {
                let prefix =
                    String::from_utf8_lossy(&self.pending[..64.min(self.pending.len())]).into_owned();
                self.pending.clear();
                self.discarding = true;
                return Some(LineEvent::Oversized(prefix));
            }
            return None;
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }
}

/// In-memory link useful for tests and deterministic playback: hands out the
/// scripted chunks in order, then either times out forever or fails.
pub struct ScriptedLink {
    chunks: VecDeque<Vec<u8>>,
    then: ScriptEnd,
    idle_delay: Duration,
}

#[derive(Clone, Copy, Debug)]
enum ScriptEnd {
    Silence,
    Fail(io::ErrorKind),
    Eof,
}

impl ScriptedLink {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            then: ScriptEnd::Silence,
            idle_delay: Duration::from_millis(2),
        }
    }

    /// One chunk per line, each terminated with `\n`.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            lines
                .into_iter()
                .map(|l| format!("{}\n", l.as_ref()).into_bytes())
                .collect::<Vec<_>>(),
        )
    }

    /// After the script runs out, fail every read with `kind` (device unplugged).
    pub fn then_fail(mut self, kind: io::ErrorKind) -> Self {
        self.then = ScriptEnd::Fail(kind);
        self
    }

    pub fn then_eof(mut self) -> Self {
        self.then = ScriptEnd::Eof;
        self
    }
}

impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(mut chunk) = self.chunks.pop_front() {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            return Ok(n);
        }
        match self.then {
            ScriptEnd::Silence => {
                thread::sleep(self.idle_delay);
                Err(io::Error::new(io::ErrorKind::TimedOut, "scripted link idle"))
            }
            ScriptEnd::Fail(kind) => Err(io::Error::new(kind, "scripted link failure")),
            ScriptEnd::Eof => Ok(0),
        }
    }
}

/// Opener that hands out pre-built links (or refusals) in order.
#[derive(Default)]
pub struct ManualOpener {
    queue: Mutex<VecDeque<Result<ScriptedLink, String>>>,
}

impl ManualOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(self, link: ScriptedLink) -> Self {
        self.push(Ok(link));
        self
    }

    pub fn with_refusal(self, reason: impl Into<String>) -> Self {
        self.push(Err(reason.into()));
        self
    }

    pub fn push(&self, next: Result<ScriptedLink, String>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(next);
    }
}

impl LinkOpener for ManualOpener {
    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        _read_timeout: Duration,
    ) -> Result<Link, ConnectionError> {
        let next = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(link)) => Ok(Box::new(link)),
            Some(Err(reason)) => Err(ConnectionError::new(port, reason)),
            None => Err(ConnectionError::new(port, "no such device")),
        }
    }
}

/// Synthetic rig: a brake warming up under a sinusoidal duty cycle.
pub struct SimulatedLink {
    period: Duration,
    read_timeout: Duration,
    next_due: Instant,
    clock_ms: i64,
    phase: f64,
    out: VecDeque<u8>,
}

impl SimulatedLink {
    pub fn new(rate_hz: f64, read_timeout: Duration) -> Self {
        let rate_hz = if rate_hz.is_finite() && rate_hz > 0.0 { rate_hz } else { 10.0 };
        Self {
            period: Duration::from_secs_f64(1.0 / rate_hz),
            read_timeout,
            next_due: Instant::now(),
            clock_ms: 0,
            phase: 0.0,
            out: VecDeque::new(),
        }
    }

    fn next_line(&mut self) -> String {
        let mut rng = rand::thread_rng();
        self.phase += 0.05;
        self.clock_ms += self.period.as_millis() as i64;
        let duty = (self.phase.sin() + 1.0) * 0.5;
        let base = 25.0 + 200.0 * duty;
        let mut fields = vec![self.clock_ms.to_string()];
        for i in 0..8 {
            let ir = base + i as f64 * 1.5 + rng.gen_range(-0.5..0.5);
            fields.push(format!("{ir:.2}"));
        }
        let pad = base * 1.4 + rng.gen_range(-1.0..1.0);
        let caliper = base * 0.6 + rng.gen_range(-1.0..1.0);
        let force = 100.0 + 50.0 * duty + rng.gen_range(-2.0..2.0);
        let pressure = 2.5 * duty + rng.gen_range(-0.05..0.05);
        let rpm = 3500.0 - 1500.0 * duty + rng.gen_range(-10.0..10.0);
        for v in [pad, caliper, force, pressure, rpm] {
            fields.push(format!("{v:.2}"));
        }
        let mut line = fields.join(",");
        line.push_str("\r\n");
        line
    }
}

impl Read for SimulatedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.out.is_empty() {
            let now = Instant::now();
            if now < self.next_due {
                let wait = self.next_due - now;
                if wait > self.read_timeout {
                    thread::sleep(self.read_timeout);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no sample due"));
                }
                thread::sleep(wait);
            }
            self.next_due += self.period;
            let line = self.next_line();
            self.out.extend(line.bytes());
        }
        let n = self.out.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.out.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

/// Opens a [`SimulatedLink`] for any port name.
#[derive(Clone, Copy, Debug)]
pub struct SimulatedOpener {
    pub rate_hz: f64,
}

impl LinkOpener for SimulatedOpener {
    fn open(
        &self,
        _port: &str,
        _baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Link, ConnectionError> {
        Ok(Box::new(SimulatedLink::new(self.rate_hz, read_timeout)))
    }
}

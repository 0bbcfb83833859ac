// src/engine.rs
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::drivers::buffer::RingBufferStore;
use crate::drivers::decoder::decode;
use crate::drivers::error::{ConnectionError, DecodeError, DecodeFault};
use crate::drivers::source::{LineEvent, LineReader, LinkOpener};
use crate::drivers::stats::RunningStats;
use crate::recorder::ExportSink;
use crate::types::{Sample, SessionEvent};

/// Lifecycle of the reader worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionState {
    Stopped,
    Opening,
    Running,
}

/// Shared, lock-free view of the worker's state.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> AcquisitionState {
        match self.0.load(Ordering::Acquire) {
            1 => AcquisitionState::Opening,
            2 => AcquisitionState::Running,
            _ => AcquisitionState::Stopped,
        }
    }

    fn set(&self, state: AcquisitionState) {
        let raw = match state {
            AcquisitionState::Stopped => 0,
            AcquisitionState::Opening => 1,
            AcquisitionState::Running => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Health counters, updated by the worker and readable from anywhere.
#[derive(Debug, Default)]
pub struct AcquisitionCounters {
    lines_read: AtomicU64,
    samples_accepted: AtomicU64,
    malformed_lines: AtomicU64,
    export_overflows: AtomicU64,
    last_error: Mutex<Option<DecodeError>>,
}

impl AcquisitionCounters {
    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    pub fn samples_accepted(&self) -> u64 {
        self.samples_accepted.load(Ordering::Relaxed)
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    pub fn export_overflows(&self) -> u64 {
        self.export_overflows.load(Ordering::Relaxed)
    }

    pub fn last_decode_error(&self) -> Option<DecodeError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        for counter in [
            &self.lines_read,
            &self.samples_accepted,
            &self.malformed_lines,
            &self.export_overflows,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Holds the active export sink, if any. The controller installs and removes
/// it; the worker submits through it.
#[derive(Default)]
pub struct ExportSlot {
    sink: Mutex<Option<ExportSink>>,
}

impl ExportSlot {
    pub fn install(&self, sink: ExportSink) {
        *self.lock() = Some(sink);
    }

    pub fn take(&self) -> Option<ExportSink> {
        self.lock().take()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|s| s.path().to_path_buf())
    }

    /// `None` when no export is running, otherwise whether the sink took it.
    pub fn submit(&self, sample: &Sample) -> Option<bool> {
        self.lock().as_mut().map(|sink| sink.submit(sample))
    }

    fn lock(&self) -> MutexGuard<'_, Option<ExportSink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a decoded sample is handed to.
#[derive(Clone)]
pub struct FanOut {
    pub buffers: Arc<RingBufferStore>,
    pub stats: Arc<RunningStats>,
    pub export: Arc<ExportSlot>,
    pub counters: Arc<AcquisitionCounters>,
}

impl FanOut {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            buffers: Arc::new(RingBufferStore::with_capacity(ring_capacity)),
            stats: Arc::new(RunningStats::new()),
            export: Arc::new(ExportSlot::default()),
            counters: Arc::new(AcquisitionCounters::default()),
        }
    }

    /// Applies one sample to every consumer. None of them wait on rendering
    /// or disk I/O.
    pub fn dispatch(&self, sample: &Sample) {
        self.buffers.push_sample(sample);
        self.stats.update_sample(sample);
        if self.export.submit(sample) == Some(false) {
            self.counters.export_overflows.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn reject(&self, err: DecodeError) {
        let n = self.counters.malformed_lines.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 {
            warn!("{err}");
        } else {
            debug!("{err} ({n} malformed so far)");
        }
        *self
            .counters
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
    pub max_line_bytes: usize,
}

/// Owns the serial link on a dedicated thread while running.
pub struct AcquisitionLoop {
    port: String,
    state: Arc<StateCell>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AcquisitionLoop {
    /// Opens the link and starts reading. On failure the state is back to
    /// `Stopped` and nothing was spawned.
    pub fn start(
        opener: &dyn LinkOpener,
        settings: &LinkSettings,
        state: Arc<StateCell>,
        fanout: FanOut,
        events: Sender<SessionEvent>,
    ) -> Result<Self, ConnectionError> {
        state.set(AcquisitionState::Opening);
        let link = match opener.open(&settings.port, settings.baud_rate, settings.read_timeout) {
            Ok(link) => link,
            Err(err) => {
                state.set(AcquisitionState::Stopped);
                warn!("{err}");
                return Err(err);
            }
        };
        let reader = LineReader::new(link, settings.max_line_bytes);
        let stop = Arc::new(AtomicBool::new(false));
        state.set(AcquisitionState::Running);
        let worker = {
            let port = settings.port.clone();
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("acquisition".into())
                .spawn(move || read_loop(reader, port, fanout, stop, state, events))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                state.set(AcquisitionState::Stopped);
                return Err(ConnectionError::new(&settings.port, e));
            }
        };
        info!(
            "acquisition running on {} @ {} baud",
            settings.port, settings.baud_rate
        );
        Ok(Self {
            port: settings.port.clone(),
            state,
            stop,
            worker: Some(worker),
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> AcquisitionState {
        self.state.get()
    }

    /// True once the worker has exited on its own (link lost).
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals the worker and waits for it. Returns within one read timeout.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("acquisition worker on {} panicked", self.port);
            }
        }
        self.state.set(AcquisitionState::Stopped);
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(
    mut reader: LineReader,
    port: String,
    fanout: FanOut,
    stop: Arc<AtomicBool>,
    state: Arc<StateCell>,
    events: Sender<SessionEvent>,
) {
    let mut lost = None;
    // The flag is only checked between lines, so a decoded sample always
    // finishes its fan-out.
    while !stop.load(Ordering::Acquire) {
        match reader.next_line() {
            Ok(LineEvent::Line(line)) => {
                fanout.counters.lines_read.fetch_add(1, Ordering::Relaxed);
                match decode(&line) {
                    Ok(sample) => fanout.dispatch(&sample),
                    Err(err) => fanout.reject(err),
                }
            }
            Ok(LineEvent::Idle) => {}
            Ok(LineEvent::Oversized(prefix)) => {
                fanout.counters.lines_read.fetch_add(1, Ordering::Relaxed);
                let limit = reader.max_line_bytes();
                fanout.reject(DecodeError::new(DecodeFault::Oversized { limit }, prefix));
            }
            Ok(LineEvent::Closed) => {
                lost = Some(ConnectionError::new(&port, "device closed the link"));
                break;
            }
            Err(e) => {
                lost = Some(ConnectionError::new(&port, e));
                break;
            }
        }
    }
    state.set(AcquisitionState::Stopped);
    match lost {
        Some(err) => {
            warn!("acquisition lost: {err}");
            events.send(SessionEvent::ConnectionLost(err)).ok();
        }
        None => info!("acquisition on {port} stopped"),
    }
}

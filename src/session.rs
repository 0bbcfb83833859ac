// src/session.rs
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use log::info;

use crate::config::DaqConfig;
use crate::drivers::buffer::ChannelSnapshot;
use crate::drivers::error::{SessionError, StateError};
use crate::drivers::source::{LinkOpener, SerialOpener};
use crate::drivers::stats::RunningAverage;
use crate::engine::{AcquisitionLoop, AcquisitionState, FanOut, LinkSettings, StateCell};
use crate::recorder::{ExportSink, SinkOptions};
use crate::types::{Channel, ExportReport, SessionEvent, SessionState, SessionStatus};

/// One acquisition session: the only entry point the control surface uses.
///
/// Owns the worker threads, the live buffers and the export sink. Nothing is
/// global, so several sessions can coexist.
pub struct Session {
    config: DaqConfig,
    opener: Arc<dyn LinkOpener>,
    fanout: FanOut,
    state: Arc<StateCell>,
    acquisition: Option<AcquisitionLoop>,
    tx: Sender<SessionEvent>,
    rx: Receiver<SessionEvent>,
}

impl Session {
    /// Session that talks to real serial ports.
    pub fn new(config: DaqConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialOpener))
    }

    pub fn with_opener(config: DaqConfig, opener: Arc<dyn LinkOpener>) -> Self {
        let (tx, rx) = channel();
        let fanout = FanOut::new(config.ring_buffer_capacity);
        Self {
            config,
            opener,
            fanout,
            state: Arc::new(StateCell::default()),
            acquisition: None,
            tx,
            rx,
        }
    }

    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    pub fn state(&mut self) -> SessionState {
        self.reap();
        if self.acquisition.is_some() {
            SessionState::Acquiring
        } else {
            SessionState::Idle
        }
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.state.get()
    }

    pub fn is_exporting(&self) -> bool {
        self.fanout.export.is_active()
    }

    /// Opens `port` and starts the reader worker.
    pub fn start_acquisition(&mut self, port: &str, baud_rate: u32) -> Result<(), SessionError> {
        self.reap();
        if self.acquisition.is_some() {
            return Err(StateError::AlreadyAcquiring.into());
        }
        let settings = LinkSettings {
            port: port.to_string(),
            baud_rate,
            read_timeout: self.config.read_timeout(),
            max_line_bytes: self.config.max_line_bytes,
        };
        let acquisition = AcquisitionLoop::start(
            self.opener.as_ref(),
            &settings,
            Arc::clone(&self.state),
            self.fanout.clone(),
            self.tx.clone(),
        )?;
        self.acquisition = Some(acquisition);
        self.emit(SessionEvent::AcquisitionStarted {
            port: port.to_string(),
            baud_rate,
        });
        Ok(())
    }

    /// Stops reading. A running export is stopped first and its report returned.
    pub fn stop_acquisition(&mut self) -> Result<Option<ExportReport>, SessionError> {
        self.reap();
        let Some(acquisition) = self.acquisition.take() else {
            return Err(StateError::NotAcquiring.into());
        };
        let report = self.finish_export();
        acquisition.stop();
        self.emit(SessionEvent::AcquisitionStopped);
        Ok(report)
    }

    /// Starts writing accepted samples to a new timestamped file in `dir`.
    pub fn start_export(&mut self, dir: &Path) -> Result<PathBuf, SessionError> {
        self.reap();
        if self.acquisition.is_none() {
            return Err(StateError::ExportRequiresAcquisition.into());
        }
        if self.fanout.export.is_active() {
            return Err(StateError::AlreadyExporting.into());
        }
        let options = SinkOptions {
            queue_capacity: self.config.export_queue_capacity,
            flush_interval: self.config.export_flush_interval(),
        };
        let sink = ExportSink::start(dir, options, Some(self.tx.clone()))?;
        let path = sink.path().to_path_buf();
        self.fanout.export.install(sink);
        self.emit(SessionEvent::ExportStarted { path: path.clone() });
        Ok(path)
    }

    pub fn stop_export(&mut self) -> Result<ExportReport, SessionError> {
        self.reap();
        self.finish_export()
            .ok_or_else(|| StateError::NotExporting.into())
    }

    /// Clears the live buffers, averages and counters. Only while idle.
    pub fn reset_session(&mut self) -> Result<(), SessionError> {
        self.reap();
        if self.acquisition.is_some() {
            return Err(StateError::ResetRequiresIdle.into());
        }
        self.fanout.buffers.reset();
        self.fanout.stats.reset();
        self.fanout.counters.reset();
        info!("session reset");
        Ok(())
    }

    pub fn status(&mut self) -> SessionStatus {
        let state = self.state();
        let counters = &self.fanout.counters;
        SessionStatus {
            state,
            exporting: self.fanout.export.is_active(),
            export_path: self.fanout.export.path(),
            lines_read: counters.lines_read(),
            samples_accepted: counters.samples_accepted(),
            malformed_lines: counters.malformed_lines(),
            export_overflows: counters.export_overflows(),
            last_decode_error: counters.last_decode_error(),
        }
    }

    /// Drains pending signals (connection loss, export failures, lifecycle).
    pub fn poll_events(&mut self) -> Vec<SessionEvent> {
        self.reap();
        self.rx.try_iter().collect()
    }

    pub fn snapshot(&self, channel: Channel) -> ChannelSnapshot {
        self.fanout.buffers.snapshot(channel)
    }

    pub fn current(&self, channel: Channel) -> RunningAverage {
        self.fanout.stats.current(channel)
    }

    pub fn latest_values(&self) -> Option<[f64; Channel::COUNT]> {
        self.fanout.buffers.latest_sample_values()
    }

    /// Read handles for a renderer on another thread.
    pub fn fanout(&self) -> &FanOut {
        &self.fanout
    }

    // A worker that died on a lost link leaves the session idle; any export
    // that was running with it is closed out here.
    fn reap(&mut self) {
        let finished = self
            .acquisition
            .as_ref()
            .is_some_and(AcquisitionLoop::is_finished);
        if finished {
            if let Some(acquisition) = self.acquisition.take() {
                acquisition.stop();
            }
            self.finish_export();
        }
    }

    fn finish_export(&mut self) -> Option<ExportReport> {
        let report = self.fanout.export.take()?.stop();
        self.emit(SessionEvent::ExportStopped(report.clone()));
        Some(report)
    }

    fn emit(&self, event: SessionEvent) {
        self.tx.send(event).ok();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.finish_export();
        if let Some(acquisition) = self.acquisition.take() {
            acquisition.stop();
        }
    }
}

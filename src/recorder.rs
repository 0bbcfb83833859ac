use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{info, warn};

use crate::drivers::error::ExportError;
use crate::types::{csv_header, ExportReport, Sample, SessionEvent};

#[derive(Clone, Copy, Debug)]
pub struct SinkOptions {
    /// Samples that may wait for the writer before new ones are dropped.
    pub queue_capacity: usize,
    pub flush_interval: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 65_536,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// `data_YYYYMMDD_HH_MM_SS.csv` for the given capture time.
pub fn export_file_name(at: DateTime<Local>) -> String {
    at.format("data_%Y%m%d_%H_%M_%S.csv").to_string()
}

/// Appends accepted samples to a CSV file from a dedicated writer thread.
///
/// `submit` never waits on the disk: samples go through a bounded queue and a
/// full queue drops the sample, which is then reported as unflushed.
pub struct ExportSink {
    path: PathBuf,
    tx: Option<SyncSender<Sample>>,
    worker: Option<JoinHandle<WriterOutcome>>,
    submitted: u64,
    overflowed: u64,
}

struct WriterOutcome {
    flushed: u64,
    lost: u64,
    failure: Option<ExportError>,
}

/// Where the writer thread puts rows. `sync` runs once after the final flush.
pub(crate) trait ExportTarget: Write + Send + 'static {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ExportTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

impl ExportSink {
    /// Creates a fresh, timestamped export file in `dir` and writes the header.
    pub fn start(
        dir: &Path,
        options: SinkOptions,
        events: Option<Sender<SessionEvent>>,
    ) -> Result<Self, ExportError> {
        fs::create_dir_all(dir).map_err(|e| ExportError::from_io(dir, &e))?;
        let (path, file) = create_unique(dir, &export_file_name(Local::now()))?;
        Self::start_with(path, file, options, events)
    }

    pub(crate) fn start_with<W: ExportTarget>(
        path: PathBuf,
        target: W,
        options: SinkOptions,
        events: Option<Sender<SessionEvent>>,
    ) -> Result<Self, ExportError> {
        let mut writer = BufWriter::new(target);
        writeln!(writer, "{}", csv_header())
            .and_then(|_| writer.flush())
            .map_err(|e| ExportError::from_io(&path, &e))?;

        let (tx, rx) = mpsc::sync_channel(options.queue_capacity.max(1));
        let worker_path = path.clone();
        let worker = thread::Builder::new()
            .name("export-writer".into())
            .spawn(move || run_writer(worker_path, writer, rx, options.flush_interval, events))
            .map_err(|e| ExportError::from_io(&path, &e))?;
        info!("export started: {}", path.display());
        Ok(Self {
            path,
            tx: Some(tx),
            worker: Some(worker),
            submitted: 0,
            overflowed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues `sample` for writing. Returns `false` if it had to be dropped.
    pub fn submit(&mut self, sample: &Sample) -> bool {
        let Some(tx) = &self.tx else {
            self.overflowed += 1;
            return false;
        };
        match tx.try_send(sample.clone()) {
            Ok(()) => {
                self.submitted += 1;
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.overflowed += 1;
                false
            }
        }
    }

    /// Drains the queue, flushes and syncs the file, and reports what made it.
    pub fn stop(mut self) -> ExportReport {
        self.finish()
    }

    fn finish(&mut self) -> ExportReport {
        // Closing the queue lets the writer drain and exit.
        self.tx.take();
        let outcome = match self.worker.take().map(JoinHandle::join) {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => WriterOutcome {
                flushed: 0,
                lost: self.submitted,
                failure: Some(ExportError {
                    path: self.path.clone(),
                    kind: io::ErrorKind::Other,
                    message: "export writer panicked".into(),
                }),
            },
            None => WriterOutcome {
                flushed: 0,
                lost: 0,
                failure: None,
            },
        };
        let report = ExportReport {
            path: self.path.clone(),
            written: outcome.flushed,
            unflushed: outcome.lost + self.overflowed,
            failure: outcome.failure,
        };
        if report.is_complete() {
            info!(
                "export stopped: {} rows in {}",
                report.written,
                report.path.display()
            );
        } else {
            warn!(
                "export stopped: {} rows written, {} not flushed ({})",
                report.written,
                report.unflushed,
                report.path.display()
            );
        }
        report
    }
}

impl Drop for ExportSink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            // The report is logged by finish.
            self.finish();
        }
    }
}

fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File), ExportError> {
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, "csv"));
    let mut last_err = None;
    for attempt in 0..1000u32 {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem}_{attempt}.{ext}"))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(ExportError::from_io(&candidate, &e)),
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists));
    Err(ExportError::from_io(dir.join(name), &err))
}

fn run_writer<W: ExportTarget>(
    path: PathBuf,
    mut writer: BufWriter<W>,
    rx: Receiver<Sample>,
    flush_interval: Duration,
    events: Option<Sender<SessionEvent>>,
) -> WriterOutcome {
    let mut buffered = 0u64;
    let mut flushed = 0u64;
    let mut last_flush = Instant::now();
    let fail = |err: io::Error, writer: BufWriter<W>, lost: u64, flushed: u64| {
        let failure = ExportError::from_io(&path, &err);
        warn!("{failure}");
        if let Some(events) = &events {
            events.send(SessionEvent::ExportFailed(failure.clone())).ok();
        }
        // Drop what is still buffered without another write attempt.
        let _ = writer.into_parts();
        // Keep draining so producers never see a full queue; the rest is lost.
        let drained = rx.iter().count() as u64;
        WriterOutcome {
            flushed,
            lost: lost + drained,
            failure: Some(failure),
        }
    };

    loop {
        match rx.recv_timeout(flush_interval) {
            Ok(sample) => {
                if let Err(e) = writeln!(writer, "{}", sample.to_csv_row()) {
                    return fail(e, writer, buffered + 1, flushed);
                }
                buffered += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if buffered > 0 && last_flush.elapsed() >= flush_interval {
            if let Err(e) = writer.flush() {
                return fail(e, writer, buffered, flushed);
            }
            flushed += buffered;
            buffered = 0;
            last_flush = Instant::now();
        }
    }

    let finished = writer.flush().and_then(|_| writer.get_mut().sync());
    match finished {
        Ok(()) => WriterOutcome {
            flushed: flushed + buffered,
            lost: 0,
            failure: None,
        },
        Err(e) => fail(e, writer, buffered, flushed),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_target::controlled;
    use crate::drivers::decoder::decode;
    use crate::types::Channel;
    use chrono::TimeZone;

    fn sample(ts: i64, base: f64) -> Sample {
        let mut values = [0.0; Channel::COUNT];
        for (i, v) in values.iter_mut().enumerate() {
            *v = base + i as f64 * 0.25;
        }
        Sample::from_values(ts, values)
    }

    #[test]
    fn file_name_embeds_capture_time() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(export_file_name(at), "data_20240309_14_05_07.csv");
    }

    #[test]
    fn writes_header_and_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ExportSink::start(dir.path(), SinkOptions::default(), None).unwrap();
        let submitted = [sample(1, 20.0), sample(2, 21.5), sample(3, -4.0)];
        for s in &submitted {
            assert!(sink.submit(s));
        }
        let path = sink.path().to_path_buf();
        let report = sink.stop();
        assert!(report.is_complete());
        assert_eq!(report.written, 3);
        assert_eq!(report.path, path);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], csv_header());
        for (line, expected) in lines[1..].iter().zip(&submitted) {
            assert_eq!(&decode(line).unwrap(), expected);
        }
    }

    #[test]
    fn never_overwrites_an_earlier_export() {
        let dir = tempfile::tempdir().unwrap();
        let first = ExportSink::start(dir.path(), SinkOptions::default(), None).unwrap();
        let second = ExportSink::start(dir.path(), SinkOptions::default(), None).unwrap();
        assert_ne!(first.path(), second.path());
        first.stop();
        second.stop();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn suffixes_taken_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data_x.csv"), "").unwrap();
        let (path, _) = create_unique(dir.path(), "data_x.csv").unwrap();
        assert_eq!(path, dir.path().join("data_x_1.csv"));
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("runs").join("today");
        let sink = ExportSink::start(&nested, SinkOptions::default(), None).unwrap();
        assert!(sink.path().starts_with(&nested));
        assert_eq!(sink.stop().written, 0);
    }

    #[test]
    fn uncreatable_destination_fails_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let err = ExportSink::start(&blocker.join("sub"), SinkOptions::default(), None)
            .err()
            .unwrap();
        assert!(err.path.starts_with(&blocker));
    }

    #[test]
    fn dropping_a_running_sink_still_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ExportSink::start(dir.path(), SinkOptions::default(), None).unwrap();
        sink.submit(&sample(1, 1.0));
        sink.submit(&sample(2, 2.0));
        let path = sink.path().to_path_buf();
        drop(sink);
        assert_eq!(fs::read_to_string(path).unwrap().lines().count(), 3);
    }

    #[test]
    fn unflushed_samples_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ExportSink::start(dir.path(), SinkOptions::default(), None).unwrap();
        let s = sample(1, 0.0);
        assert!(sink.submit(&s));
        // Simulate a writer that has already gone away.
        sink.tx.take();
        assert!(!sink.submit(&s));
        assert!(!sink.submit(&s));
        let report = sink.stop();
        assert_eq!(report.written, 1);
        assert_eq!(report.unflushed, 2);
        assert!(!report.is_complete());
    }

    #[test]
    fn periodic_flush_makes_rows_visible_before_stop() {
        let dir = tempfile::tempdir().unwrap();
        let options = SinkOptions {
            queue_capacity: 16,
            flush_interval: Duration::from_millis(10),
        };
        let mut sink = ExportSink::start(dir.path(), options, None).unwrap();
        sink.submit(&sample(7, 1.0));
        let path = sink.path().to_path_buf();
        let deadline = Instant::now() + Duration::from_secs(5);
        while fs::read_to_string(&path).unwrap().lines().count() < 2 {
            assert!(Instant::now() < deadline, "row never flushed");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.stop().written, 1);
    }

    fn memory_sink(
        options: SinkOptions,
    ) -> (ExportSink, test_target::TargetControl, mpsc::Receiver<SessionEvent>) {
        let (target, control) = controlled();
        let (tx, rx) = mpsc::channel();
        let sink =
            ExportSink::start_with(PathBuf::from("memory.csv"), target, options, Some(tx)).unwrap();
        (sink, control, rx)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn write_failure_is_signalled_and_rest_counted_unflushed() {
        let options = SinkOptions {
            queue_capacity: 16,
            flush_interval: Duration::from_millis(5),
        };
        let (mut sink, control, events) = memory_sink(options);
        assert!(sink.submit(&sample(1, 1.0)));
        wait_until(|| control.text().lines().count() == 2);

        control.fail();
        assert!(sink.submit(&sample(2, 2.0)));
        assert!(sink.submit(&sample(3, 3.0)));
        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(&event, SessionEvent::ExportFailed(e) if e.kind == io::ErrorKind::Other));

        // Still accepted after the failure; the writer discards them.
        for ts in 4..14 {
            assert!(sink.submit(&sample(ts, 0.0)));
        }
        let report = sink.stop();
        assert_eq!(report.written, 1);
        assert_eq!(report.unflushed, 12);
        assert!(report.failure.is_some());
        assert!(!report.is_complete());
        assert_eq!(control.text().lines().count(), 2);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let options = SinkOptions {
            queue_capacity: 1,
            flush_interval: Duration::from_millis(1),
        };
        let (mut sink, control, _events) = memory_sink(options);
        control.stall();
        assert!(sink.submit(&sample(1, 1.0)));
        wait_until(|| control.is_stalled());

        assert!(sink.submit(&sample(2, 2.0)));
        let started = Instant::now();
        assert!(!sink.submit(&sample(3, 3.0)));
        assert!(started.elapsed() < Duration::from_millis(500));

        control.pass();
        let report = sink.stop();
        assert_eq!(report.written, 2);
        assert_eq!(report.unflushed, 1);
        assert!(report.failure.is_none());
        let rows: Vec<Sample> = control
            .text()
            .lines()
            .skip(1)
            .map(|l| decode(l).unwrap())
            .collect();
        assert_eq!(rows, vec![sample(1, 1.0), sample(2, 2.0)]);
    }
}

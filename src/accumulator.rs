//! Copies new access log lines into the accumulated log the analyzer reads.
//!
//! The read offset into the source log is checkpointed next to the
//! accumulated file (`<accumulated>.pos`) so restarts do not re-count lines.

use crate::activity::parse_timestamp;
use crate::config::ActivityConfig;
use chrono::{DateTime, Duration, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of a retention trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub kept: usize,
    pub removed: usize,
}

/// Tails the source log into the accumulated log.
pub struct LogAccumulator {
    source: PathBuf,
    accumulated: PathBuf,
    retention: Duration,
    accumulate_every: std::time::Duration,
    trim_every: std::time::Duration,
    /// Read offset into the source log. Held for every file operation.
    position: Mutex<u64>,
}

impl LogAccumulator {
    /// Create an accumulator, restoring the checkpoint if one exists.
    ///
    /// The accumulated log is created empty if missing so the analyzer can
    /// read it before the first source line arrives.
    pub fn new(config: &ActivityConfig) -> std::io::Result<Self> {
        let accumulator = Self {
            source: config.source_log_path.clone(),
            accumulated: config.accumulated_log_path.clone(),
            retention: Duration::minutes(config.retention_minutes),
            accumulate_every: std::time::Duration::from_secs(config.accumulate_interval_seconds),
            trim_every: std::time::Duration::from_secs(config.cleanup_interval_seconds),
            position: Mutex::new(0),
        };

        accumulator.open_accumulated()?;
        let restored = accumulator.restore_position();
        *accumulator.lock() = restored;
        Ok(accumulator)
    }

    pub fn accumulated_path(&self) -> &Path {
        &self.accumulated
    }

    /// Current read offset into the source log.
    pub fn position(&self) -> u64 {
        *self.lock()
    }

    fn open_accumulated(&self) -> std::io::Result<File> {
        if let Some(parent) = self.accumulated.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.accumulated)
    }

    fn checkpoint_path(&self) -> PathBuf {
        let mut name = self.accumulated.as_os_str().to_owned();
        name.push(".pos");
        PathBuf::from(name)
    }

    fn restore_position(&self) -> u64 {
        match std::fs::read_to_string(self.checkpoint_path()) {
            Ok(text) => match text.trim().parse() {
                Ok(pos) => {
                    info!(position = pos, "Restored access log position");
                    pos
                }
                Err(e) => {
                    warn!(error = %e, "Invalid access log checkpoint, starting from the beginning");
                    0
                }
            },
            Err(_) => {
                debug!("No access log checkpoint, starting from the beginning");
                0
            }
        }
    }

    fn save_position(&self, pos: u64) {
        if let Err(e) = std::fs::write(self.checkpoint_path(), pos.to_string()) {
            warn!(error = %e, "Failed to save access log position");
        }
    }

    /// Append complete new lines from the source log. Returns the number copied.
    pub fn accumulate_new_lines(&self) -> std::io::Result<usize> {
        let mut position = self.lock();

        let mut source = File::open(&self.source)?;
        let len = source.metadata()?.len();

        if len < *position {
            info!(
                previous = *position,
                size = len,
                "Access log rotated, reading from the beginning"
            );
            *position = 0;
        }

        if *position >= len {
            return Ok(0);
        }

        source.seek(SeekFrom::Start(*position))?;
        let mut reader = BufReader::new(source.take(len - *position));
        let mut out = BufWriter::new(self.open_accumulated()?);

        let mut line = Vec::new();
        let mut consumed = 0u64;
        let mut copied = 0;
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            // A trailing partial line is left for the next pass.
            if n == 0 || line.last() != Some(&b'\n') {
                break;
            }
            consumed += n as u64;

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(&['\r', '\n'][..]);
            if text.trim().is_empty() {
                continue;
            }
            writeln!(out, "{}", text)?;
            copied += 1;
        }
        out.flush()?;

        if consumed == 0 {
            return Ok(0);
        }
        *position += consumed;
        self.save_position(*position);

        debug!(lines = copied, position = *position, "Access log lines accumulated");
        Ok(copied)
    }

    /// Drop accumulated lines older than the retention window.
    pub fn trim_old_lines(&self) -> std::io::Result<TrimReport> {
        self.trim_old_lines_at(Utc::now())
    }

    fn trim_old_lines_at(&self, now: DateTime<Utc>) -> std::io::Result<TrimReport> {
        if self.retention <= Duration::zero() {
            return Ok(TrimReport::default());
        }

        let _guard = self.lock();

        let file = match File::open(&self.accumulated) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TrimReport::default());
            }
            Err(e) => return Err(e),
        };

        let cutoff = now - self.retention;
        let tmp = self.accumulated.with_extension("log.tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut report = TrimReport::default();

        for line in BufReader::new(file).lines() {
            let line = line?;
            match line_timestamp(&line) {
                Some(ts) if ts <= cutoff => report.removed += 1,
                // Lines without a timestamp are kept.
                _ => {
                    writeln!(out, "{}", line)?;
                    report.kept += 1;
                }
            }
        }
        out.flush()?;
        drop(out);

        std::fs::rename(&tmp, &self.accumulated)?;

        info!(
            kept = report.kept,
            removed = report.removed,
            "Accumulated log trimmed"
        );
        Ok(report)
    }

    /// Run accumulation and trimming until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                source = %self.source.display(),
                accumulated = %self.accumulated.display(),
                interval_secs = self.accumulate_every.as_secs(),
                "Log accumulator started"
            );

            let mut accumulate = interval_at(Instant::now(), self.accumulate_every);
            accumulate.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut trim = interval_at(Instant::now() + self.trim_every, self.trim_every);
            trim.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = accumulate.tick() => {
                        if let Err(e) = self.accumulate_new_lines() {
                            warn!(source = %self.source.display(), error = %e, "Failed to accumulate access log");
                        }
                    }
                    _ = trim.tick() => {
                        if let Err(e) = self.trim_old_lines() {
                            warn!(error = %e, "Failed to trim accumulated log");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Log accumulator stopped");
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timestamp at the start of a log line, if any.
fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let mut parts = line.splitn(3, ' ');
    let date = parts.next()?;
    let time = parts.next()?;
    parse_timestamp(&format!("{} {}", date, time))
}

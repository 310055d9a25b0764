//! Sync progress reporting.
//!
//! Reports observable progress during `recall sync` so users see which
//! store is being probed, which day is being processed, and how many days
//! are left. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

use chrono::NaiveDate;

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Source stores are being opened and probed. Total unknown.
    Probing,
    /// Day `n` of `total` is being extracted and indexed.
    Syncing { date: NaiveDate, n: u64, total: u64 },
    /// A day finished.
    DateDone {
        date: NaiveDate,
        messages: u64,
        indexed: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync pipeline.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync 2024-03-01  day 3 / 30".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Probing => "sync  probing sources...\n".to_string(),
            SyncProgressEvent::Syncing { date, n, total } => format!(
                "sync {}  day {} / {}\n",
                date,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::DateDone {
                date,
                messages,
                indexed,
            } => format!(
                "sync {}  {} messages, {} new\n",
                date,
                format_number(*messages),
                format_number(*indexed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Probing => serde_json::json!({
                "event": "progress",
                "phase": "probing"
            }),
            SyncProgressEvent::Syncing { date, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "syncing",
                "date": date.to_string(),
                "n": n,
                "total": total
            }),
            SyncProgressEvent::DateDone {
                date,
                messages,
                indexed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "date_done",
                "date": date.to_string(),
                "messages": messages,
                "indexed": indexed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    /// Collects events so callers can assert on them.
    struct Recorder(Mutex<Vec<SyncProgressEvent>>);

    impl SyncProgressReporter for Recorder {
        fn report(&self, event: SyncProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn reporters_accept_every_event() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let rec = Recorder(Mutex::new(Vec::new()));
        for reporter in [&rec as &dyn SyncProgressReporter, &NoProgress] {
            reporter.report(SyncProgressEvent::Probing);
            reporter.report(SyncProgressEvent::Syncing { date, n: 1, total: 2 });
            reporter.report(SyncProgressEvent::DateDone {
                date,
                messages: 10,
                indexed: 4,
            });
        }
        assert_eq!(rec.0.lock().unwrap().len(), 3);
        assert!(matches!(
            rec.0.lock().unwrap()[1],
            SyncProgressEvent::Syncing { n: 1, total: 2, .. }
        ));
    }
}

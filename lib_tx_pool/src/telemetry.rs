// Best-effort CSV sink for confirmation latency data. One line per
// confirmed transaction: `creation_ms,confirmation_ms`, no header.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

/// Appends confirmation rows to a CSV file under its own mutex. Write
/// failures are dropped; losing a telemetry row must never stall a
/// consensus thread.
pub struct CsvSink {
    file: Mutex<Option<File>>,
}

impl CsvSink {
    /// Open (or create) the sink file in append mode. A sink that fails to
    /// open degrades to a disabled one.
    pub fn open<P: AsRef<Path>>(path: P) -> CsvSink {
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(path = %path.as_ref().display(), %err, "csv sink disabled");
                None
            }
        };
        CsvSink {
            file: Mutex::new(file),
        }
    }

    /// A sink that swallows every row. Used when no telemetry is wanted.
    pub fn disabled() -> CsvSink {
        CsvSink {
            file: Mutex::new(None),
        }
    }

    pub fn record(&self, creation_time: u64, confirmation_time: u64) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "{},{}", creation_time, confirmation_time);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rows_are_appended_in_order() {
        let path = std::env::temp_dir().join(format!("csv_sink_test_{}.csv", std::process::id()));
        let _ = fs::remove_file(&path);

        let sink = CsvSink::open(&path);
        sink.record(100, 250);
        sink.record(300, 301);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "100,250\n300,301\n");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn disabled_sink_accepts_rows() {
        CsvSink::disabled().record(1, 2);
    }
}

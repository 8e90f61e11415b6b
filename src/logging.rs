//! Logging initialization.
//!
//! Events go to stderr in compact form and, when a log directory is
//! available, to a dated per-subsystem file
//! (`<subsystem>_<YYYYMMDD>.log`). Failure to open the file degrades to
//! stderr-only.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Thread-safe append writer for the daily log file.
struct SharedWriter(Mutex<File>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

fn open_daily_log(log_dir: &Path, subsystem: &str) -> io::Result<File> {
    let date = chrono::Utc::now().format("%Y%m%d");
    let path = log_dir.join(format!("{}_{}.log", subsystem, date));
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber. `log_dir` of `None` (or an unopenable
/// file) means stderr only. Safe to call once per process.
pub fn init(level: &str, log_dir: Option<&Path>, subsystem: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr);

    let file_layer = log_dir.and_then(|dir| match open_daily_log(dir, subsystem) {
        Ok(file) => {
            let shared: &'static SharedWriter = Box::leak(Box::new(SharedWriter(Mutex::new(file))));
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(shared),
            )
        }
        Err(e) => {
            eprintln!(
                "warning: failed to open log file in {}: {}",
                dir.display(),
                e
            );
            None
        }
    });

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if result.is_err() {
        // A subscriber is already installed (tests, embedding); keep it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_daily_log_creates_dated_file() {
        let dir = TempDir::new().unwrap();
        open_daily_log(dir.path(), "scheduler").unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("scheduler_"));
        assert!(names[0].ends_with(".log"));
    }

    #[test]
    fn test_shared_writer_appends() {
        let dir = TempDir::new().unwrap();
        let file = open_daily_log(dir.path(), "supervisor").unwrap();
        let writer = SharedWriter(Mutex::new(file));

        (&writer).write_all(b"line one\n").unwrap();
        (&writer).write_all(b"line two\n").unwrap();
        (&writer).flush().unwrap();

        let path = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("line one"));
        assert!(content.contains("line two"));
    }
}

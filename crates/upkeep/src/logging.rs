#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Appends to the log file, reopening it when log rotation or the user
/// removed it while the updater was running.
struct ReopeningLogFile {
    path: PathBuf,
    handle: Mutex<File>,
}

impl ReopeningLogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let handle = Mutex::new(open_append(&path)?);
        Ok(Self { path, handle })
    }

    fn current(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.path.exists() {
            *handle = open_append(&self.path)?;
        }
        Ok(handle)
    }
}

impl Write for ReopeningLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.current()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current()?.flush()
    }
}

/// Drop the older half of the log, cut at a line boundary, once the file
/// exceeds `limit` bytes.
fn shrink_log(path: &Path, limit: u64) {
    let Ok(size) = std::fs::metadata(path).map(|meta| meta.len()) else {
        return;
    };
    if size <= limit {
        return;
    }
    let Ok(bytes) = std::fs::read(path) else {
        return;
    };

    let middle = bytes.len() / 2;
    let start = bytes[middle..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(middle, |offset| middle + offset + 1);
    if let Err(error) = std::fs::write(path, &bytes[start..]) {
        eprintln!("upkeep: could not shrink {}: {error}", path.display());
    }
}

fn level(debug_logging: bool) -> LevelFilter {
    if debug_logging {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the global logger: the log file always, the terminal too in
/// debug builds.
pub fn init_logging(log_path: &Path, debug_logging: bool, max_log_size: u64) {
    shrink_log(log_path, max_log_size);

    let level = level(debug_logging);
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("upkeep")
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::with_capacity(2);

    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    match ReopeningLogFile::open(log_path.to_path_buf()) {
        Ok(file) => loggers.push(WriteLogger::new(level, config, file)),
        Err(error) => eprintln!("upkeep: log file unavailable: {error}"),
    }

    if loggers.is_empty() || CombinedLogger::init(loggers).is_err() {
        return;
    }
    log::debug!("Logging to {}", log_path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_in(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("debug.log");
        std::fs::write(&path, content).expect("log written");
        path
    }

    #[test]
    fn deleted_log_is_reopened() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("logs").join("debug.log");
        let mut file = ReopeningLogFile::open(path.clone()).expect("log opens");

        file.write_all(b"checking bromite\n").expect("first write");
        std::fs::remove_dir_all(temp.path().join("logs")).expect("log dir removed");
        file.write_all(b"downloading bromite\n")
            .expect("write after removal");

        assert_eq!(
            std::fs::read_to_string(&path).expect("log readable"),
            "downloading bromite\n"
        );
    }

    #[test]
    fn oversized_log_keeps_newer_lines() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = log_in(temp.path(), "run 1\nrun 2\nrun 3\nrun 4\nrun 5\nrun 6\n");

        shrink_log(&path, 10);

        let kept = std::fs::read_to_string(&path).expect("log readable");
        assert!(kept.starts_with("run "));
        assert!(!kept.contains("run 1"));
        assert!(kept.ends_with("run 6\n"));
    }

    #[test]
    fn log_within_limit_is_untouched() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = log_in(temp.path(), "run 1\n");

        shrink_log(&path, 1024);
        shrink_log(&temp.path().join("absent.log"), 0);

        assert_eq!(
            std::fs::read_to_string(&path).expect("log readable"),
            "run 1\n"
        );
    }

    #[test]
    fn debug_setting_raises_verbosity() {
        assert_eq!(level(true), LevelFilter::Debug);
        assert_eq!(level(false), LevelFilter::Info);
    }
}

use std::io::Write;
use std::fs::File;

/// Severity of a logged message.
///
/// `Warn` is always shown; `Info` only under `--verbose`. This mirrors the
/// two-level granularity the original tool expressed ad-hoc via
/// `inargv || verbose` checks scattered through its device-scanning loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
}

/// A simple logger.
#[derive(Debug)]
pub struct Logger {
    verbose: bool,
    log_file: Option<File>,
}

impl Logger {
    /// Create a new logger.
    pub fn new(verbose: bool, log_file: Option<File>) -> Self
    {
        Self {
            verbose,
            log_file,
        }
    }

    /// Log a message at the given level.
    /// Logs also into the log file, if present.
    pub fn log(&mut self, level: Level, msg: &str)
    {
        if level == Level::Warn || self.verbose {
            eprintln!("mdassemble: {}", msg);

            if let Some(log_file) = &mut self.log_file {
                writeln!(log_file, "{}", msg).unwrap_or_else(|_| {
                    eprintln!("mdassemble: error: couldn't write into the log file")
                });
            }
        }
    }

    pub fn warn(&mut self, msg: &str)
    {
        self.log(Level::Warn, msg);
    }

    pub fn info(&mut self, msg: &str)
    {
        self.log(Level::Info, msg);
    }
}

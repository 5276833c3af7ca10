use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    module_cache: HashMap<String, LogModule>,
    // Possibly buffered.
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send> = if let Some(filename) = option_env!("RETRACE_LOG_FILE")
        {
            Box::new(File::create(filename).unwrap())
        } else if let Some(filename) = option_env!("RETRACE_APPEND_LOG_FILE") {
            Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(filename)
                    .unwrap(),
            )
        } else {
            Box::new(io::stderr())
        };

        if let Some(buf_size) = option_env!("RETRACE_LOG_BUFFER") {
            let nbytes = buf_size.parse::<usize>().unwrap();
            f = Box::new(BufWriter::with_capacity(nbytes, f));
        }

        Mutex::new(LogGlobals {
            level_map: HashMap::new(),
            module_cache: HashMap::new(),
            log_file: f,
            default_level: LogWarn,
        })
    };
}

fn log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Module names come from file names, which are case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(level) => *level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(m) = l.module_cache.get(filename) {
        return m.to_owned();
    }
    let name = filename_to_module_name(filename);
    let level = log_level(&name, l);
    let m = LogModule { name, level };
    l.module_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// A single log line. Buffers the message and emits it, newline terminated,
/// when dropped.
pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, module_path);
            }
        }
        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write_all(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        // Pretend the bytes were written even when disabled, otherwise the
        // caller sees a WriteZero error.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }
    write!(stream, "{}()", module_path).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(level, filename, line, module_path, always_enabled)
}

/// Write a log line at `level` to the log file (stderr by default).
/// Execution continues normally afterwards.
macro_rules! log {
    ($level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log($level, file!(), line!(), module_path!(), false);
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Log at Fatal, dump a backtrace to stderr and abort.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream =
                    crate::log::log(LogFatal, file!(), line!(), module_path!(), true);
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Write to stderr and exit. No backtrace.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::Write;
            use std::io::stderr;
            use crate::log::LogFatal;
            crate::log::write_prefix(&mut stderr(), LogFatal, file!(), line!(), module_path!());
            write!(stderr(), $($args)+).unwrap();
            writeln!(stderr()).unwrap();
            std::process::exit(1)
        }
    };
}

/// Assertion about the state of a tracee. On failure, log the task's tid
/// along with the condition and abort.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        {
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream =
                        crate::log::log(LogFatal, file!(), line!(), module_path!(), true);
                    write!(
                        stream,
                        "(task {}) Assertion `{}' failed to hold. ",
                        $task.tid,
                        stringify!($cond)
                    )
                    .unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream =
                        crate::log::log(LogFatal, file!(), line!(), module_path!(), true);
                    write!(
                        stream,
                        "(task {}) Assertion `{}' failed to hold. ",
                        $task.tid,
                        stringify!($cond)
                    )
                    .unwrap();
                    write!(stream, $($args)+).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new())
            }
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    let mut err = io::stderr();
    write!(err, "=== Start retrace backtrace:\n").unwrap();
    write!(err, "{:?}", bt).unwrap();
    write!(err, "=== End retrace backtrace\n").unwrap();
    std::process::abort();
}

use crate::ticks::Ticks;
use std::env;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Global tracer configuration, read once. Command-line handling lives
/// outside the core, so these come from the environment.
#[derive(Clone)]
pub struct Flags {
    /// User override for microarchitecture detection, e.g. when running
    /// under valgrind.
    pub forced_uarch: Option<String>,
    /// Suppress warnings related to environmental features outside the
    /// tracer's control.
    pub suppress_environment_warnings: bool,
    /// Don't listen for PTRACE_EVENT_EXIT events, to test how the tracer
    /// handles missing PTRACE_EVENT_EXITs.
    pub disable_ptrace_exit_events: bool,
    /// Cap on the RBC period programmed while recording.
    pub max_rbc: Ticks,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &FLAGS
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}

fn init_flags() -> Flags {
    let max_rbc = env::var("RETRACE_MAX_RBC")
        .ok()
        .and_then(|v| v.parse::<Ticks>().ok())
        .unwrap_or(DEFAULT_MAX_RBC);

    Flags {
        forced_uarch: env::var("RETRACE_FORCED_UARCH").ok(),
        suppress_environment_warnings: env_flag("RETRACE_SUPPRESS_ENV_WARNINGS"),
        disable_ptrace_exit_events: env_flag("RETRACE_DISABLE_PTRACE_EXIT_EVENTS"),
        max_rbc,
    }
}

const DEFAULT_MAX_RBC: Ticks = 500_000;

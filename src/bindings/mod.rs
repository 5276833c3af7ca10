pub mod perf_event;
pub mod ptrace;
pub mod ldt;

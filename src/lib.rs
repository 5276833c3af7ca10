#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod address_space;
pub mod auto_remote_syscalls;
pub mod bindings;
pub mod event;
pub mod extra_registers;
pub mod flags;
pub mod gdb_connection;
pub mod gdb_register;
pub mod kernel_metadata;
pub mod memory_range;
pub mod perf_counters;
pub mod preload_interface;
pub mod registers;
pub mod remote_code_ptr;
pub mod remote_ptr;
pub mod scoped_fd;
pub mod session;
pub mod sig;
pub mod sighandlers;
pub mod task;
pub mod thread_group;
pub mod ticks;
pub mod trace_stream;
pub mod util;
pub mod wait_status;

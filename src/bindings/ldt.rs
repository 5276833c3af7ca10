//! The subset of the LDT/TLS ABI the tracer depends on; see
//! `struct user_desc` in `<asm/ldt.h>`.

/// Mirrors the kernel's `struct user_desc`. The bitfields
/// (`seg_32bit`, `contents`, `read_exec_only`, `limit_in_pages`,
/// `seg_not_present`, `useable`) are packed into a single `u32` here,
/// matching the raw in-memory layout read via `PTRACE_PEEKTEXT`-style
/// copies rather than individual field access.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct user_desc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub flags: u32,
}

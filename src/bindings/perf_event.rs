//! Hand-written perf_event_open ABI: `perf_event_attr` and the ioctls the
//! counter context uses. See <linux/perf_event.h>.

#![allow(non_camel_case_types)]

use libc::{c_ulong, pid_t};
use std::mem::size_of;
use std::os::unix::io::RawFd;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;

pub const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;
pub const PERF_EVENT_IOC_PERIOD: c_ulong = 0x4008_2404;

// Flag bits in perf_event_attr.flags.
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_PINNED: u64 = 1 << 2;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;
const ATTR_EXCLUDE_GUEST: u64 = 1 << 20;

/// PERF_ATTR_SIZE_VER5 layout. The flag bitfield word is kept as a plain
/// u64 with setter helpers.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

assert_eq_size!([u8; 112], perf_event_attr);

impl perf_event_attr {
    pub fn set_disabled(&mut self, v: bool) {
        self.set_flag(ATTR_DISABLED, v);
    }
    pub fn set_pinned(&mut self, v: bool) {
        self.set_flag(ATTR_PINNED, v);
    }
    pub fn set_exclude_kernel(&mut self, v: bool) {
        self.set_flag(ATTR_EXCLUDE_KERNEL, v);
    }
    pub fn set_exclude_hv(&mut self, v: bool) {
        self.set_flag(ATTR_EXCLUDE_HV, v);
    }
    pub fn set_exclude_guest(&mut self, v: bool) {
        self.set_flag(ATTR_EXCLUDE_GUEST, v);
    }

    fn set_flag(&mut self, bit: u64, v: bool) {
        if v {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }
}

/// # Safety
/// `attr` must point at a valid perf_event_attr.
pub unsafe fn perf_event_open(
    attr: *mut perf_event_attr,
    pid: pid_t,
    cpu: i32,
    group_fd: RawFd,
    flags: c_ulong,
) -> RawFd {
    libc::syscall(libc::SYS_perf_event_open, attr, pid, cpu, group_fd, flags) as RawFd
}

pub fn new_perf_event_attr(type_id: u32, config: u64) -> perf_event_attr {
    let mut attr: perf_event_attr = Default::default();
    attr.type_ = type_id;
    attr.size = size_of::<perf_event_attr>() as u32;
    attr.config = config;
    // The tracer requires that its events count userspace tracee code only.
    attr.set_exclude_kernel(true);
    attr.set_exclude_guest(true);
    attr
}

// fcntl async-ownership items used to route counter overflow signals to
// the tracee thread.
pub const F_SETSIG: i32 = 10;
pub const F_SETOWN_EX: i32 = 15;
pub const F_OWNER_TID: i32 = 0;

#[repr(C)]
pub struct f_owner_ex {
    pub type_: i32,
    pub pid: pid_t,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_flag_setters() {
        let mut attr = new_perf_event_attr(PERF_TYPE_RAW, 0x5101c4);
        assert_eq!(PERF_TYPE_RAW, attr.type_);
        assert_eq!(0x5101c4, attr.config);
        assert_ne!(0, attr.flags & super::ATTR_EXCLUDE_KERNEL);
        attr.set_pinned(true);
        assert_ne!(0, attr.flags & super::ATTR_PINNED);
        attr.set_pinned(false);
        assert_eq!(0, attr.flags & super::ATTR_PINNED);
    }
}

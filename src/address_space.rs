use crate::log::LogLevel::LogDebug;
use crate::memory_range::MemoryRange;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::task::Task;
use libc::pid_t;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub type AddressSpaceSharedPtr = Rc<AddressSpace>;

/// The x86 software-breakpoint instruction.
pub const BREAKPOINT_INSN: u8 = 0xcc;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakpointType {
    BkptNone,
    /// Breakpoint for internal tracer purposes, e.g. emulated-syscall
    /// single stepping.
    BkptInternal,
    /// Breakpoint requested by the debugger client.
    BkptUser,
}

/// Encoding of a watch type in the x86 debug-control register.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

/// One known virtual memory mapping.
#[derive(Clone)]
pub struct Mapping {
    pub range: MemoryRange,
    pub prot: i32,
    pub flags: i32,
    pub offset: u64,
    /// Diagnostic label for the backing resource.
    pub label: String,
}

struct Breakpoint {
    overwritten_data: u8,
    internal_count: u32,
    user_count: u32,
}

impl Breakpoint {
    fn do_ref(&mut self, which: BreakpointType) {
        match which {
            BreakpointType::BkptInternal => self.internal_count += 1,
            BreakpointType::BkptUser => self.user_count += 1,
            BreakpointType::BkptNone => (),
        }
    }

    fn do_unref(&mut self, which: BreakpointType) -> u32 {
        match which {
            BreakpointType::BkptInternal => {
                self.internal_count = self.internal_count.saturating_sub(1)
            }
            BreakpointType::BkptUser => self.user_count = self.user_count.saturating_sub(1),
            BreakpointType::BkptNone => (),
        }
        self.internal_count + self.user_count
    }

    fn bp_type(&self) -> BreakpointType {
        // User breakpoints dominate.
        if self.user_count > 0 {
            BreakpointType::BkptUser
        } else if self.internal_count > 0 {
            BreakpointType::BkptInternal
        } else {
            BreakpointType::BkptNone
        }
    }
}

/// One process's virtual address space, shared by the tasks cloned into
/// it. Mutation goes through `&self` with field-level interior
/// mutability, which is safe because the tracer drives one task at a
/// time.
///
/// Only the operations the supervisor core consumes are implemented;
/// the map is authoritative only for ranges the core itself inserted.
pub struct AddressSpace {
    mem: RefCell<BTreeMap<MemoryRange, Mapping>>,
    /// An fd that reads/writes this address space bypassing ptrace, or
    /// closed when none is available.
    mem_fd: RefCell<ScopedFd>,
    breakpoints: RefCell<HashMap<RemoteCodePtr, Breakpoint>>,
    task_set: RefCell<Vec<pid_t>>,
    exe_image: OsString,
    brk_end: RefCell<RemotePtr<Void>>,
}

impl AddressSpace {
    pub fn new(exe_image: &OsStr) -> AddressSpaceSharedPtr {
        Rc::new(AddressSpace {
            mem: RefCell::new(BTreeMap::new()),
            mem_fd: RefCell::new(ScopedFd::new()),
            breakpoints: RefCell::new(HashMap::new()),
            task_set: RefCell::new(Vec::new()),
            exe_image: exe_image.to_owned(),
            brk_end: RefCell::new(RemotePtr::null()),
        })
    }

    /// A copy of this space's metadata for a fork child. Breakpoint
    /// bytes were copied by the kernel fork; bookkeeping follows.
    pub fn clone_into_fork_child(&self) -> AddressSpaceSharedPtr {
        Rc::new(AddressSpace {
            mem: RefCell::new(self.mem.borrow().clone()),
            mem_fd: RefCell::new(ScopedFd::new()),
            breakpoints: RefCell::new(HashMap::new()),
            task_set: RefCell::new(Vec::new()),
            exe_image: self.exe_image.clone(),
            brk_end: RefCell::new(*self.brk_end.borrow()),
        })
    }

    pub fn exe_image(&self) -> &OsStr {
        &self.exe_image
    }

    pub fn insert_task(&self, tid: pid_t) {
        let mut tasks = self.task_set.borrow_mut();
        if !tasks.contains(&tid) {
            tasks.push(tid);
        }
    }

    pub fn erase_task(&self, tid: pid_t) {
        self.task_set.borrow_mut().retain(|t| *t != tid);
    }

    pub fn task_set_len(&self) -> usize {
        self.task_set.borrow().len()
    }

    pub fn mem_fd_is_open(&self) -> bool {
        self.mem_fd.borrow().is_open()
    }

    pub fn mem_fd_raw(&self) -> RawFd {
        self.mem_fd.borrow().as_raw()
    }

    pub fn set_mem_fd(&self, fd: ScopedFd) {
        *self.mem_fd.borrow_mut() = fd;
    }

    pub fn map(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        prot: i32,
        flags: i32,
        offset: u64,
        label: &str,
    ) {
        let range = MemoryRange::new_range(addr, num_bytes);
        log!(LogDebug, "mapping {} ({})", range, label);
        // A new mapping replaces whatever it overlaps.
        self.unmap_internal(&range);
        self.mem.borrow_mut().insert(
            range,
            Mapping {
                range,
                prot,
                flags,
                offset,
                label: label.to_owned(),
            },
        );
    }

    pub fn unmap(&self, addr: RemotePtr<Void>, num_bytes: usize) {
        let range = MemoryRange::new_range(addr, num_bytes);
        log!(LogDebug, "unmapping {}", range);
        self.unmap_internal(&range);
    }

    fn unmap_internal(&self, range: &MemoryRange) {
        let mut mem = self.mem.borrow_mut();
        let overlapping: Vec<MemoryRange> = mem
            .keys()
            .filter(|k| k.intersects(range))
            .copied()
            .collect();
        for k in overlapping {
            let m = mem.remove(&k).unwrap();
            // Put back any pieces outside the unmapped range.
            if m.range.start() < range.start() {
                let left = MemoryRange::from_range(m.range.start(), range.start());
                mem.insert(
                    left,
                    Mapping {
                        range: left,
                        ..m.clone()
                    },
                );
            }
            if range.end() < m.range.end() {
                let right = MemoryRange::from_range(range.end(), m.range.end());
                let offset_delta = (range.end() - m.range.start()) as u64;
                mem.insert(
                    right,
                    Mapping {
                        range: right,
                        offset: m.offset + offset_delta,
                        ..m.clone()
                    },
                );
            }
        }
    }

    pub fn protect(&self, addr: RemotePtr<Void>, num_bytes: usize, prot: i32) {
        let range = MemoryRange::new_range(addr, num_bytes);
        let mut mem = self.mem.borrow_mut();
        let affected: Vec<MemoryRange> = mem
            .keys()
            .filter(|k| k.intersects(&range))
            .copied()
            .collect();
        for k in affected {
            if let Some(m) = mem.get_mut(&k) {
                m.prot = prot;
            }
        }
    }

    pub fn remap(
        &self,
        old_addr: RemotePtr<Void>,
        old_num_bytes: usize,
        new_addr: RemotePtr<Void>,
        new_num_bytes: usize,
    ) {
        let maybe_mapping = self.mapping_of(old_addr, 1);
        let (prot, flags, offset, label) = match maybe_mapping {
            Some(m) => (m.prot, m.flags, m.offset, m.label),
            None => return,
        };
        self.unmap(old_addr, old_num_bytes);
        self.map(new_addr, new_num_bytes, prot, flags, offset, &label);
    }

    pub fn brk(&self, addr: RemotePtr<Void>) {
        if addr.is_null() {
            // brk(NULL) is libc's way of finding out the initial brk;
            // nothing to update.
            return;
        }
        *self.brk_end.borrow_mut() = addr;
    }

    pub fn current_brk(&self) -> RemotePtr<Void> {
        *self.brk_end.borrow()
    }

    /// The mapping containing [addr, addr + num_bytes), if the core
    /// knows one.
    pub fn mapping_of(&self, addr: RemotePtr<Void>, num_bytes: usize) -> Option<Mapping> {
        let needle = MemoryRange::new_range(addr, num_bytes.max(1));
        self.mem
            .borrow()
            .values()
            .find(|m| m.range.contains(&needle))
            .cloned()
    }

    /// Insert a software breakpoint, saving the overwritten byte.
    /// Returns false if the tracee memory couldn't be written.
    pub fn set_breakpoint(&self, t: &mut Task, addr: RemoteCodePtr, which: BreakpointType) -> bool {
        let mut breakpoints = self.breakpoints.borrow_mut();
        if let Some(bp) = breakpoints.get_mut(&addr) {
            bp.do_ref(which);
            return true;
        }

        let mut overwritten = [0u8; 1];
        let mut ok = true;
        t.read_bytes_helper(addr.to_data_ptr(), &mut overwritten, Some(&mut ok));
        if !ok {
            return false;
        }
        t.write_bytes_breakpoint_related(addr.to_data_ptr(), &[BREAKPOINT_INSN], Some(&mut ok));
        if !ok {
            return false;
        }
        let mut bp = Breakpoint {
            overwritten_data: overwritten[0],
            internal_count: 0,
            user_count: 0,
        };
        bp.do_ref(which);
        breakpoints.insert(addr, bp);
        true
    }

    /// Drop one reference to the breakpoint at `addr`; the original
    /// instruction byte is restored when the last reference goes.
    pub fn remove_breakpoint(&self, t: &mut Task, addr: RemoteCodePtr, which: BreakpointType) {
        let mut breakpoints = self.breakpoints.borrow_mut();
        let restore = match breakpoints.get_mut(&addr) {
            Some(bp) => {
                if bp.do_unref(which) == 0 {
                    let data = bp.overwritten_data;
                    breakpoints.remove(&addr);
                    Some(data)
                } else {
                    None
                }
            }
            None => None,
        };
        drop(breakpoints);
        if let Some(data) = restore {
            t.write_bytes_breakpoint_related(addr.to_data_ptr(), &[data], None);
        }
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemoteCodePtr) -> BreakpointType {
        self.breakpoints
            .borrow()
            .get(&addr)
            .map_or(BreakpointType::BkptNone, |bp| bp.bp_type())
    }

    /// Replace any breakpoint instruction bytes in `buf` (read from
    /// `addr`) with the original tracee bytes, so the debugger client
    /// never sees the tracer's traps.
    pub fn replace_breakpoints_with_original_values(
        &self,
        buf: &mut [u8],
        addr: RemotePtr<Void>,
    ) {
        for (bp_addr, bp) in self.breakpoints.borrow().iter() {
            let a = bp_addr.as_usize();
            if addr.as_usize() <= a && a < addr.as_usize() + buf.len() {
                buf[a - addr.as_usize()] = bp.overwritten_data;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpaceSharedPtr {
        AddressSpace::new(OsStr::new("/bin/true"))
    }

    #[test]
    fn map_and_lookup() {
        let vm = space();
        vm.map(RemotePtr::from_val(0x1000), 0x2000, libc::PROT_READ, libc::MAP_PRIVATE, 0, "rx");
        let m = vm.mapping_of(RemotePtr::from_val(0x1800), 8).unwrap();
        assert_eq!(0x1000, m.range.start().as_usize());
        assert!(vm.mapping_of(RemotePtr::from_val(0x3000), 1).is_none());
    }

    #[test]
    fn unmap_splits_mappings() {
        let vm = space();
        vm.map(RemotePtr::from_val(0x1000), 0x3000, libc::PROT_READ, libc::MAP_PRIVATE, 0, "m");
        vm.unmap(RemotePtr::from_val(0x2000), 0x1000);
        assert!(vm.mapping_of(RemotePtr::from_val(0x1800), 1).is_some());
        assert!(vm.mapping_of(RemotePtr::from_val(0x2800), 1).is_none());
        let right = vm.mapping_of(RemotePtr::from_val(0x3800), 1).unwrap();
        assert_eq!(0x3000, right.range.start().as_usize());
        assert_eq!(0x2000, right.offset as usize);
    }

    #[test]
    fn remap_moves_mapping() {
        let vm = space();
        vm.map(RemotePtr::from_val(0x1000), 0x1000, libc::PROT_READ, libc::MAP_PRIVATE, 0, "m");
        vm.remap(RemotePtr::from_val(0x1000), 0x1000, RemotePtr::from_val(0x5000), 0x2000);
        assert!(vm.mapping_of(RemotePtr::from_val(0x1000), 1).is_none());
        assert!(vm.mapping_of(RemotePtr::from_val(0x5800), 1).is_some());
    }

    #[test]
    fn task_membership() {
        let vm = space();
        vm.insert_task(10);
        vm.insert_task(11);
        vm.insert_task(10);
        assert_eq!(2, vm.task_set_len());
        vm.erase_task(10);
        assert_eq!(1, vm.task_set_len());
    }

    #[test]
    fn breakpoint_replacement_in_read_buffer() {
        let vm = space();
        vm.breakpoints.borrow_mut().insert(
            RemoteCodePtr::from_val(0x1004),
            Breakpoint {
                overwritten_data: 0x90,
                internal_count: 1,
                user_count: 0,
            },
        );
        let mut buf = [BREAKPOINT_INSN; 8];
        vm.replace_breakpoints_with_original_values(&mut buf, RemotePtr::from_val(0x1000));
        assert_eq!(0x90, buf[4]);
        assert_eq!(BREAKPOINT_INSN, buf[3]);
    }
}

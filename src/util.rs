use nix::unistd::{sysconf, SysconfVar};
use std::mem::size_of;
use std::slice;

pub fn page_size() -> usize {
    lazy_static! {
        static ref PAGE_SIZE: usize = sysconf(SysconfVar::PAGE_SIZE)
            .unwrap()
            .unwrap_or(4096) as usize;
    }
    *PAGE_SIZE
}

pub fn floor_page_size(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

pub fn ceil_page_size(addr: usize) -> usize {
    (addr + page_size() - 1) & !(page_size() - 1)
}

/// View a POD value as a byte slice.
///
/// # Safety note
/// Only sound for types without padding holes; all users in this crate
/// pass `#[repr(C)]` kernel structs.
pub fn u8_slice<D>(data: &D) -> &[u8] {
    unsafe { slice::from_raw_parts(data as *const D as *const u8, size_of::<D>()) }
}

pub fn u8_slice_mut<D>(data: &mut D) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(data as *mut D as *mut u8, size_of::<D>()) }
}

pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub const CPUID_GETFEATURES: u32 = 0x01;
pub const CPUID_GETXSAVE: u32 = 0x0d;

pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// The size of the biggest XSAVE area this CPU can produce. Sized once;
/// we always use the largest possible area even when it might not be
/// needed. Simpler that way.
pub fn xsave_area_size() -> usize {
    lazy_static! {
        static ref XSAVE_AREA_SIZE: usize = cpuid(CPUID_GETXSAVE, 0).ecx as usize;
    }
    *XSAVE_AREA_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let ps = page_size();
        assert_eq!(0, floor_page_size(ps - 1));
        assert_eq!(ps, ceil_page_size(ps - 1));
        assert_eq!(ps, ceil_page_size(1));
        assert_eq!(ps, floor_page_size(ps));
        assert_eq!(ps, ceil_page_size(ps));
    }

    #[test]
    fn u8_slice_views() {
        let v: u64 = 0x0102_0304_0506_0708;
        let s = u8_slice(&v);
        assert_eq!(8, s.len());
        assert_eq!(0x08, s[0]);
        let mut w: u32 = 0;
        u8_slice_mut(&mut w).copy_from_slice(&[1, 0, 0, 0]);
        assert_eq!(1, w);
    }
}

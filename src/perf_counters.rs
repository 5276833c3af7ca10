use crate::bindings::perf_event::{
    f_owner_ex, new_perf_event_attr, perf_event_attr, perf_event_open, F_OWNER_TID, F_SETOWN_EX,
    F_SETSIG, PERF_COUNT_HW_INSTRUCTIONS, PERF_COUNT_SW_CONTEXT_SWITCHES,
    PERF_COUNT_SW_PAGE_FAULTS, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_TYPE_RAW,
    PERF_TYPE_SOFTWARE,
};
use crate::flags::Flags;
use crate::kernel_metadata::signal_name;
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use libc::{c_ulong, fcntl, ioctl, pid_t, F_SETFL, O_ASYNC};
use nix::errno::errno;
use nix::unistd::read;
use raw_cpuid::CpuId;
use std::mem::size_of;
use std::os::unix::io::RawFd;

/// The signal the kernel raises against the tracee when the RBC counter
/// crosses its programmed sample period. This choice is fairly
/// arbitrary; linux doesn't use SIGSTKFLT so we hope that tracees don't
/// either.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

/// Find out the cpu model using the cpuid instruction.
/// Full list of CPUIDs at <http://sandpile.org/x86/cpuid.htm>
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CpuMicroarch {
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
}
use CpuMicroarch::*;

struct PmuConfig {
    uarch: CpuMicroarch,
    name: &'static str,
    /// BR_INST_RETIRED.CONDITIONAL, counting userspace only.
    rbc_cntr_event: u64,
    /// INST_RETIRED, counting userspace only.
    inst_cntr_event: u64,
    /// HW_INTERRUPTS.RECEIVED.
    hw_intr_cntr_event: u64,
}

/// Raw event encodings per microarchitecture. See the Intel performance
/// monitoring events reference; umask in bits 8..16, eventsel in bits
/// 0..8, 0x51 selects the generic PMU.
const PMU_CONFIGS: [PmuConfig; 5] = [
    PmuConfig {
        uarch: IntelHaswell,
        name: "Intel Haswell",
        rbc_cntr_event: 0x5101c4,
        inst_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
    },
    PmuConfig {
        uarch: IntelIvyBridge,
        name: "Intel Ivy Bridge",
        rbc_cntr_event: 0x5101c4,
        inst_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
    },
    PmuConfig {
        uarch: IntelSandyBridge,
        name: "Intel Sandy Bridge",
        rbc_cntr_event: 0x5101c4,
        inst_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
    },
    PmuConfig {
        uarch: IntelNehalem,
        name: "Intel Nehalem",
        rbc_cntr_event: 0x5101c4,
        inst_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x50011d,
    },
    PmuConfig {
        uarch: IntelWestmere,
        name: "Intel Westmere",
        rbc_cntr_event: 0x5101c4,
        inst_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x50011d,
    },
];

/// Fold the cpuid family/model word to a known microarchitecture, or
/// don't return. An unrecognized host is a setup error, not a runtime
/// condition.
fn compute_cpu_microarch() -> CpuMicroarch {
    if let Some(forced_uarch) = Flags::get().forced_uarch.as_ref() {
        let forced = forced_uarch.to_lowercase();
        for pmu in &PMU_CONFIGS {
            if pmu.name.to_lowercase().contains(&forced) {
                log!(LogInfo, "Using forced uarch {}", pmu.name);
                return pmu.uarch;
            }
        }
        clean_fatal!("Forced uarch {} isn't known", forced_uarch);
    }

    let cpuid = CpuId::new();
    let vendor = cpuid.get_vendor_info().unwrap().as_string().to_owned();
    if vendor != "GenuineIntel" {
        clean_fatal!("Unsupported CPU vendor '{}'", vendor);
    }

    let info = cpuid.get_feature_info().unwrap();
    let cpu_type: u32 = ((info.model_id() as u32) << 4)
        + ((info.family_id() as u32) << 8)
        + ((info.extended_model_id() as u32) << 16);
    uarch_from_cpu_type(cpu_type)
        .unwrap_or_else(|| clean_fatal!("Intel CPU type {:#x} unknown", cpu_type))
}

fn uarch_from_cpu_type(cpu_type: u32) -> Option<CpuMicroarch> {
    match cpu_type {
        0x106a0 | 0x106e0 | 0x206e0 => Some(IntelNehalem),
        0x20650 | 0x206c0 | 0x206f0 => Some(IntelWestmere),
        0x206a0 | 0x206d0 => Some(IntelSandyBridge),
        0x306a0 | 0x306e0 => Some(IntelIvyBridge),
        0x306c0 | 0x306f0 | 0x40650 | 0x40660 => Some(IntelHaswell),
        _ => None,
    }
}

struct PmuAttributes {
    rbc_attr: perf_event_attr,
    inst_attr: perf_event_attr,
    hw_intr_attr: perf_event_attr,
    page_faults_attr: perf_event_attr,
    context_switches_attr: perf_event_attr,
}

lazy_static! {
    static ref PMU_ATTRIBUTES: PmuAttributes = compute_init_attributes();
}

fn compute_init_attributes() -> PmuAttributes {
    let uarch = compute_cpu_microarch();
    let pmu = PMU_CONFIGS
        .iter()
        .find(|config| config.uarch == uarch)
        .unwrap();

    let mut hw_intr_attr = new_perf_event_attr(PERF_TYPE_RAW, pmu.hw_intr_cntr_event);
    // libpfm encodes the interrupt event with exclude_hv set, so we do
    // the same thing.
    hw_intr_attr.set_exclude_hv(true);

    PmuAttributes {
        rbc_attr: new_perf_event_attr(PERF_TYPE_RAW, pmu.rbc_cntr_event),
        inst_attr: new_perf_event_attr(PERF_TYPE_RAW, pmu.inst_cntr_event),
        hw_intr_attr,
        page_faults_attr: new_perf_event_attr(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
        context_switches_attr: new_perf_event_attr(
            PERF_TYPE_SOFTWARE,
            PERF_COUNT_SW_CONTEXT_SWITCHES,
        ),
    }
}

/// Force PMU initialization early so that an unsupported host fails
/// before any tracee has been spawned.
pub fn init_pmu() {
    let _ = PMU_ATTRIBUTES.rbc_attr;
    log!(LogDebug, "Initialized PMU successfully");
}

fn perf_ioctl(fd: &ScopedFd, request: c_ulong) {
    if unsafe { ioctl(fd.as_raw(), request, 0) } != 0 {
        fatal!("perf counter ioctl {:#x} failed", request);
    }
}

fn start_counter(tid: pid_t, group_fd: RawFd, attr: &perf_event_attr) -> ScopedFd {
    let mut attr = *attr;
    attr.set_pinned(group_fd == -1);
    let fd = unsafe { perf_event_open(&mut attr, tid, -1, group_fd, 0) };
    if fd < 0 {
        match errno() {
            libc::EACCES => fatal!(
                "Permission denied to use 'perf_event_open'; are perf events\n\
                 enabled? Try 'perf record'."
            ),
            libc::ENOENT => fatal!(
                "Unable to open performance counter with 'perf_event_open';\n\
                 are perf events enabled? Try 'perf record'."
            ),
            _ => fatal!("Failed to initialize counter"),
        }
    }
    let fd = ScopedFd::from_raw(fd);
    perf_ioctl(&fd, PERF_EVENT_IOC_ENABLE);
    fd
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut buf = [0u8; size_of::<u64>()];
    match read(fd.as_raw(), &mut buf) {
        Ok(nread) if nread == size_of::<u64>() => u64::from_le_bytes(buf),
        _ => fatal!("Could not read perf counter"),
    }
}

/// Per-task hardware performance counters. The RBC counter is the group
/// leader and doubles as the time-slice interrupt source; the auxiliary
/// counters ride along in its group and are recorded into trace frames
/// but play no part in determinism.
pub struct PerfCounters {
    tid: pid_t,
    fd_rbc: ScopedFd,
    fd_inst: ScopedFd,
    fd_hw_intr: ScopedFd,
    fd_page_faults: ScopedFd,
    fd_context_switches: ScopedFd,
    started: bool,
    sample_period: Ticks,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> PerfCounters {
        PerfCounters {
            tid,
            fd_rbc: ScopedFd::new(),
            fd_inst: ScopedFd::new(),
            fd_hw_intr: ScopedFd::new(),
            fd_page_faults: ScopedFd::new(),
            fd_context_switches: ScopedFd::new(),
            started: false,
            sample_period: 0,
        }
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        self.cleanup();
        self.tid = tid;
    }

    /// Reset all counter values to 0 and program the RBC counter to send
    /// TIME_SLICE_SIGNAL to the tracee when `sample_period` branch events
    /// have elapsed. (In reality the hardware triggers its interrupt some
    /// time after that; callers must allow for skid.) A period of zero
    /// means don't interrupt at all.
    ///
    /// Must be called while the task is stopped, before it runs again.
    pub fn reset(&mut self, sample_period: Ticks) {
        if self.started {
            self.cleanup();
        }
        log!(
            LogDebug,
            "Starting counters for {} with period {}",
            self.tid,
            sample_period
        );

        let mut rbc_attr = PMU_ATTRIBUTES.rbc_attr;
        rbc_attr.sample_period = sample_period;
        self.fd_rbc = start_counter(self.tid, -1, &rbc_attr);
        let group = self.fd_rbc.as_raw();
        self.fd_inst = start_counter(self.tid, group, &PMU_ATTRIBUTES.inst_attr);
        self.fd_hw_intr = start_counter(self.tid, group, &PMU_ATTRIBUTES.hw_intr_attr);
        self.fd_page_faults = start_counter(self.tid, group, &PMU_ATTRIBUTES.page_faults_attr);
        self.fd_context_switches =
            start_counter(self.tid, group, &PMU_ATTRIBUTES.context_switches_attr);

        // Route the overflow signal to the tracee thread itself, in
        // asynchronous mode. The tracer distinguishes it from application
        // signals by the si_fd in the accompanying siginfo.
        let own = f_owner_ex {
            type_: F_OWNER_TID,
            pid: self.tid,
        };
        if unsafe { fcntl(self.fd_rbc.as_raw(), F_SETOWN_EX, &own as *const f_owner_ex) } != 0 {
            fatal!("Failed to SETOWN_EX rbc event fd");
        }
        if unsafe {
            fcntl(self.fd_rbc.as_raw(), F_SETFL, O_ASYNC) != 0
                || fcntl(self.fd_rbc.as_raw(), F_SETSIG, TIME_SLICE_SIGNAL) != 0
        } {
            fatal!(
                "Failed to make rbc counter ASYNC with sig {}",
                signal_name(TIME_SLICE_SIGNAL)
            );
        }

        self.started = true;
        self.sample_period = sample_period;
    }

    /// Suspend counting. Descriptors stay open; `reset` restarts them.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        for fd in &[
            &self.fd_rbc,
            &self.fd_inst,
            &self.fd_hw_intr,
            &self.fd_page_faults,
            &self.fd_context_switches,
        ] {
            perf_ioctl(fd, PERF_EVENT_IOC_DISABLE);
        }
    }

    /// Stop and close. Only after this does `started` read false.
    pub fn cleanup(&mut self) {
        self.stop();
        self.fd_rbc.close();
        self.fd_inst.close();
        self.fd_hw_intr.close();
        self.fd_page_faults.close();
        self.fd_context_switches.close();
        self.started = false;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn sample_period(&self) -> Ticks {
        self.sample_period
    }

    /// The fd whose overflow generates the time-slice signal; siginfo
    /// si_fd equals this for counter-generated signals.
    pub fn rbc_interrupt_fd(&self) -> RawFd {
        self.fd_rbc.as_raw()
    }

    pub fn read_rbc(&self) -> Ticks {
        if !self.started {
            return 0;
        }
        read_counter(&self.fd_rbc)
    }

    pub fn read_instructions(&self) -> u64 {
        if !self.started {
            return 0;
        }
        read_counter(&self.fd_inst)
    }

    pub fn read_hw_interrupts(&self) -> u64 {
        if !self.started {
            return 0;
        }
        read_counter(&self.fd_hw_intr)
    }

    pub fn read_page_faults(&self) -> u64 {
        if !self.started {
            return 0;
        }
        read_counter(&self.fd_page_faults)
    }

    pub fn read_context_switches(&self) -> u64 {
        if !self.started {
            return 0;
        }
        read_counter(&self.fd_context_switches)
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_type_folding() {
        assert_eq!(Some(IntelNehalem), uarch_from_cpu_type(0x106a0));
        assert_eq!(Some(IntelWestmere), uarch_from_cpu_type(0x20650));
        assert_eq!(Some(IntelSandyBridge), uarch_from_cpu_type(0x206a0));
        assert_eq!(Some(IntelIvyBridge), uarch_from_cpu_type(0x306a0));
        assert_eq!(Some(IntelHaswell), uarch_from_cpu_type(0x306c0));
        // Skylake and friends are deliberately not supported.
        assert_eq!(None, uarch_from_cpu_type(0x506e0));
    }

    #[test]
    fn unstarted_counters_read_zero() {
        let counters = PerfCounters::new(1);
        assert!(!counters.started());
        assert_eq!(0, counters.read_rbc());
        assert_eq!(0, counters.read_hw_interrupts());
        assert_eq!(0, counters.read_page_faults());
    }

    #[test]
    fn rbc_events_count_userspace_only() {
        assert_eq!(0x5101c4, PMU_CONFIGS[0].rbc_cntr_event);
        for config in &PMU_CONFIGS {
            assert_ne!(0, config.rbc_cntr_event);
            assert_ne!(0, config.hw_intr_cntr_event);
        }
    }
}

use crate::extra_registers::ExtraRegisters;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::ticks::Ticks;
use libc::pid_t;
use std::cell::RefCell;
use std::rc::Rc;

pub type FrameTime = u64;
pub type TraceStreamSharedPtr = Rc<RefCell<dyn TraceStream>>;

/// One event frame. The on-disk encoding belongs to the trace
/// subsystem; this is just the data the supervisor hands over.
pub struct TraceFrame {
    pub global_time: FrameTime,
    pub thread_time: u32,
    pub tid: pid_t,
    pub event: String,
    pub rbc: Ticks,
    pub hw_interrupts: u64,
    pub page_faults: u64,
    pub instructions: u64,
    pub context_switches: u64,
    pub recorded_regs: Registers,
    pub recorded_extra_regs: Option<ExtraRegisters>,
}

/// A raw memory blob attached to the current event.
pub struct RawDataRecord {
    pub global_time: FrameTime,
    pub event: String,
    pub addr: RemotePtr<Void>,
    pub data: Vec<u8>,
}

/// Opaque record sink/source with a monotonic time counter. The
/// recorder writes event frames and raw memory blobs through this
/// during recording and reads them back during replay.
pub trait TraceStream {
    fn time(&self) -> FrameTime;
    fn write_frame(&mut self, frame: TraceFrame);
    fn write_raw(&mut self, rec: RawDataRecord);
    fn read_raw(&mut self) -> Option<RawDataRecord>;
}

/// A sink that drops everything but keeps time moving. Useful for
/// sessions that don't persist a trace.
#[derive(Default)]
pub struct NullTraceStream {
    time: FrameTime,
}

impl TraceStream for NullTraceStream {
    fn time(&self) -> FrameTime {
        self.time
    }

    fn write_frame(&mut self, _frame: TraceFrame) {
        self.time += 1;
    }

    fn write_raw(&mut self, _rec: RawDataRecord) {
        self.time += 1;
    }

    fn read_raw(&mut self) -> Option<RawDataRecord> {
        None
    }
}

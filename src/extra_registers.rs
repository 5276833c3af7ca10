use crate::gdb_register::*;

// Offsets into the FXSAVE region, which is the prefix of any XSAVE area.
const FXSAVE_MXCSR_OFFSET: usize = 24;
const FXSAVE_ST_SPACE_OFFSET: usize = 32;
const FXSAVE_XMM_SPACE_OFFSET: usize = 160;

/// FPU/vector state, stored as the raw XSAVE area the kernel hands out
/// via PTRACE_GETREGSET(NT_X86_XSTATE). The area is sized once per
/// process to the widest format the CPU supports.
#[derive(Clone, Default)]
pub struct ExtraRegisters {
    data: Vec<u8>,
}

impl ExtraRegisters {
    pub fn new(data: Vec<u8>) -> ExtraRegisters {
        ExtraRegisters { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Read register `regno` into `buf`, if this register lives in the
    /// FXSAVE prefix and the area has been fetched. The legacy x87
    /// control-word group is left undefined; the debugger renders
    /// undefined registers explicitly.
    pub fn read_register(&self, buf: &mut [u8], regno: GdbRegister) -> (usize, bool) {
        let num_bytes = regno.num_bytes();
        if self.data.is_empty() {
            return (num_bytes, false);
        }

        let offset = match regno.as_raw() {
            r if (DREG_ST0.as_raw()..=DREG_ST7.as_raw()).contains(&r) => {
                // Each x87 slot is 16 bytes; the low 10 hold the value.
                FXSAVE_ST_SPACE_OFFSET + 16 * (r - DREG_ST0.as_raw()) as usize
            }
            r if (DREG_XMM0.as_raw()..=DREG_XMM15.as_raw()).contains(&r) => {
                FXSAVE_XMM_SPACE_OFFSET + 16 * (r - DREG_XMM0.as_raw()) as usize
            }
            r if r == DREG_MXCSR.as_raw() => FXSAVE_MXCSR_OFFSET,
            _ => return (num_bytes, false),
        };

        if offset + num_bytes > self.data.len() {
            return (num_bytes, false);
        }
        buf[0..num_bytes].copy_from_slice(&self.data[offset..offset + num_bytes]);
        (num_bytes, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::MAX_REG_SIZE_BYTES;

    #[test]
    fn empty_area_is_undefined() {
        let er = ExtraRegisters::default();
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!((16, false), er.read_register(&mut buf, DREG_XMM0));
    }

    #[test]
    fn xmm_extraction() {
        let mut data = vec![0u8; 512];
        data[FXSAVE_XMM_SPACE_OFFSET] = 0xab;
        data[FXSAVE_XMM_SPACE_OFFSET + 15] = 0xcd;
        let er = ExtraRegisters::new(data);
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let (nbytes, defined) = er.read_register(&mut buf, DREG_XMM0);
        assert!(defined);
        assert_eq!(16, nbytes);
        assert_eq!(0xab, buf[0]);
        assert_eq!(0xcd, buf[15]);
    }

    #[test]
    fn x87_control_group_stays_undefined() {
        let er = ExtraRegisters::new(vec![0u8; 512]);
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let (_, defined) = er.read_register(&mut buf, DREG_FCTRL);
        assert!(!defined);
    }
}

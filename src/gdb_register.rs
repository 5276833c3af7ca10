//! The debugger's x86-64 register numbering. Only the core register file
//! plus the few extras the debugger asks for by number.

use std::convert::TryFrom;
use std::fmt::{Display, Formatter, Result};

/// The inner u32 is deliberately NOT pub; arbitrary values can't be
/// constructed outside the provided interfaces.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GdbRegister(u32);

pub const DREG_RAX: GdbRegister = GdbRegister(0);
pub const DREG_RBX: GdbRegister = GdbRegister(1);
pub const DREG_RCX: GdbRegister = GdbRegister(2);
pub const DREG_RDX: GdbRegister = GdbRegister(3);
pub const DREG_RSI: GdbRegister = GdbRegister(4);
pub const DREG_RDI: GdbRegister = GdbRegister(5);
pub const DREG_RBP: GdbRegister = GdbRegister(6);
pub const DREG_RSP: GdbRegister = GdbRegister(7);
pub const DREG_R8: GdbRegister = GdbRegister(8);
pub const DREG_R9: GdbRegister = GdbRegister(9);
pub const DREG_R10: GdbRegister = GdbRegister(10);
pub const DREG_R11: GdbRegister = GdbRegister(11);
pub const DREG_R12: GdbRegister = GdbRegister(12);
pub const DREG_R13: GdbRegister = GdbRegister(13);
pub const DREG_R14: GdbRegister = GdbRegister(14);
pub const DREG_R15: GdbRegister = GdbRegister(15);
pub const DREG_RIP: GdbRegister = GdbRegister(16);
pub const DREG_EFLAGS: GdbRegister = GdbRegister(17);
pub const DREG_CS: GdbRegister = GdbRegister(18);
pub const DREG_SS: GdbRegister = GdbRegister(19);
pub const DREG_DS: GdbRegister = GdbRegister(20);
pub const DREG_ES: GdbRegister = GdbRegister(21);
pub const DREG_FS: GdbRegister = GdbRegister(22);
pub const DREG_GS: GdbRegister = GdbRegister(23);
pub const DREG_FIRST_FXSAVE_REG: GdbRegister = GdbRegister(24);
pub const DREG_ST0: GdbRegister = GdbRegister(24);
pub const DREG_ST7: GdbRegister = GdbRegister(31);
pub const DREG_FCTRL: GdbRegister = GdbRegister(32);
pub const DREG_FOP: GdbRegister = GdbRegister(39);
pub const DREG_XMM0: GdbRegister = GdbRegister(40);
pub const DREG_XMM15: GdbRegister = GdbRegister(55);
pub const DREG_MXCSR: GdbRegister = GdbRegister(56);
pub const DREG_LAST_FXSAVE_REG: GdbRegister = GdbRegister(56);
pub const DREG_ORIG_RAX: GdbRegister = GdbRegister(57);
pub const DREG_FS_BASE: GdbRegister = GdbRegister(58);
pub const DREG_GS_BASE: GdbRegister = GdbRegister(59);

/// Number of registers in a full `g` reply.
pub const DREG_NUM_LINUX_X86_64: u32 = 60;

impl GdbRegister {
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// How many value bytes the debugger expects for this register.
    pub fn num_bytes(self) -> usize {
        match self.0 {
            0..=16 => 8,
            17..=23 => 4,
            24..=31 => 10,
            32..=39 => 4,
            40..=55 => 16,
            56 => 4,
            57..=59 => 8,
            _ => 0,
        }
    }
}

impl TryFrom<u32> for GdbRegister {
    type Error = ();

    fn try_from(regno: u32) -> std::result::Result<Self, ()> {
        if regno < DREG_NUM_LINUX_X86_64 {
            Ok(GdbRegister(regno))
        } else {
            Err(())
        }
    }
}

impl Display for GdbRegister {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "gdb-reg({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_sizes() {
        assert_eq!(8, DREG_RAX.num_bytes());
        assert_eq!(8, DREG_RIP.num_bytes());
        assert_eq!(4, DREG_EFLAGS.num_bytes());
        assert_eq!(16, DREG_XMM0.num_bytes());
        assert_eq!(8, DREG_FS_BASE.num_bytes());
    }

    #[test]
    fn try_from_bounds() {
        assert!(GdbRegister::try_from(DREG_NUM_LINUX_X86_64).is_err());
        assert_eq!(Ok(DREG_GS_BASE), GdbRegister::try_from(59));
    }
}

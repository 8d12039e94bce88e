use std::sync::atomic::{compiler_fence, Ordering};

use crate::cpu::{FReg, Reg};
use javelin_asm::arm::{Register, SReg};

pub const R0: Reg = Reg(0);
pub const R1: Reg = Reg(1);
pub const R2: Reg = Reg(2);
pub const R3: Reg = Reg(3);
pub const R4: Reg = Reg(4);
pub const R5: Reg = Reg(5);
pub const R6: Reg = Reg(6);
pub const R7: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);

/// Java expression stack pointer. Reserved together with FP, SP, LR and
/// PC; none of these ever enter the allocatable pool.
pub const REG_JSP: Reg = Reg(10);
pub const REG_FP: Reg = Reg(11);
/// Inter-method scratch; clobbered by every call sequence.
pub const REG_SCRATCH: Reg = Reg(12);
pub const REG_SP: Reg = Reg(13);
pub const REG_LR: Reg = Reg(14);
pub const REG_PC: Reg = Reg(15);

pub const ALLOCATABLE_REGS: [Reg; 10] = [R0, R1, R2, R3, R4, R5, R6, R7, R8, R9];

/// Argument words of a Java call, in slot order. Methods taking more
/// words than this are left to the interpreter.
pub const JAVA_ARG_REGS: [Reg; 4] = [R0, R1, R2, R3];

pub const REG_RESULT: Reg = R0;
/// Second result word for long/double returns.
pub const REG_RESULT2: Reg = R1;

/// Carries the interface-table index into the lookup helper; outside
/// the argument registers, free at every call site (the stack is
/// flushed before calls).
pub const REG_ITABLE_INDEX: Reg = R4;

pub const FREG_COUNT: u8 = 32;

/// Target word size in bytes.
pub const WORD_SIZE: i32 = 4;

pub const STACK_FRAME_ALIGNMENT: i32 = 8;

/// The Java expression stack (and the frame's local area) grows toward
/// lower addresses.
pub const JAVA_STACK_GROWS_DOWN: bool = true;

/// Word order of a `long` held in a core-register pair: the first
/// register of the pair carries the most significant word.
pub const LONG_MSW_FIRST: bool = true;

/// Word order of a `double` held in an s-register pair. Independent of
/// `LONG_MSW_FIRST`; ports may configure the two differently.
pub const DOUBLE_MSW_FIRST: bool = true;

/// Card shift used by the emitted write-barrier sequence.
pub const CARD_SHIFT: u32 = 9;

// The three signed-immediate ranges of the load/store encodings. These
// are distinct hardware limits and must never be conflated.

/// Addressing mode 2: word and unsigned-byte transfers.
pub fn fits_mode2(offset: i32) -> bool {
    offset > -0x1000 && offset < 0x1000
}

/// Addressing mode 3: halfword and signed-byte transfers.
pub fn fits_mode3(offset: i32) -> bool {
    offset > -0x100 && offset < 0x100
}

/// Addressing mode 5: coprocessor (VFP) transfers; word-aligned.
pub fn fits_mode5(offset: i32) -> bool {
    offset % 4 == 0 && offset >= -1020 && offset <= 1020
}

/// Instruction-cache flush after rewriting emitted code. The backend
/// targets a device with split caches; when hosted for testing there is
/// nothing to flush, but the compiler barrier keeps the store ordered.
pub fn flush_icache(_addr: crate::gc::Address, _len: usize) {
    compiler_fence(Ordering::SeqCst);
}

impl From<Reg> for Register {
    fn from(reg: Reg) -> Register {
        Register::new(reg.0)
    }
}

impl From<FReg> for SReg {
    fn from(reg: FReg) -> SReg {
        SReg::new(reg.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_distinct() {
        assert!(fits_mode2(4095) && !fits_mode2(4096));
        assert!(fits_mode3(255) && !fits_mode3(256));
        assert!(fits_mode5(1020) && !fits_mode5(1024));
        assert!(fits_mode5(-1020) && !fits_mode5(2));

        // mode 3 is the narrowest, mode 5 sits between, mode 2 is widest
        assert!(!fits_mode3(1020) && fits_mode5(1020) && fits_mode2(1020));
    }

    #[test]
    fn test_reserved_regs_not_allocatable() {
        for reg in [REG_JSP, REG_FP, REG_SCRATCH, REG_SP, REG_LR, REG_PC] {
            assert!(!ALLOCATABLE_REGS.contains(&reg));
        }
    }
}

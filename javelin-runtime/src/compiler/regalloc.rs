use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;

use fixedbitset::FixedBitSet;

use crate::compiler::CompileError;
use crate::cpu::{FReg, Reg, ALLOCATABLE_REGS, FREG_COUNT};

/// Reference-counted allocator over the physical register pool. A
/// register is free, or held by exactly one value plus any number of
/// extra references (`dup` aliases, spare guards). Cloning the allocator
/// clones a handle to the same pool.
#[derive(Clone)]
pub struct RegisterAllocator {
    inner: Rc<RefCell<AllocatorState>>,
}

struct AllocatorState {
    regs: &'static [Reg],
    counts: [u8; 16],
}

impl RegisterAllocator {
    pub fn new() -> RegisterAllocator {
        RegisterAllocator::with_regs(&ALLOCATABLE_REGS)
    }

    pub fn with_regs(regs: &'static [Reg]) -> RegisterAllocator {
        RegisterAllocator {
            inner: Rc::new(RefCell::new(AllocatorState {
                regs,
                counts: [0; 16],
            })),
        }
    }

    /// Hand out a free register with reference count 1. Callers without a
    /// spill or materialization fallback treat the error as fatal for the
    /// whole method.
    pub fn allocate(&self) -> Result<Reg, CompileError> {
        let mut state = self.inner.borrow_mut();

        for &reg in state.regs {
            if state.counts[reg.int() as usize] == 0 {
                state.counts[reg.int() as usize] = 1;
                return Ok(reg);
            }
        }

        Err(CompileError::OutOfRegisters)
    }

    /// Extra reference to an already-allocated register (`dup`).
    pub fn reference(&self, reg: Reg) {
        let mut state = self.inner.borrow_mut();
        let count = &mut state.counts[reg.int() as usize];
        assert!(*count > 0, "reference on free register {:?}", reg);
        *count += 1;
    }

    pub fn dereference(&self, reg: Reg) {
        let mut state = self.inner.borrow_mut();
        let count = &mut state.counts[reg.int() as usize];
        assert!(*count > 0, "dereference on free register {:?}", reg);
        *count -= 1;
    }

    pub fn is_free(&self, reg: Reg) -> bool {
        self.inner.borrow().counts[reg.int() as usize] == 0
    }

    /// True when the register carries exactly one reference, so writing
    /// to it cannot be observed through an alias.
    pub fn is_exclusively_held(&self, reg: Reg) -> bool {
        self.inner.borrow().counts[reg.int() as usize] == 1
    }

    pub fn used_count(&self) -> usize {
        let state = self.inner.borrow();
        state
            .regs
            .iter()
            .filter(|reg| state.counts[reg.int() as usize] > 0)
            .count()
    }

    /// Scoped temporary register, released on drop.
    pub fn spare(&self) -> Result<Spare, CompileError> {
        let reg = self.allocate()?;

        Ok(Spare {
            reg,
            allocator: self.clone(),
        })
    }

    /// Reserve every member of `set` at once; either all members are
    /// taken or none is. Used for register pairs and call marshaling.
    pub fn allocate_set(&self, set: &RegisterSet) -> Result<(), CompileError> {
        let mut state = self.inner.borrow_mut();

        for reg in set.iter() {
            if state.counts[reg.int() as usize] != 0 {
                return Err(CompileError::OutOfRegisters);
            }
        }

        for reg in set.iter() {
            state.counts[reg.int() as usize] = 1;
        }

        Ok(())
    }

    pub fn release_set(&self, set: &RegisterSet) {
        for reg in set.iter() {
            self.dereference(reg);
        }
    }

    #[cfg(debug_assertions)]
    pub fn assert_all_free(&self) {
        let state = self.inner.borrow();

        for &reg in state.regs {
            assert!(
                state.counts[reg.int() as usize] == 0,
                "leaked register {:?}",
                reg
            );
        }
    }
}

/// RAII guard around a temporarily allocated register.
pub struct Spare {
    reg: Reg,
    allocator: RegisterAllocator,
}

impl Spare {
    pub fn reg(&self) -> Reg {
        self.reg
    }
}

impl Deref for Spare {
    type Target = Reg;

    fn deref(&self) -> &Reg {
        &self.reg
    }
}

impl Drop for Spare {
    fn drop(&mut self) {
        self.allocator.dereference(self.reg);
    }
}

/// A fixed group of registers, iterated in ascending register number.
/// The set must not be mutated while iterating; `iter` borrows the set
/// to keep that statically impossible.
#[derive(Clone)]
pub struct RegisterSet {
    bits: FixedBitSet,
}

impl RegisterSet {
    pub fn new() -> RegisterSet {
        RegisterSet {
            bits: FixedBitSet::with_capacity(16),
        }
    }

    pub fn from_regs(regs: &[Reg]) -> RegisterSet {
        let mut set = RegisterSet::new();

        for &reg in regs {
            set.add(reg);
        }

        set
    }

    pub fn add(&mut self, reg: Reg) {
        self.bits.insert(reg.int() as usize);
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.bits.contains(reg.int() as usize)
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        self.bits.ones().map(|idx| Reg(idx as u8))
    }
}

/// Allocator for the VFP register file. Doubles take an aligned
/// even/odd pair.
pub struct FloatAllocator {
    counts: [u8; FREG_COUNT as usize],
}

impl FloatAllocator {
    pub fn new() -> FloatAllocator {
        FloatAllocator {
            counts: [0; FREG_COUNT as usize],
        }
    }

    pub fn allocate(&mut self) -> Result<FReg, CompileError> {
        for idx in 0..FREG_COUNT {
            if self.counts[idx as usize] == 0 {
                self.counts[idx as usize] = 1;
                return Ok(FReg(idx));
            }
        }

        Err(CompileError::OutOfRegisters)
    }

    pub fn allocate_pair(&mut self) -> Result<(FReg, FReg), CompileError> {
        for idx in (0..FREG_COUNT).step_by(2) {
            if self.counts[idx as usize] == 0 && self.counts[idx as usize + 1] == 0 {
                self.counts[idx as usize] = 1;
                self.counts[idx as usize + 1] = 1;
                return Ok((FReg(idx), FReg(idx + 1)));
            }
        }

        Err(CompileError::OutOfRegisters)
    }

    pub fn reference(&mut self, reg: FReg) {
        let count = &mut self.counts[reg.int() as usize];
        assert!(*count > 0, "reference on free register {:?}", reg);
        *count += 1;
    }

    pub fn dereference(&mut self, reg: FReg) {
        let count = &mut self.counts[reg.int() as usize];
        assert!(*count > 0, "dereference on free register {:?}", reg);
        *count -= 1;
    }

    pub fn is_free(&self, reg: FReg) -> bool {
        self.counts[reg.int() as usize] == 0
    }

    pub fn is_exclusively_held(&self, reg: FReg) -> bool {
        self.counts[reg.int() as usize] == 1
    }

    #[cfg(debug_assertions)]
    pub fn assert_all_free(&self) {
        for idx in 0..FREG_COUNT {
            assert!(self.counts[idx as usize] == 0, "leaked register s{}", idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{R0, R1, R2, R3};

    static SMALL_POOL: [Reg; 2] = [R0, R1];

    #[test]
    fn test_allocate_until_exhausted() {
        let regs = RegisterAllocator::with_regs(&SMALL_POOL);

        assert_eq!(regs.allocate(), Ok(R0));
        assert_eq!(regs.allocate(), Ok(R1));
        assert_eq!(regs.allocate(), Err(CompileError::OutOfRegisters));

        regs.dereference(R0);
        assert_eq!(regs.allocate(), Ok(R0));
    }

    #[test]
    fn test_reference_counting() {
        let regs = RegisterAllocator::with_regs(&SMALL_POOL);

        let reg = regs.allocate().unwrap();
        regs.reference(reg);
        regs.dereference(reg);
        assert!(!regs.is_free(reg));
        regs.dereference(reg);
        assert!(regs.is_free(reg));
    }

    #[test]
    #[should_panic]
    fn test_dereference_free_register() {
        let regs = RegisterAllocator::with_regs(&SMALL_POOL);
        regs.dereference(R0);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let regs = RegisterAllocator::new();
        let mut held = Vec::new();

        while let Ok(reg) = regs.allocate() {
            held.push(reg);
            assert!(regs.used_count() <= ALLOCATABLE_REGS.len());
        }

        assert_eq!(held.len(), ALLOCATABLE_REGS.len());

        for reg in held {
            regs.dereference(reg);
        }

        assert_eq!(regs.used_count(), 0);
    }

    #[test]
    fn test_spare_released_on_drop() {
        let regs = RegisterAllocator::with_regs(&SMALL_POOL);

        {
            let spare = regs.spare().unwrap();
            assert_eq!(*spare, R0);
            assert!(!regs.is_free(R0));
        }

        assert!(regs.is_free(R0));
    }

    #[test]
    fn test_register_set() {
        let regs = RegisterAllocator::new();
        let set = RegisterSet::from_regs(&[R2, R0, R3]);

        // ascending order, regardless of insertion order
        let members: Vec<Reg> = set.iter().collect();
        assert_eq!(members, vec![R0, R2, R3]);

        regs.allocate_set(&set).unwrap();
        assert!(!regs.is_free(R0));
        assert!(regs.is_free(R1));

        // overlapping bulk reservation fails without taking anything
        let overlap = RegisterSet::from_regs(&[R1, R2]);
        assert_eq!(
            regs.allocate_set(&overlap),
            Err(CompileError::OutOfRegisters)
        );
        assert!(regs.is_free(R1));

        regs.release_set(&set);
        assert_eq!(regs.used_count(), 0);
    }

    #[test]
    fn test_float_pairs_aligned() {
        let mut fregs = FloatAllocator::new();

        let single = fregs.allocate().unwrap();
        assert_eq!(single, FReg(0));

        let (lo, hi) = fregs.allocate_pair().unwrap();
        assert_eq!((lo, hi), (FReg(2), FReg(3)));

        fregs.dereference(single);
        let (lo, hi) = fregs.allocate_pair().unwrap();
        assert_eq!((lo, hi), (FReg(0), FReg(1)));

        fregs.dereference(lo);
        fregs.dereference(hi);
        fregs.dereference(FReg(2));
        fregs.dereference(FReg(3));
    }
}

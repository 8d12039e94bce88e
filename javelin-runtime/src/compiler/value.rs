use javelin_bytecode::BasicType;

use crate::compiler::regalloc::{FloatAllocator, RegisterAllocator};
use crate::cpu::{FReg, Reg, DOUBLE_MSW_FIRST, LONG_MSW_FIRST};

/// Where a value currently lives. `Immediate` values have not been
/// materialized yet; `Spilled` values sit in their canonical operand
/// stack slot of the frame.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Storage {
    Immediate,
    Reg(Reg),
    /// core-register pair in pair order (see `LONG_MSW_FIRST`)
    Pair(Reg, Reg),
    FReg(FReg),
    /// s-register pair in pair order (see `DOUBLE_MSW_FIRST`)
    FPair(FReg, FReg),
    /// operand stack slot index (not a local)
    Spilled(u32),
}

/// One Java-typed value during compilation. Owns its register
/// references; consuming a value transfers that ownership and must end
/// in exactly one `destroy`.
pub struct Value {
    ty: BasicType,
    storage: Storage,
    immediate: i64,
    destroyed: bool,
}

impl Value {
    pub fn int_const(value: i32) -> Value {
        Value::immediate(BasicType::Int, value as i64)
    }

    pub fn long_const(value: i64) -> Value {
        Value::immediate(BasicType::Long, value)
    }

    pub fn float_const(value: f32) -> Value {
        Value::immediate(BasicType::Float, value.to_bits() as i64)
    }

    pub fn double_const(value: f64) -> Value {
        Value::immediate(BasicType::Double, value.to_bits() as i64)
    }

    pub fn null() -> Value {
        Value::immediate(BasicType::Object, 0)
    }

    /// Reference immediate: an object address known at compile time
    /// (string literal, interned constant).
    pub fn object_const(address: u32) -> Value {
        Value::immediate(BasicType::Object, address as i64)
    }

    fn immediate(ty: BasicType, bits: i64) -> Value {
        Value {
            ty,
            storage: Storage::Immediate,
            immediate: bits,
            destroyed: false,
        }
    }

    pub fn in_reg(ty: BasicType, reg: Reg) -> Value {
        assert!(!ty.is_wide() && !ty.is_float());

        Value {
            ty,
            storage: Storage::Reg(reg),
            immediate: 0,
            destroyed: false,
        }
    }

    pub fn in_pair(ty: BasicType, first: Reg, second: Reg) -> Value {
        assert!(ty == BasicType::Long);

        Value {
            ty,
            storage: Storage::Pair(first, second),
            immediate: 0,
            destroyed: false,
        }
    }

    pub fn in_freg(reg: FReg) -> Value {
        Value {
            ty: BasicType::Float,
            storage: Storage::FReg(reg),
            immediate: 0,
            destroyed: false,
        }
    }

    pub fn in_fpair(first: FReg, second: FReg) -> Value {
        Value {
            ty: BasicType::Double,
            storage: Storage::FPair(first, second),
            immediate: 0,
            destroyed: false,
        }
    }

    pub fn spilled(ty: BasicType, slot: u32) -> Value {
        Value {
            ty,
            storage: Storage::Spilled(slot),
            immediate: 0,
            destroyed: false,
        }
    }

    pub fn ty(&self) -> BasicType {
        self.ty
    }

    pub fn storage(&self) -> Storage {
        debug_assert!(!self.destroyed);
        self.storage
    }

    pub fn is_immediate(&self) -> bool {
        self.storage == Storage::Immediate
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::Spilled(_))
    }

    pub fn immediate_i32(&self) -> i32 {
        assert!(self.is_immediate() && !self.ty.is_wide());
        self.immediate as i32
    }

    pub fn immediate_i64(&self) -> i64 {
        assert!(self.is_immediate());
        self.immediate
    }

    /// The single register of a non-wide, non-float value.
    pub fn reg(&self) -> Reg {
        match self.storage {
            Storage::Reg(reg) => {
                assert!(!self.ty.is_float(), "float value accessed as core register");
                reg
            }
            _ => panic!("value has no core register: {:?}", self.storage),
        }
    }

    pub fn pair(&self) -> (Reg, Reg) {
        match self.storage {
            Storage::Pair(first, second) => (first, second),
            _ => panic!("value has no register pair: {:?}", self.storage),
        }
    }

    pub fn freg(&self) -> FReg {
        match self.storage {
            Storage::FReg(reg) => {
                assert!(self.ty == BasicType::Float, "non-float accessed as s-register");
                reg
            }
            _ => panic!("value has no s-register: {:?}", self.storage),
        }
    }

    pub fn fpair(&self) -> (FReg, FReg) {
        match self.storage {
            Storage::FPair(first, second) => (first, second),
            _ => panic!("value has no s-register pair: {:?}", self.storage),
        }
    }

    /// Most significant word of a long pair, per the configured pair order.
    pub fn msw_reg(&self) -> Reg {
        let (first, second) = self.pair();
        if LONG_MSW_FIRST {
            first
        } else {
            second
        }
    }

    pub fn lsw_reg(&self) -> Reg {
        let (first, second) = self.pair();
        if LONG_MSW_FIRST {
            second
        } else {
            first
        }
    }

    pub fn msw_freg(&self) -> FReg {
        let (first, second) = self.fpair();
        if DOUBLE_MSW_FIRST {
            first
        } else {
            second
        }
    }

    pub fn lsw_freg(&self) -> FReg {
        let (first, second) = self.fpair();
        if DOUBLE_MSW_FIRST {
            second
        } else {
            first
        }
    }

    /// Release held register references. Must run exactly once; a second
    /// call is a compiler bug.
    pub fn destroy(mut self, regs: &RegisterAllocator, fregs: &mut FloatAllocator) {
        assert!(!self.destroyed, "value destroyed twice");
        self.destroyed = true;

        match self.storage {
            Storage::Reg(reg) => regs.dereference(reg),
            Storage::Pair(first, second) => {
                regs.dereference(first);
                regs.dereference(second);
            }
            Storage::FReg(reg) => fregs.dereference(reg),
            Storage::FPair(first, second) => {
                fregs.dereference(first);
                fregs.dereference(second);
            }
            Storage::Immediate | Storage::Spilled(_) => {}
        }
    }

    /// Forget the storage without touching reference counts; used when
    /// registers were already handed over (e.g. spilling rewrites the
    /// storage in place).
    pub fn set_storage(&mut self, storage: Storage) {
        debug_assert!(!self.destroyed);
        self.storage = storage;
    }

    /// Consume the value and take over its register references without
    /// releasing them. The caller becomes responsible for every
    /// reference the storage carries.
    pub fn into_storage(mut self) -> Storage {
        assert!(!self.destroyed, "value destroyed twice");
        self.destroyed = true;
        self.storage
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        debug_assert!(
            self.destroyed
                || matches!(self.storage, Storage::Immediate | Storage::Spilled(_)),
            "leaked value holding {:?}",
            self.storage
        );
    }
}

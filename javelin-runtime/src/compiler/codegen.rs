use std::collections::{HashMap, HashSet};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use javelin_asm::arm::{self, Assembler, Cond, Register, Shift};
use javelin_asm::Label;
use javelin_bytecode::{
    BasicType, BytecodeOpcode, BytecodeReader, ConstPoolEntry, MethodData, MethodId, Program,
    ARRAY_LENGTH_OFFSET, VTABLE_OFFSET,
};

use crate::compiler::address::{AccessWidth, MemOperand, SymbolicAddress};
use crate::compiler::regalloc::{FloatAllocator, RegisterAllocator};
use crate::compiler::value::{Storage, Value};
use crate::compiler::CompileError;
use crate::cpu::{
    Reg, DOUBLE_MSW_FIRST, JAVA_ARG_REGS, LONG_MSW_FIRST, REG_FP, REG_ITABLE_INDEX, REG_RESULT,
    REG_RESULT2, REG_SCRATCH, STACK_FRAME_ALIGNMENT, WORD_SIZE,
};
use crate::gc::Address;
use crate::masm::{CodeDescriptor, MacroAssembler, Trap};
use crate::mem::align_i32;
use crate::vm::{CompilerFlags, RuntimeEntries};

/// Largest switch compiled inline; bigger tables would push literal-pool
/// displacements out of range, so those methods stay interpreted.
pub const MAX_SWITCH_CASES: usize = 128;

/// Frames bigger than this lose the guarantee that every slot offset is
/// encodable in all three addressing modes.
const MAX_FRAME_SIZE: i32 = 1000;

/// Binary operator dispatch. The discriminants are positionally
/// significant: `INT_DP_TABLE` below and the runtime-entry dispatch index
/// by these values, so reordering is a breaking change.
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Rem = 4,
    Shl = 5,
    Shr = 6,
    Ushr = 7,
    And = 8,
    Or = 9,
    Xor = 10,
    Min = 11,
    Max = 12,
    Rsb = 13,
}

type DpEmit = fn(&mut Assembler, Register, Register, Register);

/// Data-processing emitter per operator, indexed by `BinaryOp as usize`.
/// `None` marks operators with a dedicated lowering (multiply, divide,
/// shifts, min/max).
const INT_DP_TABLE: [Option<DpEmit>; 14] = [
    Some(Assembler::add_reg),
    Some(Assembler::sub_reg),
    None,
    None,
    None,
    None,
    None,
    None,
    Some(Assembler::and_reg),
    Some(Assembler::orr_reg),
    Some(Assembler::eor_reg),
    None,
    None,
    Some(Assembler::rsb_reg),
];

const _: () = assert!(INT_DP_TABLE.len() == 14);

fn shift_for(op: BinaryOp) -> Shift {
    match op {
        BinaryOp::Shl => Shift::Lsl,
        BinaryOp::Shr => Shift::Asr,
        BinaryOp::Ushr => Shift::Lsr,
        _ => unreachable!(),
    }
}

pub struct CodeGen<'a> {
    program: &'a Program,
    method: &'a MethodData,
    entries: &'a RuntimeEntries,
    flags: &'a CompilerFlags,
    /// entry address of an already-compiled method, for direct calls
    compiled_entry: &'a dyn Fn(MethodId) -> Option<Address>,
    /// per-method block holding the current execution entry
    method_block: &'a dyn Fn(MethodId) -> Address,

    masm: MacroAssembler,
    regs: RegisterAllocator,
    fregs: FloatAllocator,
    stack: Vec<Value>,

    targets: HashMap<u32, Label>,
    shapes: HashMap<u32, Vec<BasicType>>,
    fallthrough: bool,
    current_bci: u32,
}

impl<'a> CodeGen<'a> {
    pub fn new(
        program: &'a Program,
        method_id: MethodId,
        entries: &'a RuntimeEntries,
        flags: &'a CompilerFlags,
        compiled_entry: &'a dyn Fn(MethodId) -> Option<Address>,
        method_block: &'a dyn Fn(MethodId) -> Address,
    ) -> CodeGen<'a> {
        CodeGen {
            program,
            method: program.method(method_id),
            entries,
            flags,
            compiled_entry,
            method_block,
            masm: MacroAssembler::new(flags.emit_comments),
            regs: RegisterAllocator::new(),
            fregs: FloatAllocator::new(),
            stack: Vec::new(),
            targets: HashMap::new(),
            shapes: HashMap::new(),
            fallthrough: true,
            current_bci: 0,
        }
    }

    pub fn generate(mut self) -> Result<CodeDescriptor, CompileError> {
        if self.method.param_words as usize > JAVA_ARG_REGS.len() {
            return Err(CompileError::TooManyArguments);
        }

        let framesize = self.framesize();
        if framesize > MAX_FRAME_SIZE {
            return Err(CompileError::UnencodableImmediate);
        }

        self.scan_targets()?;

        self.masm
            .emit_comment(format!("method {}", self.method.name));
        self.masm.prolog(framesize)?;
        self.store_params();

        if self.flags.entry_checkpoints {
            self.masm.emit_checkpoint();
        }

        let code = self.method.code.clone();
        let mut reader = BytecodeReader::new(&code);

        while !reader.is_done() {
            let bci = reader.pos();
            self.current_bci = bci;
            self.bytecode_prolog(bci)?;

            let op = reader.read_opcode();

            if !self.fallthrough {
                skip_bytecode(&mut reader, op, bci)?;
                continue;
            }

            if self.flags.emit_comments {
                self.masm.emit_comment(format!("{}: {:?}", bci, op));
            }

            self.compile_bytecode(op, &mut reader)?;
            self.bytecode_epilog(bci);
        }

        #[cfg(debug_assertions)]
        {
            self.regs.assert_all_free();
            self.fregs.assert_all_free();
        }

        self.masm.code(self.entries)
    }

    fn framesize(&self) -> i32 {
        let words = (self.method.max_locals + self.method.max_stack) as i32;
        align_i32(words * WORD_SIZE, STACK_FRAME_ALIGNMENT)
    }

    fn local_offset(&self, slot: u32) -> i32 {
        // the local area grows down from fp
        -((slot as i32 + 1) * WORD_SIZE)
    }

    fn spill_offset(&self, word_pos: u32) -> i32 {
        self.local_offset(self.method.max_locals + word_pos)
    }

    fn store_params(&mut self) {
        for word in 0..self.method.param_words {
            let offset = self.local_offset(word);
            self.masm.asm.str_imm(
                JAVA_ARG_REGS[word as usize].into(),
                REG_FP.into(),
                offset,
            );
        }
    }

    // label binding and operand-stack merge at basic-block boundaries

    fn bytecode_prolog(&mut self, bci: u32) -> Result<(), CompileError> {
        let lbl = match self.targets.get(&bci) {
            Some(&lbl) => lbl,
            None => return Ok(()),
        };

        if self.fallthrough {
            self.flush_stack()?;
            self.check_or_record_shape(bci)?;
        } else {
            let shape = self.shapes.get(&bci).cloned().unwrap_or_default();
            self.adopt_shape(shape);
        }

        self.masm.bind_label(lbl);
        self.fallthrough = true;
        Ok(())
    }

    fn bytecode_epilog(&mut self, _bci: u32) {
        // nothing per-bytecode today; the state machine hook stays for
        // the profiler extension
    }

    fn check_or_record_shape(&mut self, bci: u32) -> Result<(), CompileError> {
        let current: Vec<BasicType> = self.stack.iter().map(|value| value.ty()).collect();

        match self.shapes.get(&bci) {
            Some(recorded) => {
                if *recorded != current {
                    return Err(CompileError::UnsupportedStackShape(
                        "conflicting stack shapes at merge point",
                    ));
                }
            }
            None => {
                self.shapes.insert(bci, current);
            }
        }

        Ok(())
    }

    fn adopt_shape(&mut self, shape: Vec<BasicType>) {
        assert!(self.stack.is_empty(), "stack not drained before merge");

        let mut pos = 0;
        for ty in shape {
            self.stack.push(Value::spilled(ty, pos));
            pos += ty.word_count() as u32;
        }
    }

    /// Record the shape flowing into a branch target; called with the
    /// stack already flushed.
    fn record_branch_shape(&mut self, target: u32) -> Result<(), CompileError> {
        self.check_or_record_shape(target)
    }

    fn target_label(&self, target: u32) -> Label {
        *self.targets.get(&target).expect("branch target not scanned")
    }

    // operand stack model

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    /// Spill every stack value into its canonical frame slot. Afterwards
    /// no operand holds a register; required before calls and control
    /// transfers.
    fn flush_stack(&mut self) -> Result<(), CompileError> {
        let stack = std::mem::take(&mut self.stack);
        let mut pos = 0u32;
        let mut flushed = Vec::with_capacity(stack.len());

        for value in stack {
            let ty = value.ty();
            let words = ty.word_count() as u32;

            match value.storage() {
                Storage::Spilled(slot) => {
                    assert!(slot == pos, "spilled operand at stale position");
                    flushed.push(value);
                }

                Storage::Immediate => {
                    self.spill_immediate(&value, pos)?;
                    let _ = value.into_storage();
                    flushed.push(Value::spilled(ty, pos));
                }

                Storage::Reg(reg) => {
                    let offset = self.spill_offset(pos);
                    self.masm.asm.str_imm(reg.into(), REG_FP.into(), offset);
                    self.regs.dereference(reg);
                    let _ = value.into_storage();
                    flushed.push(Value::spilled(ty, pos));
                }

                Storage::Pair(first, second) => {
                    self.masm
                        .asm
                        .str_imm(first.into(), REG_FP.into(), self.spill_offset(pos));
                    self.masm
                        .asm
                        .str_imm(second.into(), REG_FP.into(), self.spill_offset(pos + 1));
                    self.regs.dereference(first);
                    self.regs.dereference(second);
                    let _ = value.into_storage();
                    flushed.push(Value::spilled(ty, pos));
                }

                Storage::FReg(freg) => {
                    self.masm
                        .asm
                        .vstr(freg.into(), REG_FP.into(), self.spill_offset(pos));
                    self.fregs.dereference(freg);
                    let _ = value.into_storage();
                    flushed.push(Value::spilled(ty, pos));
                }

                Storage::FPair(first, second) => {
                    self.masm
                        .asm
                        .vstr(first.into(), REG_FP.into(), self.spill_offset(pos));
                    self.masm
                        .asm
                        .vstr(second.into(), REG_FP.into(), self.spill_offset(pos + 1));
                    self.fregs.dereference(first);
                    self.fregs.dereference(second);
                    let _ = value.into_storage();
                    flushed.push(Value::spilled(ty, pos));
                }
            }

            pos += words;
        }

        self.stack = flushed;
        Ok(())
    }

    fn spill_immediate(&mut self, value: &Value, pos: u32) -> Result<(), CompileError> {
        let ty = value.ty();
        let spare = self.regs.spare()?;

        if ty.is_wide() {
            let bits = value.immediate_i64() as u64;
            let (hi, lo) = ((bits >> 32) as i32, bits as i32);
            let msw_first = if ty == BasicType::Long {
                LONG_MSW_FIRST
            } else {
                DOUBLE_MSW_FIRST
            };
            let (first, second) = if msw_first { (hi, lo) } else { (lo, hi) };

            self.masm.load_int_const(*spare, first);
            self.masm
                .asm
                .str_imm(spare.reg().into(), REG_FP.into(), self.spill_offset(pos));
            self.masm.load_int_const(*spare, second);
            self.masm
                .asm
                .str_imm(spare.reg().into(), REG_FP.into(), self.spill_offset(pos + 1));
        } else {
            if ty.is_reference() && value.immediate_i64() != 0 {
                self.masm
                    .load_pool_object(*spare, Address::from(value.immediate_i64() as u32));
            } else {
                self.masm.load_int_const(*spare, value.immediate_i64() as i32);
            }
            self.masm
                .asm
                .str_imm(spare.reg().into(), REG_FP.into(), self.spill_offset(pos));
        }

        Ok(())
    }

    /// Bring a value into registers, consuming immediates and spilled
    /// slots.
    fn materialize(&mut self, value: Value) -> Result<Value, CompileError> {
        let ty = value.ty();

        match value.storage() {
            Storage::Reg(_) | Storage::Pair(..) | Storage::FReg(_) | Storage::FPair(..) => {
                Ok(value)
            }

            Storage::Immediate => {
                let result = match ty {
                    BasicType::Int => {
                        let reg = self.regs.allocate()?;
                        self.masm.load_int_const(reg, value.immediate_i32());
                        Value::in_reg(ty, reg)
                    }

                    BasicType::Object | BasicType::Array => {
                        let reg = self.regs.allocate()?;
                        let bits = value.immediate_i64() as u32;
                        if bits == 0 {
                            self.masm.load_int_const(reg, 0);
                        } else {
                            self.masm.load_pool_object(reg, Address::from(bits));
                        }
                        Value::in_reg(ty, reg)
                    }

                    BasicType::Long => {
                        let bits = value.immediate_i64() as u64;
                        let first_reg = self.regs.allocate()?;
                        let second_reg = self.regs.allocate()?;
                        let (hi, lo) = ((bits >> 32) as i32, bits as i32);
                        let (first, second) = if LONG_MSW_FIRST { (hi, lo) } else { (lo, hi) };
                        self.masm.load_int_const(first_reg, first);
                        self.masm.load_int_const(second_reg, second);
                        Value::in_pair(ty, first_reg, second_reg)
                    }

                    BasicType::Float => {
                        let freg = self.fregs.allocate()?;
                        self.masm
                            .load_float_const(freg, value.immediate_i64() as u32);
                        Value::in_freg(freg)
                    }

                    BasicType::Double => {
                        let bits = value.immediate_i64() as u64;
                        let (first_f, second_f) = self.fregs.allocate_pair()?;
                        let (hi, lo) = ((bits >> 32) as u32, bits as u32);
                        let (first, second) = if DOUBLE_MSW_FIRST { (hi, lo) } else { (lo, hi) };
                        self.masm.load_float_const(first_f, first);
                        self.masm.load_float_const(second_f, second);
                        Value::in_fpair(first_f, second_f)
                    }
                };

                let _ = value.into_storage();
                Ok(result)
            }

            Storage::Spilled(pos) => {
                let result = match ty {
                    BasicType::Int | BasicType::Object | BasicType::Array => {
                        let reg = self.regs.allocate()?;
                        self.masm
                            .asm
                            .ldr_imm(reg.into(), REG_FP.into(), self.spill_offset(pos));
                        Value::in_reg(ty, reg)
                    }

                    BasicType::Long => {
                        let first = self.regs.allocate()?;
                        let second = self.regs.allocate()?;
                        self.masm
                            .asm
                            .ldr_imm(first.into(), REG_FP.into(), self.spill_offset(pos));
                        self.masm
                            .asm
                            .ldr_imm(second.into(), REG_FP.into(), self.spill_offset(pos + 1));
                        Value::in_pair(ty, first, second)
                    }

                    BasicType::Float => {
                        let freg = self.fregs.allocate()?;
                        self.masm
                            .asm
                            .vldr(freg.into(), REG_FP.into(), self.spill_offset(pos));
                        Value::in_freg(freg)
                    }

                    BasicType::Double => {
                        let (first, second) = self.fregs.allocate_pair()?;
                        self.masm
                            .asm
                            .vldr(first.into(), REG_FP.into(), self.spill_offset(pos));
                        self.masm
                            .asm
                            .vldr(second.into(), REG_FP.into(), self.spill_offset(pos + 1));
                        Value::in_fpair(first, second)
                    }
                };

                let _ = value.into_storage();
                Ok(result)
            }
        }
    }

    fn pop_materialized(&mut self) -> Result<Value, CompileError> {
        let value = self.pop();
        self.materialize(value)
    }

    fn destroy(&mut self, value: Value) {
        value.destroy(&self.regs, &mut self.fregs);
    }

    fn discard_stack(&mut self) {
        while let Some(value) = self.stack.pop() {
            value.destroy(&self.regs, &mut self.fregs);
        }
    }

    fn make_long_pair(&self, msw: Reg, lsw: Reg) -> Value {
        if LONG_MSW_FIRST {
            Value::in_pair(BasicType::Long, msw, lsw)
        } else {
            Value::in_pair(BasicType::Long, lsw, msw)
        }
    }

    /// A register holding `value`'s word that is safe to overwrite:
    /// reused when this value is the only holder, fresh otherwise
    /// (`dup` aliases must not observe the write).
    fn writable_int(&mut self, value: Value) -> Result<Reg, CompileError> {
        let reg = value.reg();

        if self.regs.is_exclusively_held(reg) {
            let _ = value.into_storage();
            Ok(reg)
        } else {
            let fresh = self.regs.allocate()?;
            self.masm.asm.mov_reg(fresh.into(), reg.into());
            self.destroy(value);
            Ok(fresh)
        }
    }

    fn writable_pair(&mut self, value: Value) -> Result<(Reg, Reg), CompileError> {
        let (first, second) = value.pair();

        if self.regs.is_exclusively_held(first) && self.regs.is_exclusively_held(second) {
            let _ = value.into_storage();
            Ok((first, second))
        } else {
            let fresh_first = self.regs.allocate()?;
            let fresh_second = self.regs.allocate()?;
            self.masm.asm.mov_reg(fresh_first.into(), first.into());
            self.masm.asm.mov_reg(fresh_second.into(), second.into());
            self.destroy(value);
            Ok((fresh_first, fresh_second))
        }
    }

    // runtime-entry calls

    /// Marshal popped argument values into r0..r3 (slot order) and call
    /// the entry. The operand stack must be flushed first; the argument
    /// values must be spilled or immediate.
    fn marshal_and_call(
        &mut self,
        entry: Address,
        args: Vec<Value>,
    ) -> Result<(), CompileError> {
        self.marshal_arguments(&args)?;
        self.release_arguments(args);
        self.masm.call_runtime(entry);
        Ok(())
    }

    fn push_call_result(&mut self, ty: Option<BasicType>) -> Result<(), CompileError> {
        let ty = match ty {
            Some(ty) => ty,
            None => return Ok(()),
        };

        match ty {
            BasicType::Int | BasicType::Object | BasicType::Array => {
                let reg = self.regs.allocate()?;
                if reg != REG_RESULT {
                    self.masm.asm.mov_reg(reg.into(), REG_RESULT.into());
                }
                self.push(Value::in_reg(ty, reg));
            }

            BasicType::Long => {
                let first = self.regs.allocate()?;
                let second = self.regs.allocate()?;
                if first != REG_RESULT {
                    self.masm.asm.mov_reg(first.into(), REG_RESULT.into());
                }
                if second != REG_RESULT2 {
                    self.masm.asm.mov_reg(second.into(), REG_RESULT2.into());
                }
                self.push(Value::in_pair(ty, first, second));
            }

            BasicType::Float => {
                let freg = self.fregs.allocate()?;
                self.masm.asm.vmov_sr(freg.into(), REG_RESULT.into());
                self.push(Value::in_freg(freg));
            }

            BasicType::Double => {
                let (first, second) = self.fregs.allocate_pair()?;
                self.masm.asm.vmov_sr(first.into(), REG_RESULT.into());
                self.masm.asm.vmov_sr(second.into(), REG_RESULT2.into());
                self.push(Value::in_fpair(first, second));
            }
        }

        Ok(())
    }

    /// Pop `arg_count` values, flush, marshal, call, push the result.
    fn runtime_op(
        &mut self,
        entry: Address,
        arg_count: usize,
        result: Option<BasicType>,
    ) -> Result<(), CompileError> {
        self.flush_stack()?;

        let split = self.stack.len() - arg_count;
        let args: Vec<Value> = self.stack.drain(split..).collect();

        self.marshal_and_call(entry, args)?;
        self.push_call_result(result)
    }

    // opcode dispatch

    fn compile_bytecode(
        &mut self,
        op: BytecodeOpcode,
        reader: &mut BytecodeReader<'_>,
    ) -> Result<(), CompileError> {
        use BytecodeOpcode::*;

        match op {
            Nop => {}

            AConstNull => self.push(Value::null()),
            IConstM1 => self.push(Value::int_const(-1)),
            IConst0 => self.push(Value::int_const(0)),
            IConst1 => self.push(Value::int_const(1)),
            IConst2 => self.push(Value::int_const(2)),
            IConst3 => self.push(Value::int_const(3)),
            IConst4 => self.push(Value::int_const(4)),
            IConst5 => self.push(Value::int_const(5)),
            LConst0 => self.push(Value::long_const(0)),
            LConst1 => self.push(Value::long_const(1)),
            FConst0 => self.push(Value::float_const(0.0)),
            FConst1 => self.push(Value::float_const(1.0)),
            FConst2 => self.push(Value::float_const(2.0)),
            DConst0 => self.push(Value::double_const(0.0)),
            DConst1 => self.push(Value::double_const(1.0)),

            Bipush => {
                let value = reader.read_i8() as i32;
                self.push(Value::int_const(value));
            }
            Sipush => {
                let value = reader.read_i16() as i32;
                self.push(Value::int_const(value));
            }

            Ldc => {
                let idx = reader.read_u8() as u16;
                self.emit_ldc(idx, op)?;
            }
            LdcW | Ldc2W => {
                let idx = reader.read_u16();
                self.emit_ldc(idx, op)?;
            }

            ILoad | LLoad | FLoad | DLoad | ALoad => {
                let slot = reader.read_u8() as u32;
                self.emit_load_local(op_load_type(op), slot)?;
            }
            ILoad0 | ILoad1 | ILoad2 | ILoad3 => {
                self.emit_load_local(BasicType::Int, op as u32 - ILoad0 as u32)?;
            }
            LLoad0 | LLoad1 | LLoad2 | LLoad3 => {
                self.emit_load_local(BasicType::Long, op as u32 - LLoad0 as u32)?;
            }
            FLoad0 | FLoad1 | FLoad2 | FLoad3 => {
                self.emit_load_local(BasicType::Float, op as u32 - FLoad0 as u32)?;
            }
            DLoad0 | DLoad1 | DLoad2 | DLoad3 => {
                self.emit_load_local(BasicType::Double, op as u32 - DLoad0 as u32)?;
            }
            ALoad0 | ALoad1 | ALoad2 | ALoad3 => {
                self.emit_load_local(BasicType::Object, op as u32 - ALoad0 as u32)?;
            }

            IStore | FStore | AStore | LStore | DStore => {
                let slot = reader.read_u8() as u32;
                self.emit_store_local(slot)?;
            }
            IStore0 | IStore1 | IStore2 | IStore3 => {
                self.emit_store_local(op as u32 - IStore0 as u32)?;
            }
            LStore0 | LStore1 | LStore2 | LStore3 => {
                self.emit_store_local(op as u32 - LStore0 as u32)?;
            }
            FStore0 | FStore1 | FStore2 | FStore3 => {
                self.emit_store_local(op as u32 - FStore0 as u32)?;
            }
            DStore0 | DStore1 | DStore2 | DStore3 => {
                self.emit_store_local(op as u32 - DStore0 as u32)?;
            }
            AStore0 | AStore1 | AStore2 | AStore3 => {
                self.emit_store_local(op as u32 - AStore0 as u32)?;
            }

            IALoad => self.emit_array_load(BasicType::Int, AccessWidth::Word, 2)?,
            AALoad => self.emit_array_load(BasicType::Object, AccessWidth::Word, 2)?,
            FALoad => self.emit_array_load(BasicType::Float, AccessWidth::Extended, 2)?,
            BALoad => self.emit_array_load(BasicType::Int, AccessWidth::SignedByte, 0)?,
            CALoad => self.emit_array_load(BasicType::Int, AccessWidth::Half, 1)?,
            SALoad => self.emit_array_load(BasicType::Int, AccessWidth::SignedHalf, 1)?,
            LALoad => self.emit_array_load_wide(BasicType::Long)?,
            DALoad => self.emit_array_load_wide(BasicType::Double)?,

            IAStore => self.emit_array_store(AccessWidth::Word, 2)?,
            AAStore => self.emit_array_store_object()?,
            FAStore => self.emit_array_store(AccessWidth::Extended, 2)?,
            BAStore => self.emit_array_store(AccessWidth::Byte, 0)?,
            CAStore | SAStore => self.emit_array_store(AccessWidth::Half, 1)?,
            LAStore | DAStore => self.emit_array_store_wide()?,

            Pop => {
                let value = self.pop();
                assert!(value.ty().word_count() == 1);
                self.destroy(value);
            }
            Pop2 => {
                let value = self.pop();
                if value.ty().word_count() == 1 {
                    self.destroy(value);
                    let second = self.pop();
                    assert!(second.ty().word_count() == 1);
                    self.destroy(second);
                } else {
                    self.destroy(value);
                }
            }

            Dup => self.emit_dup()?,
            DupX1 => self.emit_dup_x1()?,
            Dup2 => self.emit_dup2()?,
            Swap => self.emit_swap()?,

            IAdd => self.emit_int_binop(BinaryOp::Add)?,
            ISub => self.emit_int_binop(BinaryOp::Sub)?,
            IMul => self.emit_int_binop(BinaryOp::Mul)?,
            IDiv => self.emit_int_binop(BinaryOp::Div)?,
            IRem => self.emit_int_binop(BinaryOp::Rem)?,
            IShl => self.emit_int_binop(BinaryOp::Shl)?,
            IShr => self.emit_int_binop(BinaryOp::Shr)?,
            IUshr => self.emit_int_binop(BinaryOp::Ushr)?,
            IAnd => self.emit_int_binop(BinaryOp::And)?,
            IOr => self.emit_int_binop(BinaryOp::Or)?,
            IXor => self.emit_int_binop(BinaryOp::Xor)?,
            INeg => self.emit_int_neg()?,

            LAdd => self.emit_long_binop(BinaryOp::Add)?,
            LSub => self.emit_long_binop(BinaryOp::Sub)?,
            LMul => self.emit_long_binop(BinaryOp::Mul)?,
            LDiv => self.emit_long_binop(BinaryOp::Div)?,
            LRem => self.emit_long_binop(BinaryOp::Rem)?,
            LAnd => self.emit_long_binop(BinaryOp::And)?,
            LOr => self.emit_long_binop(BinaryOp::Or)?,
            LXor => self.emit_long_binop(BinaryOp::Xor)?,
            LShl => self.emit_long_shift(BinaryOp::Shl)?,
            LShr => self.emit_long_shift(BinaryOp::Shr)?,
            LUshr => self.emit_long_shift(BinaryOp::Ushr)?,
            LNeg => self.emit_long_neg()?,

            FAdd => self.emit_float_binop(BinaryOp::Add)?,
            FSub => self.emit_float_binop(BinaryOp::Sub)?,
            FMul => self.emit_float_binop(BinaryOp::Mul)?,
            FDiv => self.emit_float_binop(BinaryOp::Div)?,
            FRem => self.runtime_op(self.entries.frem, 2, Some(BasicType::Float))?,
            FNeg => self.emit_float_neg()?,

            DAdd => self.runtime_op(self.entries.dadd, 2, Some(BasicType::Double))?,
            DSub => self.runtime_op(self.entries.dsub, 2, Some(BasicType::Double))?,
            DMul => self.runtime_op(self.entries.dmul, 2, Some(BasicType::Double))?,
            DDiv => self.runtime_op(self.entries.ddiv, 2, Some(BasicType::Double))?,
            DRem => self.runtime_op(self.entries.drem, 2, Some(BasicType::Double))?,
            DNeg => self.emit_double_neg()?,

            IInc => {
                let slot = reader.read_u8() as u32;
                let delta = reader.read_i8() as i32;
                self.emit_iinc(slot, delta)?;
            }

            I2L => self.emit_i2l()?,
            L2I => self.emit_l2i()?,
            I2B => self.emit_int_extend(24, Shift::Asr)?,
            I2C => self.emit_int_extend(16, Shift::Lsr)?,
            I2S => self.emit_int_extend(16, Shift::Asr)?,
            I2F => self.emit_i2f()?,
            F2I => self.emit_f2i()?,
            I2D => self.runtime_op(self.entries.i2d, 1, Some(BasicType::Double))?,
            L2F => self.runtime_op(self.entries.l2f, 1, Some(BasicType::Float))?,
            L2D => self.runtime_op(self.entries.l2d, 1, Some(BasicType::Double))?,
            F2L => self.runtime_op(self.entries.f2l, 1, Some(BasicType::Long))?,
            F2D => self.runtime_op(self.entries.f2d, 1, Some(BasicType::Double))?,
            D2I => self.runtime_op(self.entries.d2i, 1, Some(BasicType::Int))?,
            D2L => self.runtime_op(self.entries.d2l, 1, Some(BasicType::Long))?,
            D2F => self.runtime_op(self.entries.d2f, 1, Some(BasicType::Float))?,

            LCmp => self.emit_lcmp()?,
            FCmpL => self.emit_fcmp(false)?,
            FCmpG => self.emit_fcmp(true)?,
            DCmpL => self.runtime_op(self.entries.dcmpl, 2, Some(BasicType::Int))?,
            DCmpG => self.runtime_op(self.entries.dcmpg, 2, Some(BasicType::Int))?,

            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => {
                let target = branch_target(reader, self.current_bci);
                self.emit_if_zero(cond_for_if(op), target)?;
            }

            IfICmpEq | IfICmpNe | IfICmpLt | IfICmpGe | IfICmpGt | IfICmpLe => {
                let target = branch_target(reader, self.current_bci);
                self.emit_if_icmp(cond_for_icmp(op), target)?;
            }

            IfACmpEq | IfACmpNe => {
                let target = branch_target(reader, self.current_bci);
                let cond = if op == IfACmpEq { Cond::Eq } else { Cond::Ne };
                self.emit_if_acmp(cond, target)?;
            }

            IfNull | IfNonNull => {
                let target = branch_target(reader, self.current_bci);
                let cond = if op == IfNull { Cond::Eq } else { Cond::Ne };
                self.emit_if_zero(cond, target)?;
            }

            Goto => {
                let target = branch_target(reader, self.current_bci);
                self.emit_goto(target)?;
            }
            GotoW => {
                let offset = reader.read_i32();
                let target = (self.current_bci as i64 + offset as i64) as u32;
                self.emit_goto(target)?;
            }

            TableSwitch => self.emit_table_switch(reader)?,
            LookupSwitch => self.emit_lookup_switch(reader)?,

            IReturn | AReturn => self.emit_return_word()?,
            LReturn => self.emit_return_long()?,
            FReturn => self.emit_return_float()?,
            DReturn => self.emit_return_double()?,
            Return => {
                self.discard_stack();
                self.masm.epilog();
                self.fallthrough = false;
            }

            GetField => {
                let idx = reader.read_u16();
                self.emit_getfield(idx)?;
            }
            PutField => {
                let idx = reader.read_u16();
                self.emit_putfield(idx)?;
            }
            GetStatic => {
                let idx = reader.read_u16();
                self.emit_getstatic(idx)?;
            }
            PutStatic => {
                let idx = reader.read_u16();
                self.emit_putstatic(idx)?;
            }

            InvokeStatic | InvokeSpecial => {
                let idx = reader.read_u16();
                self.emit_invoke_direct(idx)?;
            }
            InvokeVirtual => {
                let idx = reader.read_u16();
                self.emit_invoke_virtual(idx)?;
            }
            InvokeInterface => {
                let idx = reader.read_u16();
                let _count = reader.read_u8();
                let _zero = reader.read_u8();
                self.emit_invoke_interface(idx)?;
            }

            New => {
                let idx = reader.read_u16();
                let class_id = self.class_token(idx)?;
                self.flush_stack()?;
                self.masm.load_int_const(JAVA_ARG_REGS[0], class_id);
                self.masm.call_runtime(self.entries.alloc_object);
                self.push_call_result(Some(BasicType::Object))?;
            }

            NewArray => {
                let atype = reader.read_u8() as i32;
                self.flush_stack()?;
                let length = self.stack.pop().expect("operand stack underflow");
                self.marshal_and_call_with_extra(self.entries.alloc_array, length, atype)?;
                self.push_call_result(Some(BasicType::Array))?;
            }

            ANewArray => {
                let idx = reader.read_u16();
                let class_id = self.class_token(idx)?;
                self.flush_stack()?;
                let length = self.stack.pop().expect("operand stack underflow");
                self.marshal_and_call_with_extra(self.entries.alloc_array, length, class_id)?;
                self.push_call_result(Some(BasicType::Array))?;
            }

            ArrayLength => self.emit_array_length()?,

            AThrow => {
                self.runtime_op(self.entries.throw_exception, 1, None)?;
                self.discard_stack();
                self.fallthrough = false;
            }

            CheckCast => {
                let idx = reader.read_u16();
                let class_id = self.class_token(idx)?;
                self.flush_stack()?;
                let obj = self.stack.pop().expect("operand stack underflow");
                self.marshal_and_call_with_extra(self.entries.checkcast, obj, class_id)?;
                self.push_call_result(Some(BasicType::Object))?;
            }

            InstanceOf => {
                let idx = reader.read_u16();
                let class_id = self.class_token(idx)?;
                self.flush_stack()?;
                let obj = self.stack.pop().expect("operand stack underflow");
                self.marshal_and_call_with_extra(self.entries.instance_of, obj, class_id)?;
                self.push_call_result(Some(BasicType::Int))?;
            }

            MonitorEnter => self.runtime_op(self.entries.monitor_enter, 1, None)?,
            MonitorExit => self.runtime_op(self.entries.monitor_exit, 1, None)?,

            _ => return Err(CompileError::UnsupportedBytecode(op)),
        }

        Ok(())
    }

    // constants and locals

    fn emit_ldc(&mut self, idx: u16, op: BytecodeOpcode) -> Result<(), CompileError> {
        match *self.method.const_pool(idx) {
            ConstPoolEntry::Int(value) => self.push(Value::int_const(value)),
            ConstPoolEntry::Float(value) => self.push(Value::float_const(value)),
            ConstPoolEntry::Long(value) => self.push(Value::long_const(value)),
            ConstPoolEntry::Double(value) => self.push(Value::double_const(value)),
            ConstPoolEntry::String(addr) => self.push(Value::object_const(addr as u32)),
            _ => return Err(CompileError::UnsupportedBytecode(op)),
        }

        Ok(())
    }

    fn emit_load_local(&mut self, ty: BasicType, slot: u32) -> Result<(), CompileError> {
        let offset = self.local_offset(slot);

        match ty {
            BasicType::Int | BasicType::Object | BasicType::Array => {
                let reg = self.regs.allocate()?;
                self.masm.asm.ldr_imm(reg.into(), REG_FP.into(), offset);
                self.push(Value::in_reg(ty, reg));
            }

            BasicType::Long => {
                let first = self.regs.allocate()?;
                let second = self.regs.allocate()?;
                self.masm.asm.ldr_imm(first.into(), REG_FP.into(), offset);
                self.masm
                    .asm
                    .ldr_imm(second.into(), REG_FP.into(), self.local_offset(slot + 1));
                self.push(Value::in_pair(ty, first, second));
            }

            BasicType::Float => {
                let freg = self.fregs.allocate()?;
                self.masm.asm.vldr(freg.into(), REG_FP.into(), offset);
                self.push(Value::in_freg(freg));
            }

            BasicType::Double => {
                let (first, second) = self.fregs.allocate_pair()?;
                self.masm.asm.vldr(first.into(), REG_FP.into(), offset);
                self.masm
                    .asm
                    .vldr(second.into(), REG_FP.into(), self.local_offset(slot + 1));
                self.push(Value::in_fpair(first, second));
            }
        }

        Ok(())
    }

    fn emit_store_local(&mut self, slot: u32) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let offset = self.local_offset(slot);

        match value.storage() {
            Storage::Reg(reg) => {
                self.masm.asm.str_imm(reg.into(), REG_FP.into(), offset);
            }
            Storage::Pair(first, second) => {
                self.masm.asm.str_imm(first.into(), REG_FP.into(), offset);
                self.masm
                    .asm
                    .str_imm(second.into(), REG_FP.into(), self.local_offset(slot + 1));
            }
            Storage::FReg(freg) => {
                self.masm.asm.vstr(freg.into(), REG_FP.into(), offset);
            }
            Storage::FPair(first, second) => {
                self.masm.asm.vstr(first.into(), REG_FP.into(), offset);
                self.masm
                    .asm
                    .vstr(second.into(), REG_FP.into(), self.local_offset(slot + 1));
            }
            _ => unreachable!(),
        }

        self.destroy(value);
        Ok(())
    }

    fn emit_iinc(&mut self, slot: u32, delta: i32) -> Result<(), CompileError> {
        let spare = self.regs.spare()?;
        let offset = self.local_offset(slot);

        self.masm
            .asm
            .ldr_imm(spare.reg().into(), REG_FP.into(), offset);
        if delta >= 0 {
            self.masm
                .asm
                .add_imm(spare.reg().into(), spare.reg().into(), delta as u32);
        } else {
            self.masm
                .asm
                .sub_imm(spare.reg().into(), spare.reg().into(), delta.unsigned_abs());
        }
        self.masm
            .asm
            .str_imm(spare.reg().into(), REG_FP.into(), offset);

        Ok(())
    }

    // stack shuffling

    fn emit_dup(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let copy = self.reference_copy(&value);
        self.push(value);
        self.push(copy);
        Ok(())
    }

    fn emit_dup_x1(&mut self) -> Result<(), CompileError> {
        let top = self.pop_materialized()?;
        let under = self.pop_materialized()?;
        let copy = self.reference_copy(&top);
        self.push(copy);
        self.push(under);
        self.push(top);
        Ok(())
    }

    fn emit_dup2(&mut self) -> Result<(), CompileError> {
        let top = self.pop_materialized()?;

        if top.ty().is_wide() {
            let copy = self.reference_copy(&top);
            self.push(top);
            self.push(copy);
        } else {
            let under = self.pop_materialized()?;
            let under_copy = self.reference_copy(&under);
            let top_copy = self.reference_copy(&top);
            self.push(under);
            self.push(top);
            self.push(under_copy);
            self.push(top_copy);
        }

        Ok(())
    }

    fn emit_swap(&mut self) -> Result<(), CompileError> {
        let top = self.pop_materialized()?;
        let under = self.pop_materialized()?;
        self.push(top);
        self.push(under);
        Ok(())
    }

    fn reference_copy(&mut self, value: &Value) -> Value {
        match value.storage() {
            Storage::Reg(reg) => {
                self.regs.reference(reg);
                Value::in_reg(value.ty(), reg)
            }
            Storage::Pair(first, second) => {
                self.regs.reference(first);
                self.regs.reference(second);
                Value::in_pair(value.ty(), first, second)
            }
            Storage::FReg(freg) => {
                self.fregs.reference(freg);
                Value::in_freg(freg)
            }
            Storage::FPair(first, second) => {
                self.fregs.reference(first);
                self.fregs.reference(second);
                Value::in_fpair(first, second)
            }
            Storage::Immediate | Storage::Spilled(_) => unreachable!("copy of unmaterialized value"),
        }
    }

    // integer arithmetic

    fn emit_int_binop(&mut self, op: BinaryOp) -> Result<(), CompileError> {
        match op {
            BinaryOp::Div => return self.runtime_op(self.entries.idiv, 2, Some(BasicType::Int)),
            BinaryOp::Rem => return self.runtime_op(self.entries.irem, 2, Some(BasicType::Int)),
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::Ushr => return self.emit_int_shift(op),
            _ => {}
        }

        let rhs = self.pop();
        let lhs = self.pop();

        // immediate right operand for the plain add/sub forms
        if rhs.is_immediate() && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let imm = rhs.immediate_i32();
            let magnitude = imm.unsigned_abs();

            if arm::is_encodable_imm(magnitude) {
                let lhs = self.materialize(lhs)?;
                let dest = self.writable_int(lhs)?;
                let add = (op == BinaryOp::Add) == (imm >= 0);

                if add {
                    self.masm.asm.add_imm(dest.into(), dest.into(), magnitude);
                } else {
                    self.masm.asm.sub_imm(dest.into(), dest.into(), magnitude);
                }

                let _ = rhs.into_storage();
                self.push(Value::in_reg(BasicType::Int, dest));
                return Ok(());
            }
        }

        let rhs = self.materialize(rhs)?;
        let lhs = self.materialize(lhs)?;
        let rhs_reg = rhs.reg();

        match op {
            BinaryOp::Mul => {
                let lhs_reg = lhs.reg();

                // mul requires rd != rm
                let dest = if self.regs.is_exclusively_held(lhs_reg) && lhs_reg != rhs_reg {
                    let _ = lhs.into_storage();
                    lhs_reg
                } else {
                    let fresh = self.regs.allocate()?;
                    self.destroy(lhs);
                    fresh
                };

                self.masm.asm.mul(dest.into(), rhs_reg.into(), lhs_reg.into());
                self.destroy(rhs);
                self.push(Value::in_reg(BasicType::Int, dest));
            }

            BinaryOp::Min | BinaryOp::Max => {
                let dest = self.writable_int(lhs)?;
                self.masm.asm.cmp_reg(dest.into(), rhs_reg.into());
                let take_rhs = if op == BinaryOp::Min { Cond::Gt } else { Cond::Lt };
                self.masm.asm.mov_reg_cond(take_rhs, dest.into(), rhs_reg.into());
                self.destroy(rhs);
                self.push(Value::in_reg(BasicType::Int, dest));
            }

            _ => {
                let emit = INT_DP_TABLE[op as usize].expect("operator without dp emitter");
                let dest = self.writable_int(lhs)?;
                emit(&mut self.masm.asm, dest.into(), dest.into(), rhs_reg.into());
                self.destroy(rhs);
                self.push(Value::in_reg(BasicType::Int, dest));
            }
        }

        Ok(())
    }

    fn emit_int_shift(&mut self, op: BinaryOp) -> Result<(), CompileError> {
        let rhs = self.pop();
        let lhs = self.pop();
        let lhs = self.materialize(lhs)?;
        let shift = shift_for(op);

        if rhs.is_immediate() {
            let amount = (rhs.immediate_i32() & 31) as u32;
            let dest = self.writable_int(lhs)?;

            if amount > 0 {
                self.masm
                    .asm
                    .mov_shift_imm(dest.into(), dest.into(), shift, amount);
            }

            let _ = rhs.into_storage();
            self.push(Value::in_reg(BasicType::Int, dest));
            return Ok(());
        }

        let rhs = self.materialize(rhs)?;
        let amount = self.writable_int(rhs)?;
        self.masm.asm.and_imm(amount.into(), amount.into(), 31);

        let dest = self.writable_int(lhs)?;
        self.masm
            .asm
            .mov_shift_reg(dest.into(), dest.into(), shift, amount.into());

        self.regs.dereference(amount);
        self.push(Value::in_reg(BasicType::Int, dest));
        Ok(())
    }

    fn emit_int_neg(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let dest = self.writable_int(value)?;
        self.masm.asm.rsb_imm(dest.into(), dest.into(), 0);
        self.push(Value::in_reg(BasicType::Int, dest));
        Ok(())
    }

    fn emit_int_extend(&mut self, bits: u32, back: Shift) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let dest = self.writable_int(value)?;
        self.masm
            .asm
            .mov_shift_imm(dest.into(), dest.into(), Shift::Lsl, bits);
        self.masm.asm.mov_shift_imm(dest.into(), dest.into(), back, bits);
        self.push(Value::in_reg(BasicType::Int, dest));
        Ok(())
    }

    // long arithmetic

    fn emit_long_binop(&mut self, op: BinaryOp) -> Result<(), CompileError> {
        match op {
            BinaryOp::Mul => return self.runtime_op(self.entries.lmul, 2, Some(BasicType::Long)),
            BinaryOp::Div => return self.runtime_op(self.entries.ldiv, 2, Some(BasicType::Long)),
            BinaryOp::Rem => return self.runtime_op(self.entries.lrem, 2, Some(BasicType::Long)),
            _ => {}
        }

        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;

        let (rhs_msw, rhs_lsw) = (rhs.msw_reg(), rhs.lsw_reg());
        let (dest_first, dest_second) = self.writable_pair(lhs)?;

        let dest = self.make_writable_long(dest_first, dest_second);
        let (dest_msw, dest_lsw) = (dest.msw_reg(), dest.lsw_reg());

        match op {
            BinaryOp::Add => {
                self.masm
                    .asm
                    .adds_reg(dest_lsw.into(), dest_lsw.into(), rhs_lsw.into());
                self.masm
                    .asm
                    .adc_reg(dest_msw.into(), dest_msw.into(), rhs_msw.into());
            }
            BinaryOp::Sub => {
                self.masm
                    .asm
                    .subs_reg(dest_lsw.into(), dest_lsw.into(), rhs_lsw.into());
                self.masm
                    .asm
                    .sbc_reg(dest_msw.into(), dest_msw.into(), rhs_msw.into());
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                let emit = INT_DP_TABLE[op as usize].expect("operator without dp emitter");
                emit(&mut self.masm.asm, dest_lsw.into(), dest_lsw.into(), rhs_lsw.into());
                emit(&mut self.masm.asm, dest_msw.into(), dest_msw.into(), rhs_msw.into());
            }
            _ => unreachable!(),
        }

        self.destroy(rhs);
        self.push(dest);
        Ok(())
    }

    fn make_writable_long(&self, first: Reg, second: Reg) -> Value {
        Value::in_pair(BasicType::Long, first, second)
    }

    fn emit_long_shift(&mut self, op: BinaryOp) -> Result<(), CompileError> {
        let rhs = self.pop();
        let lhs = self.pop_materialized()?;

        let (dest_first, dest_second) = self.writable_pair(lhs)?;
        let dest = self.make_writable_long(dest_first, dest_second);
        let (msw, lsw) = (dest.msw_reg(), dest.lsw_reg());

        let rhs = self.materialize(rhs)?;
        let amount = self.writable_int(rhs)?;
        let tmp = self.regs.spare()?;

        self.masm.asm.and_imm(amount.into(), amount.into(), 63);
        self.masm
            .asm
            .rsb_imm(tmp.reg().into(), amount.into(), 32);

        match op {
            BinaryOp::Shl => {
                self.masm
                    .asm
                    .mov_shift_reg(msw.into(), msw.into(), Shift::Lsl, amount.into());
                self.masm.asm.orr_shift_reg(
                    msw.into(),
                    msw.into(),
                    lsw.into(),
                    Shift::Lsr,
                    tmp.reg().into(),
                );
                self.masm
                    .asm
                    .subs_imm(tmp.reg().into(), amount.into(), 32);
                self.masm.asm.orr_shift_reg_cond(
                    Cond::Pl,
                    msw.into(),
                    msw.into(),
                    lsw.into(),
                    Shift::Lsl,
                    tmp.reg().into(),
                );
                self.masm
                    .asm
                    .mov_shift_reg(lsw.into(), lsw.into(), Shift::Lsl, amount.into());
            }

            BinaryOp::Shr | BinaryOp::Ushr => {
                let high_shift = if op == BinaryOp::Shr { Shift::Asr } else { Shift::Lsr };

                self.masm
                    .asm
                    .mov_shift_reg(lsw.into(), lsw.into(), Shift::Lsr, amount.into());
                self.masm.asm.orr_shift_reg(
                    lsw.into(),
                    lsw.into(),
                    msw.into(),
                    Shift::Lsl,
                    tmp.reg().into(),
                );
                self.masm
                    .asm
                    .subs_imm(tmp.reg().into(), amount.into(), 32);
                self.masm.asm.orr_shift_reg_cond(
                    Cond::Pl,
                    lsw.into(),
                    lsw.into(),
                    msw.into(),
                    high_shift,
                    tmp.reg().into(),
                );
                self.masm
                    .asm
                    .mov_shift_reg(msw.into(), msw.into(), high_shift, amount.into());
            }

            _ => unreachable!(),
        }

        self.regs.dereference(amount);
        self.push(dest);
        Ok(())
    }

    fn emit_long_neg(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let (first, second) = self.writable_pair(value)?;
        let dest = self.make_writable_long(first, second);
        let (msw, lsw) = (dest.msw_reg(), dest.lsw_reg());

        self.masm.asm.rsbs_imm(lsw.into(), lsw.into(), 0);
        self.masm.asm.rsc_imm(msw.into(), msw.into(), 0);

        self.push(dest);
        Ok(())
    }

    fn emit_i2l(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let lsw = self.writable_int(value)?;
        let msw = self.regs.allocate()?;
        self.masm
            .asm
            .mov_shift_imm(msw.into(), lsw.into(), Shift::Asr, 31);
        let result = self.make_long_pair(msw, lsw);
        self.push(result);
        Ok(())
    }

    fn emit_l2i(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let msw = value.msw_reg();
        let lsw = value.lsw_reg();
        let _ = value.into_storage();
        self.regs.dereference(msw);
        self.push(Value::in_reg(BasicType::Int, lsw));
        Ok(())
    }

    // float arithmetic

    fn emit_float_binop(&mut self, op: BinaryOp) -> Result<(), CompileError> {
        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;

        let rhs_s = rhs.freg();
        let lhs_s = lhs.freg();
        let dest = if self.fregs.is_exclusively_held(lhs_s) {
            let _ = lhs.into_storage();
            lhs_s
        } else {
            let fresh = self.fregs.allocate()?;
            self.destroy(lhs);
            fresh
        };

        match op {
            BinaryOp::Add => self.masm.asm.vadd_f32(dest.into(), lhs_s.into(), rhs_s.into()),
            BinaryOp::Sub => self.masm.asm.vsub_f32(dest.into(), lhs_s.into(), rhs_s.into()),
            BinaryOp::Mul => self.masm.asm.vmul_f32(dest.into(), lhs_s.into(), rhs_s.into()),
            BinaryOp::Div => self.masm.asm.vdiv_f32(dest.into(), lhs_s.into(), rhs_s.into()),
            _ => unreachable!(),
        }

        self.destroy(rhs);
        self.push(Value::in_freg(dest));
        Ok(())
    }

    fn emit_float_neg(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let src = value.freg();
        let dest = if self.fregs.is_exclusively_held(src) {
            let _ = value.into_storage();
            src
        } else {
            let fresh = self.fregs.allocate()?;
            self.destroy(value);
            fresh
        };

        self.masm.asm.vneg_f32(dest.into(), src.into());
        self.push(Value::in_freg(dest));
        Ok(())
    }

    fn emit_double_neg(&mut self) -> Result<(), CompileError> {
        // the sign bit of a double lives in its most significant word, so
        // negating that single is enough
        let value = self.pop_materialized()?;
        let (first, second) = value.fpair();

        let (dest_first, dest_second) =
            if self.fregs.is_exclusively_held(first) && self.fregs.is_exclusively_held(second) {
                let _ = value.into_storage();
                (first, second)
            } else {
                let (fresh_first, fresh_second) = self.fregs.allocate_pair()?;
                // copy both halves before releasing the source
                self.masm.asm.vmov_rs(REG_SCRATCH.into(), first.into());
                self.masm.asm.vmov_sr(fresh_first.into(), REG_SCRATCH.into());
                self.masm.asm.vmov_rs(REG_SCRATCH.into(), second.into());
                self.masm.asm.vmov_sr(fresh_second.into(), REG_SCRATCH.into());
                self.destroy(value);
                (fresh_first, fresh_second)
            };

        let result = Value::in_fpair(dest_first, dest_second);
        let msw = result.msw_freg();
        self.masm.asm.vneg_f32(msw.into(), msw.into());
        self.push(result);
        Ok(())
    }

    fn emit_i2f(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let reg = value.reg();
        let freg = self.fregs.allocate()?;

        self.masm.asm.vmov_sr(freg.into(), reg.into());
        self.masm.asm.vcvt_f32_s32(freg.into(), freg.into());

        self.destroy(value);
        self.push(Value::in_freg(freg));
        Ok(())
    }

    fn emit_f2i(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let src = value.freg();
        let reg = self.regs.allocate()?;

        // round toward zero per the Java semantics; convert in a scratch
        // single when the source is aliased
        if self.fregs.is_exclusively_held(src) {
            self.masm.asm.vcvt_s32_f32(src.into(), src.into());
            self.masm.asm.vmov_rs(reg.into(), src.into());
            self.destroy(value);
        } else {
            let scratch = self.fregs.allocate()?;
            self.masm.asm.vcvt_s32_f32(scratch.into(), src.into());
            self.masm.asm.vmov_rs(reg.into(), scratch.into());
            self.fregs.dereference(scratch);
            self.destroy(value);
        }

        self.push(Value::in_reg(BasicType::Int, reg));
        Ok(())
    }

    // comparisons

    fn emit_lcmp(&mut self) -> Result<(), CompileError> {
        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;
        let dest = self.regs.allocate()?;

        let done = self.masm.create_label();

        self.masm.load_int_const(dest, 0);
        self.masm.asm.cmp_reg(lhs.msw_reg().into(), rhs.msw_reg().into());
        self.masm.asm.mvn_imm_cond(Cond::Lt, dest.into(), 0);
        self.masm.asm.mov_imm_cond(Cond::Gt, dest.into(), 1);
        self.masm.jump_if(Cond::Ne, done);

        self.masm.asm.cmp_reg(lhs.lsw_reg().into(), rhs.lsw_reg().into());
        self.masm.asm.mvn_imm_cond(Cond::Cc, dest.into(), 0);
        self.masm.asm.mov_imm_cond(Cond::Hi, dest.into(), 1);

        self.masm.bind_label(done);

        self.destroy(lhs);
        self.destroy(rhs);
        self.push(Value::in_reg(BasicType::Int, dest));
        Ok(())
    }

    fn emit_fcmp(&mut self, greater_on_nan: bool) -> Result<(), CompileError> {
        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;
        let dest = self.regs.allocate()?;

        self.masm.asm.vcmp_f32(lhs.freg().into(), rhs.freg().into());
        self.masm.asm.vmrs_flags();

        self.masm.load_int_const(dest, 0);
        self.masm.asm.mvn_imm_cond(Cond::Mi, dest.into(), 0);
        self.masm.asm.mov_imm_cond(Cond::Gt, dest.into(), 1);

        if greater_on_nan {
            self.masm.asm.mov_imm_cond(Cond::Vs, dest.into(), 1);
        } else {
            self.masm.asm.mvn_imm_cond(Cond::Vs, dest.into(), 0);
        }

        self.destroy(lhs);
        self.destroy(rhs);
        self.push(Value::in_reg(BasicType::Int, dest));
        Ok(())
    }

    // branches

    fn emit_branch(&mut self, cond: Option<Cond>, target: u32) -> Result<(), CompileError> {
        self.flush_stack()?;
        self.record_branch_shape(target)?;

        let lbl = self.target_label(target);
        match cond {
            Some(cond) => self.masm.jump_if(cond, lbl),
            None => {
                self.masm.jump(lbl);
                self.discard_stack();
                self.fallthrough = false;
            }
        }

        Ok(())
    }

    fn emit_if_zero(&mut self, cond: Cond, target: u32) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let reg = value.reg();
        self.flush_stack()?;
        self.masm.asm.cmp_imm(reg.into(), 0);
        self.destroy(value);

        self.record_branch_shape(target)?;
        let lbl = self.target_label(target);
        self.masm.jump_if(cond, lbl);
        Ok(())
    }

    fn emit_if_icmp(&mut self, cond: Cond, target: u32) -> Result<(), CompileError> {
        let rhs = self.pop();
        let lhs = self.pop();

        let cond = if rhs.is_immediate()
            && arm::is_encodable_imm(rhs.immediate_i32() as u32)
        {
            let lhs = self.materialize(lhs)?;
            self.flush_stack()?;
            self.masm
                .asm
                .cmp_imm(lhs.reg().into(), rhs.immediate_i32() as u32);
            self.destroy(lhs);
            let _ = rhs.into_storage();
            cond
        } else if lhs.is_immediate() && arm::is_encodable_imm(lhs.immediate_i32() as u32) {
            // compare with swapped operands, so the branch sense reverses
            let rhs = self.materialize(rhs)?;
            self.flush_stack()?;
            self.masm
                .asm
                .cmp_imm(rhs.reg().into(), lhs.immediate_i32() as u32);
            self.destroy(rhs);
            let _ = lhs.into_storage();
            cond.reverse()
        } else {
            let rhs = self.materialize(rhs)?;
            let lhs = self.materialize(lhs)?;
            self.flush_stack()?;
            self.masm.asm.cmp_reg(lhs.reg().into(), rhs.reg().into());
            self.destroy(lhs);
            self.destroy(rhs);
            cond
        };

        self.record_branch_shape(target)?;
        let lbl = self.target_label(target);
        self.masm.jump_if(cond, lbl);
        Ok(())
    }

    fn emit_if_acmp(&mut self, cond: Cond, target: u32) -> Result<(), CompileError> {
        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;
        self.flush_stack()?;
        self.masm.asm.cmp_reg(lhs.reg().into(), rhs.reg().into());
        self.destroy(lhs);
        self.destroy(rhs);

        self.record_branch_shape(target)?;
        let lbl = self.target_label(target);
        self.masm.jump_if(cond, lbl);
        Ok(())
    }

    fn emit_goto(&mut self, target: u32) -> Result<(), CompileError> {
        self.emit_branch(None, target)
    }

    // switches

    fn emit_table_switch(
        &mut self,
        reader: &mut BytecodeReader<'_>,
    ) -> Result<(), CompileError> {
        reader.align_to_u32();
        let default_offset = reader.read_i32();
        let low = reader.read_i32();
        let high = reader.read_i32();
        let count = (high as i64 - low as i64 + 1) as usize;

        if count > MAX_SWITCH_CASES {
            return Err(CompileError::SwitchTooLarge(MAX_SWITCH_CASES));
        }

        let base = self.current_bci;
        let default_target = (base as i64 + default_offset as i64) as u32;
        let mut case_targets = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = reader.read_i32();
            case_targets.push((base as i64 + offset as i64) as u32);
        }

        let index = self.pop_materialized()?;
        let index_reg = self.writable_int(index)?;
        self.flush_stack()?;

        if low != 0 {
            let magnitude = low.unsigned_abs();
            if arm::is_encodable_imm(magnitude) {
                if low > 0 {
                    self.masm.asm.sub_imm(index_reg.into(), index_reg.into(), magnitude);
                } else {
                    self.masm.asm.add_imm(index_reg.into(), index_reg.into(), magnitude);
                }
            } else {
                let spare = self.regs.spare()?;
                self.masm.load_int_const(*spare, low);
                self.masm
                    .asm
                    .sub_reg(index_reg.into(), index_reg.into(), spare.reg().into());
            }
        }

        self.record_branch_shape(default_target)?;
        for &target in &case_targets {
            self.record_branch_shape(target)?;
        }

        let default_lbl = self.target_label(default_target);
        self.masm.asm.cmp_imm(index_reg.into(), count as u32);
        self.masm.jump_if(Cond::Cs, default_lbl);

        // dispatch: pc reads two words ahead, so the table starts right
        // after the filler slot
        self.masm.asm.add_shift_imm(
            arm::REG_PC,
            arm::REG_PC,
            index_reg.into(),
            Shift::Lsl,
            2,
        );
        self.masm.jump(default_lbl);

        for &target in &case_targets {
            let lbl = self.target_label(target);
            self.masm.jump(lbl);
        }

        self.regs.dereference(index_reg);
        self.discard_stack();
        self.fallthrough = false;
        Ok(())
    }

    fn emit_lookup_switch(
        &mut self,
        reader: &mut BytecodeReader<'_>,
    ) -> Result<(), CompileError> {
        reader.align_to_u32();
        let default_offset = reader.read_i32();
        let npairs = reader.read_i32() as usize;

        if npairs > MAX_SWITCH_CASES {
            return Err(CompileError::SwitchTooLarge(MAX_SWITCH_CASES));
        }

        let base = self.current_bci;
        let default_target = (base as i64 + default_offset as i64) as u32;
        let mut pairs = Vec::with_capacity(npairs);
        for _ in 0..npairs {
            let key = reader.read_i32();
            let offset = reader.read_i32();
            pairs.push((key, (base as i64 + offset as i64) as u32));
        }

        let index = self.pop_materialized()?;
        let index_reg = index.reg();
        self.flush_stack()?;

        self.record_branch_shape(default_target)?;

        for &(key, target) in &pairs {
            if arm::is_encodable_imm(key as u32) {
                self.masm.asm.cmp_imm(index_reg.into(), key as u32);
            } else if key < 0 && arm::is_encodable_imm(key.unsigned_abs()) {
                self.masm.asm.cmn_imm(index_reg.into(), key.unsigned_abs());
            } else {
                let spare = self.regs.spare()?;
                self.masm.load_int_const(*spare, key);
                self.masm.asm.cmp_reg(index_reg.into(), spare.reg().into());
            }

            self.record_branch_shape(target)?;
            let lbl = self.target_label(target);
            self.masm.jump_if(Cond::Eq, lbl);
        }

        let default_lbl = self.target_label(default_target);
        self.masm.jump(default_lbl);

        self.destroy(index);
        self.discard_stack();
        self.fallthrough = false;
        Ok(())
    }

    // returns

    fn emit_return_word(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let reg = value.reg();

        if reg != REG_RESULT {
            self.masm.asm.mov_reg(REG_RESULT.into(), reg.into());
        }

        self.destroy(value);
        self.discard_stack();
        self.masm.epilog();
        self.fallthrough = false;
        Ok(())
    }

    fn emit_return_long(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let (first, second) = value.pair();

        self.move_word_pair(first, second, REG_RESULT, REG_RESULT2);

        self.destroy(value);
        self.discard_stack();
        self.masm.epilog();
        self.fallthrough = false;
        Ok(())
    }

    fn move_word_pair(&mut self, src_first: Reg, src_second: Reg, dst_first: Reg, dst_second: Reg) {
        if src_first == dst_second && src_second == dst_first {
            // full swap through the scratch register
            self.masm.asm.mov_reg(REG_SCRATCH.into(), src_first.into());
            self.masm.asm.mov_reg(dst_second.into(), src_second.into());
            self.masm.asm.mov_reg(dst_first.into(), REG_SCRATCH.into());
            return;
        }

        if src_second == dst_first {
            // move the second word first so it is not clobbered
            if src_second != dst_second {
                self.masm.asm.mov_reg(dst_second.into(), src_second.into());
            }
            if src_first != dst_first {
                self.masm.asm.mov_reg(dst_first.into(), src_first.into());
            }
        } else {
            if src_first != dst_first {
                self.masm.asm.mov_reg(dst_first.into(), src_first.into());
            }
            if src_second != dst_second {
                self.masm.asm.mov_reg(dst_second.into(), src_second.into());
            }
        }
    }

    fn emit_return_float(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        self.masm.asm.vmov_rs(REG_RESULT.into(), value.freg().into());
        self.destroy(value);
        self.discard_stack();
        self.masm.epilog();
        self.fallthrough = false;
        Ok(())
    }

    fn emit_return_double(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let (first, second) = value.fpair();
        self.masm.asm.vmov_rs(REG_RESULT.into(), first.into());
        self.masm.asm.vmov_rs(REG_RESULT2.into(), second.into());
        self.destroy(value);
        self.discard_stack();
        self.masm.epilog();
        self.fallthrough = false;
        Ok(())
    }

    // field access

    fn field_entry(&self, idx: u16) -> Result<(i32, BasicType), CompileError> {
        match *self.method.const_pool(idx) {
            ConstPoolEntry::InstanceField { offset, ty } => Ok((offset, ty)),
            _ => panic!("constant pool entry {} is not an instance field", idx),
        }
    }

    fn static_entry(&self, idx: u16) -> Result<(Address, BasicType), CompileError> {
        match *self.method.const_pool(idx) {
            ConstPoolEntry::StaticField { address, ty } => {
                Ok((Address::from(address as u32), ty))
            }
            _ => panic!("constant pool entry {} is not a static field", idx),
        }
    }

    fn emit_null_check(&mut self, reg: Reg) {
        self.masm.asm.cmp_imm(reg.into(), 0);
        self.masm.bailout_if(Cond::Eq, Trap::NullPointer);
    }

    fn emit_getfield(&mut self, idx: u16) -> Result<(), CompileError> {
        let (offset, ty) = self.field_entry(idx)?;
        let object = self.pop_materialized()?;
        self.emit_null_check(object.reg());

        let mut addr = SymbolicAddress::field(object, offset);

        match ty {
            BasicType::Int | BasicType::Object | BasicType::Array => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
                let dest = self.regs.allocate()?;
                self.emit_load_word(operand, dest);
                self.push(Value::in_reg(ty, dest));
            }

            BasicType::Long => {
                let first = self.regs.allocate()?;
                let second = self.regs.allocate()?;
                let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
                self.emit_load_word(operand, first);
                let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Word)?;
                self.emit_load_word(operand, second);
                self.push(Value::in_pair(ty, first, second));
            }

            BasicType::Float => {
                let freg = self.fregs.allocate()?;
                let operand = self.resolve(&mut addr, 0, AccessWidth::Extended)?;
                self.emit_load_ext(operand, freg);
                self.push(Value::in_freg(freg));
            }

            BasicType::Double => {
                let (first, second) = self.fregs.allocate_pair()?;
                let operand = self.resolve(&mut addr, 0, AccessWidth::Extended)?;
                self.emit_load_ext(operand, first);
                let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Extended)?;
                self.emit_load_ext(operand, second);
                self.push(Value::in_fpair(first, second));
            }
        }

        addr.destroy(&self.regs, &mut self.fregs);
        Ok(())
    }

    fn emit_putfield(&mut self, idx: u16) -> Result<(), CompileError> {
        let (offset, ty) = self.field_entry(idx)?;
        let value = self.pop_materialized()?;
        let object = self.pop_materialized()?;
        self.emit_null_check(object.reg());

        let mut addr = SymbolicAddress::field(object, offset);

        match ty {
            BasicType::Int => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
                self.emit_store_word(operand, value.reg());
            }

            BasicType::Object | BasicType::Array => {
                addr.write_barrier_prolog(&mut self.masm, &self.regs, &mut self.fregs)?;
                let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
                self.emit_store_word(operand, value.reg());
                addr.write_barrier_epilog(&mut self.masm, &self.regs, self.entries)?;
            }

            BasicType::Long => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
                self.emit_store_word(operand, value.pair().0);
                let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Word)?;
                self.emit_store_word(operand, value.pair().1);
            }

            BasicType::Float => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Extended)?;
                self.emit_store_ext(operand, value.freg());
            }

            BasicType::Double => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Extended)?;
                self.emit_store_ext(operand, value.fpair().0);
                let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Extended)?;
                self.emit_store_ext(operand, value.fpair().1);
            }
        }

        self.destroy(value);
        addr.destroy(&self.regs, &mut self.fregs);
        Ok(())
    }

    fn emit_getstatic(&mut self, idx: u16) -> Result<(), CompileError> {
        let (cell, ty) = self.static_entry(idx)?;
        let base = self.regs.spare()?;
        self.masm.load_pool_address(*base, cell);

        match ty {
            BasicType::Int | BasicType::Object | BasicType::Array => {
                let dest = self.regs.allocate()?;
                self.masm.asm.ldr_imm(dest.into(), base.reg().into(), 0);
                self.push(Value::in_reg(ty, dest));
            }
            BasicType::Long => {
                let first = self.regs.allocate()?;
                let second = self.regs.allocate()?;
                self.masm.asm.ldr_imm(first.into(), base.reg().into(), 0);
                self.masm.asm.ldr_imm(second.into(), base.reg().into(), WORD_SIZE);
                self.push(Value::in_pair(ty, first, second));
            }
            BasicType::Float => {
                let freg = self.fregs.allocate()?;
                self.masm.asm.vldr(freg.into(), base.reg().into(), 0);
                self.push(Value::in_freg(freg));
            }
            BasicType::Double => {
                let (first, second) = self.fregs.allocate_pair()?;
                self.masm.asm.vldr(first.into(), base.reg().into(), 0);
                self.masm.asm.vldr(second.into(), base.reg().into(), WORD_SIZE);
                self.push(Value::in_fpair(first, second));
            }
        }

        Ok(())
    }

    fn emit_putstatic(&mut self, idx: u16) -> Result<(), CompileError> {
        let (cell, ty) = self.static_entry(idx)?;
        let value = self.pop_materialized()?;
        let base = self.regs.spare()?;
        self.masm.load_pool_address(*base, cell);

        match value.storage() {
            Storage::Reg(reg) => {
                self.masm.asm.str_imm(reg.into(), base.reg().into(), 0);
            }
            Storage::Pair(first, second) => {
                self.masm.asm.str_imm(first.into(), base.reg().into(), 0);
                self.masm.asm.str_imm(second.into(), base.reg().into(), WORD_SIZE);
            }
            Storage::FReg(freg) => {
                self.masm.asm.vstr(freg.into(), base.reg().into(), 0);
            }
            Storage::FPair(first, second) => {
                self.masm.asm.vstr(first.into(), base.reg().into(), 0);
                self.masm.asm.vstr(second.into(), base.reg().into(), WORD_SIZE);
            }
            _ => unreachable!(),
        }

        let _ = ty;
        self.destroy(value);
        Ok(())
    }

    // array access

    fn emit_bounds_check(&mut self, array: Reg, index: &Value) -> Result<(), CompileError> {
        let length = self.regs.spare()?;
        self.masm
            .asm
            .ldr_imm(length.reg().into(), array.into(), ARRAY_LENGTH_OFFSET);

        if index.is_immediate() && arm::is_encodable_imm(index.immediate_i32() as u32) {
            // operands arrive swapped: in bounds means length > index
            let in_bounds = Cond::Hi;
            self.masm
                .asm
                .cmp_imm(length.reg().into(), index.immediate_i32() as u32);
            self.masm.bailout_if(in_bounds.negate(), Trap::ArrayIndexOutOfBounds);
        } else {
            let in_bounds = Cond::Cc;
            self.masm.asm.cmp_reg(index.reg().into(), length.reg().into());
            self.masm.bailout_if(in_bounds.negate(), Trap::ArrayIndexOutOfBounds);
        }

        Ok(())
    }

    fn pop_array_and_index(&mut self) -> Result<(Value, Value), CompileError> {
        let index = self.pop();
        let index = if index.is_immediate() {
            index
        } else {
            self.materialize(index)?
        };
        let array = self.pop_materialized()?;

        self.emit_null_check(array.reg());
        self.emit_bounds_check(array.reg(), &index)?;
        Ok((array, index))
    }

    fn emit_array_load(
        &mut self,
        ty: BasicType,
        width: AccessWidth,
        shift: u8,
    ) -> Result<(), CompileError> {
        let (array, index) = self.pop_array_and_index()?;
        let mut addr = SymbolicAddress::array_element(array, index, shift);

        let operand = self.resolve(&mut addr, 0, width)?;

        if width == AccessWidth::Extended {
            let freg = self.fregs.allocate()?;
            self.emit_load_ext(operand, freg);
            addr.destroy(&self.regs, &mut self.fregs);
            self.push(Value::in_freg(freg));
            return Ok(());
        }

        let dest = self.regs.allocate()?;

        match width {
            AccessWidth::Word => self.emit_load_word(operand, dest),
            AccessWidth::SignedByte => {
                if operand.pre_index {
                    self.masm
                        .asm
                        .ldrsb_pre(dest.into(), operand.base.into(), operand.offset);
                } else {
                    self.masm
                        .asm
                        .ldrsb_imm(dest.into(), operand.base.into(), operand.offset);
                }
            }
            AccessWidth::Half => {
                if operand.pre_index {
                    self.masm
                        .asm
                        .ldrh_pre(dest.into(), operand.base.into(), operand.offset);
                } else {
                    self.masm
                        .asm
                        .ldrh_imm(dest.into(), operand.base.into(), operand.offset);
                }
            }
            AccessWidth::SignedHalf => {
                if operand.pre_index {
                    self.masm
                        .asm
                        .ldrsh_pre(dest.into(), operand.base.into(), operand.offset);
                } else {
                    self.masm
                        .asm
                        .ldrsh_imm(dest.into(), operand.base.into(), operand.offset);
                }
            }
            AccessWidth::Extended | AccessWidth::Byte => {
                unreachable!("array loads sign- or zero-extend")
            }
        }

        addr.destroy(&self.regs, &mut self.fregs);
        self.push(Value::in_reg(ty, dest));
        Ok(())
    }

    fn emit_array_load_wide(&mut self, ty: BasicType) -> Result<(), CompileError> {
        let (array, index) = self.pop_array_and_index()?;
        let mut addr = SymbolicAddress::array_element(array, index, 3);

        if ty == BasicType::Long {
            let first = self.regs.allocate()?;
            let second = self.regs.allocate()?;
            let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
            self.emit_load_word(operand, first);
            let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Word)?;
            self.emit_load_word(operand, second);
            self.push(Value::in_pair(ty, first, second));
        } else {
            let (first, second) = self.fregs.allocate_pair()?;
            let operand = self.resolve(&mut addr, 0, AccessWidth::Extended)?;
            self.emit_load_ext(operand, first);
            let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Extended)?;
            self.emit_load_ext(operand, second);
            self.push(Value::in_fpair(first, second));
        }

        addr.destroy(&self.regs, &mut self.fregs);
        Ok(())
    }

    fn emit_array_store(&mut self, width: AccessWidth, shift: u8) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let (array, index) = self.pop_array_and_index()?;
        let mut addr = SymbolicAddress::array_element(array, index, shift);

        let operand = self.resolve(&mut addr, 0, width)?;

        match width {
            AccessWidth::Word => self.emit_store_word(operand, value.reg()),
            AccessWidth::Byte => {
                if operand.pre_index {
                    self.masm
                        .asm
                        .strb_pre(value.reg().into(), operand.base.into(), operand.offset);
                } else {
                    self.masm
                        .asm
                        .strb_imm(value.reg().into(), operand.base.into(), operand.offset);
                }
            }
            AccessWidth::Half => {
                if operand.pre_index {
                    self.masm
                        .asm
                        .strh_pre(value.reg().into(), operand.base.into(), operand.offset);
                } else {
                    self.masm
                        .asm
                        .strh_imm(value.reg().into(), operand.base.into(), operand.offset);
                }
            }
            AccessWidth::Extended => self.emit_store_ext(operand, value.freg()),
            _ => unreachable!("stores use the unsigned forms"),
        }

        self.destroy(value);
        addr.destroy(&self.regs, &mut self.fregs);
        Ok(())
    }

    fn emit_array_store_wide(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let (array, index) = self.pop_array_and_index()?;
        let mut addr = SymbolicAddress::array_element(array, index, 3);

        match value.storage() {
            Storage::Pair(first, second) => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
                self.emit_store_word(operand, first);
                let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Word)?;
                self.emit_store_word(operand, second);
            }
            Storage::FPair(first, second) => {
                let operand = self.resolve(&mut addr, 0, AccessWidth::Extended)?;
                self.emit_store_ext(operand, first);
                let operand = self.resolve(&mut addr, WORD_SIZE, AccessWidth::Extended)?;
                self.emit_store_ext(operand, second);
            }
            _ => unreachable!(),
        }

        self.destroy(value);
        addr.destroy(&self.regs, &mut self.fregs);
        Ok(())
    }

    fn emit_array_store_object(&mut self) -> Result<(), CompileError> {
        let value = self.pop_materialized()?;
        let (array, index) = self.pop_array_and_index()?;
        let mut addr = SymbolicAddress::array_element(array, index, 2);

        addr.write_barrier_prolog(&mut self.masm, &self.regs, &mut self.fregs)?;
        let operand = self.resolve(&mut addr, 0, AccessWidth::Word)?;
        self.emit_store_word(operand, value.reg());
        addr.write_barrier_epilog(&mut self.masm, &self.regs, self.entries)?;

        self.destroy(value);
        addr.destroy(&self.regs, &mut self.fregs);
        Ok(())
    }

    fn emit_array_length(&mut self) -> Result<(), CompileError> {
        let array = self.pop_materialized()?;
        self.emit_null_check(array.reg());

        // writable_int leaves the array pointer in dest either way
        let dest = self.writable_int(array)?;
        self.masm
            .asm
            .ldr_imm(dest.into(), dest.into(), ARRAY_LENGTH_OFFSET);
        self.push(Value::in_reg(BasicType::Int, dest));
        Ok(())
    }

    // invocation

    fn method_ref(&self, idx: u16) -> MethodId {
        match *self.method.const_pool(idx) {
            ConstPoolEntry::Method(id) => id,
            _ => panic!("constant pool entry {} is not a method", idx),
        }
    }

    fn class_token(&mut self, idx: u16) -> Result<i32, CompileError> {
        match *self.method.const_pool(idx) {
            ConstPoolEntry::Class(id) => Ok(id.idx() as i32),
            _ => panic!("constant pool entry {} is not a class", idx),
        }
    }

    fn pop_arguments(&mut self, word_count: u32) -> Result<Vec<Value>, CompileError> {
        self.flush_stack()?;

        let mut taken = 0;
        let mut split = self.stack.len();
        while taken < word_count {
            split -= 1;
            taken += self.stack[split].ty().word_count() as u32;
        }
        assert!(taken == word_count, "argument words straddle a value");

        Ok(self.stack.drain(split..).collect())
    }

    fn marshal_arguments(&mut self, args: &[Value]) -> Result<(), CompileError> {
        let mut word = 0usize;

        for value in args {
            let words = value.ty().word_count();
            if word + words > JAVA_ARG_REGS.len() {
                return Err(CompileError::TooManyArguments);
            }

            match value.storage() {
                Storage::Spilled(pos) => {
                    for idx in 0..words {
                        self.masm.asm.ldr_imm(
                            JAVA_ARG_REGS[word + idx].into(),
                            REG_FP.into(),
                            self.spill_offset(pos + idx as u32),
                        );
                    }
                }
                Storage::Immediate => {
                    if value.ty().is_wide() {
                        let bits = value.immediate_i64() as u64;
                        let (hi, lo) = ((bits >> 32) as i32, bits as i32);
                        let msw_first = if value.ty() == BasicType::Long {
                            LONG_MSW_FIRST
                        } else {
                            DOUBLE_MSW_FIRST
                        };
                        let (first, second) = if msw_first { (hi, lo) } else { (lo, hi) };
                        self.masm.load_int_const(JAVA_ARG_REGS[word], first);
                        self.masm.load_int_const(JAVA_ARG_REGS[word + 1], second);
                    } else if value.ty().is_reference() && value.immediate_i64() != 0 {
                        self.masm.load_pool_object(
                            JAVA_ARG_REGS[word],
                            Address::from(value.immediate_i64() as u32),
                        );
                    } else {
                        self.masm
                            .load_int_const(JAVA_ARG_REGS[word], value.immediate_i64() as i32);
                    }
                }
                other => panic!("unflushed argument value: {:?}", other),
            }

            word += words;
        }

        Ok(())
    }

    fn release_arguments(&mut self, args: Vec<Value>) {
        for value in args {
            let _ = value.into_storage();
        }
    }

    /// `invokestatic`/`invokespecial`: the callee is statically bound.
    /// When its native entry is known the call is a direct `bl` with a
    /// branch relocation; otherwise it goes through the callee's method
    /// block, which the maintenance interface patches later.
    fn emit_invoke_direct(&mut self, idx: u16) -> Result<(), CompileError> {
        let callee_id = self.method_ref(idx);
        self.emit_invoke_direct_id(callee_id)
    }

    fn emit_invoke_virtual(&mut self, idx: u16) -> Result<(), CompileError> {
        let callee_id = self.method_ref(idx);
        let callee = self.program.method(callee_id);

        // final/private targets bind statically
        if callee.is_statically_bound() {
            return self.emit_invoke_direct_id(callee_id);
        }

        let vtable_index = match callee.kind {
            javelin_bytecode::MethodKind::Virtual { vtable_index } => vtable_index,
            _ => unreachable!(),
        };

        let args = self.pop_arguments(callee.param_words)?;
        self.marshal_arguments(&args)?;
        self.release_arguments(args);

        let slot_offset = (vtable_index as i32) * WORD_SIZE;
        if !crate::cpu::fits_mode2(slot_offset) {
            return Err(CompileError::UnencodableImmediate);
        }

        // receiver is argument word 0
        self.emit_null_check(JAVA_ARG_REGS[0]);
        self.masm.asm.ldr_imm(
            REG_SCRATCH.into(),
            JAVA_ARG_REGS[0].into(),
            VTABLE_OFFSET,
        );
        self.masm
            .asm
            .ldr_imm(REG_SCRATCH.into(), REG_SCRATCH.into(), slot_offset);
        self.masm.asm.blx_reg(REG_SCRATCH.into());

        self.push_call_result(callee.return_type)
    }

    fn emit_invoke_direct_id(&mut self, callee_id: MethodId) -> Result<(), CompileError> {
        let callee = self.program.method(callee_id);
        let args = self.pop_arguments(callee.param_words)?;
        self.marshal_arguments(&args)?;
        self.release_arguments(args);

        if let Some(entry) = (self.compiled_entry)(callee_id) {
            self.masm.direct_call(entry);
        } else {
            let block = (self.method_block)(callee_id);
            // classic two-instruction indirect call: the bridge receives
            // the block address in the scratch register, and the `ldr pc`
            // word is exactly what later gets patched into a direct `bl`
            self.masm.load_pool_address(REG_SCRATCH, block);
            self.masm.asm.mov_reg(arm::REG_LR, arm::REG_PC);
            self.masm
                .asm
                .ldr_imm(arm::REG_PC, REG_SCRATCH.into(), 0);
        }

        self.push_call_result(callee.return_type)
    }

    fn emit_invoke_interface(&mut self, idx: u16) -> Result<(), CompileError> {
        let callee_id = self.method_ref(idx);
        let callee = self.program.method(callee_id);

        let itable_index = match callee.kind {
            javelin_bytecode::MethodKind::Interface { itable_index } => itable_index,
            _ => unreachable!(),
        };

        let args = self.pop_arguments(callee.param_words)?;
        self.marshal_arguments(&args)?;
        self.release_arguments(args);

        self.emit_null_check(JAVA_ARG_REGS[0]);

        // the lookup helper maps (receiver, itable index) to the entry in
        // the scratch register; the index travels outside the argument
        // registers
        self.masm
            .load_int_const(REG_ITABLE_INDEX, itable_index as i32);
        self.masm.call_runtime(self.entries.itable_lookup);
        self.masm.asm.blx_reg(REG_SCRATCH.into());

        self.push_call_result(callee.return_type)
    }

    fn marshal_and_call_with_extra(
        &mut self,
        entry: Address,
        first_arg: Value,
        extra: i32,
    ) -> Result<(), CompileError> {
        self.marshal_arguments(std::slice::from_ref(&first_arg))?;
        self.masm.load_int_const(JAVA_ARG_REGS[1], extra);
        let _ = first_arg.into_storage();
        self.masm.call_runtime(entry);
        Ok(())
    }

    // memory access helpers

    fn resolve(
        &mut self,
        addr: &mut SymbolicAddress,
        extra: i32,
        width: AccessWidth,
    ) -> Result<MemOperand, CompileError> {
        addr.resolve(
            &mut self.masm,
            &self.regs,
            &mut self.fregs,
            extra,
            width,
            self.flags.preindex_extended,
        )
    }

    fn emit_load_word(&mut self, operand: MemOperand, dest: Reg) {
        if operand.pre_index {
            self.masm
                .asm
                .ldr_pre(dest.into(), operand.base.into(), operand.offset);
        } else {
            self.masm
                .asm
                .ldr_imm(dest.into(), operand.base.into(), operand.offset);
        }
    }

    fn emit_store_word(&mut self, operand: MemOperand, src: Reg) {
        if operand.pre_index {
            self.masm
                .asm
                .str_pre(src.into(), operand.base.into(), operand.offset);
        } else {
            self.masm
                .asm
                .str_imm(src.into(), operand.base.into(), operand.offset);
        }
    }

    fn emit_load_ext(&mut self, operand: MemOperand, dest: crate::cpu::FReg) {
        if operand.pre_index {
            self.masm
                .asm
                .vldr_pre(dest.into(), operand.base.into(), operand.offset);
        } else {
            self.masm
                .asm
                .vldr(dest.into(), operand.base.into(), operand.offset);
        }
    }

    fn emit_store_ext(&mut self, operand: MemOperand, src: crate::cpu::FReg) {
        if operand.pre_index {
            self.masm
                .asm
                .vstr_pre(src.into(), operand.base.into(), operand.offset);
        } else {
            self.masm
                .asm
                .vstr(src.into(), operand.base.into(), operand.offset);
        }
    }

    // branch-target scan

    fn scan_targets(&mut self) -> Result<(), CompileError> {
        use BytecodeOpcode::*;

        let mut targets = HashSet::new();
        let mut reader = BytecodeReader::new(&self.method.code);

        while !reader.is_done() {
            let bci = reader.pos();
            let op = reader.read_opcode();

            match op {
                IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfICmpEq | IfICmpNe | IfICmpLt
                | IfICmpGe | IfICmpGt | IfICmpLe | IfACmpEq | IfACmpNe | IfNull | IfNonNull
                | Goto | Jsr => {
                    if op == Jsr {
                        return Err(CompileError::UnsupportedBytecode(op));
                    }
                    let offset = reader.read_i16() as i32;
                    targets.insert((bci as i64 + offset as i64) as u32);
                }

                GotoW => {
                    let offset = reader.read_i32();
                    targets.insert((bci as i64 + offset as i64) as u32);
                }

                TableSwitch => {
                    reader.align_to_u32();
                    let default_offset = reader.read_i32();
                    let low = reader.read_i32();
                    let high = reader.read_i32();
                    targets.insert((bci as i64 + default_offset as i64) as u32);
                    for _ in 0..(high as i64 - low as i64 + 1) {
                        let offset = reader.read_i32();
                        targets.insert((bci as i64 + offset as i64) as u32);
                    }
                }

                LookupSwitch => {
                    reader.align_to_u32();
                    let default_offset = reader.read_i32();
                    let npairs = reader.read_i32();
                    targets.insert((bci as i64 + default_offset as i64) as u32);
                    for _ in 0..npairs {
                        let _key = reader.read_i32();
                        let offset = reader.read_i32();
                        targets.insert((bci as i64 + offset as i64) as u32);
                    }
                }

                Wide | Ret | InvokeDynamic | MultiANewArray | DupX2 | Dup2X1 | Dup2X2 | JsrW => {
                    return Err(CompileError::UnsupportedBytecode(op));
                }

                _ => {
                    skip_bytecode(&mut reader, op, bci)?;
                }
            }
        }

        for target in targets {
            let lbl = self.masm.create_label();
            self.targets.insert(target, lbl);
        }

        Ok(())
    }
}

fn branch_target(reader: &mut BytecodeReader<'_>, bci: u32) -> u32 {
    let offset = reader.read_i16() as i32;
    (bci as i64 + offset as i64) as u32
}

fn skip_bytecode(
    reader: &mut BytecodeReader<'_>,
    op: BytecodeOpcode,
    bci: u32,
) -> Result<(), CompileError> {
    use BytecodeOpcode::*;

    match op {
        TableSwitch => {
            reader.align_to_u32();
            let _default = reader.read_i32();
            let low = reader.read_i32();
            let high = reader.read_i32();
            for _ in 0..(high as i64 - low as i64 + 1) {
                let _ = reader.read_i32();
            }
        }

        LookupSwitch => {
            reader.align_to_u32();
            let _default = reader.read_i32();
            let npairs = reader.read_i32();
            for _ in 0..npairs {
                let _ = reader.read_i32();
                let _ = reader.read_i32();
            }
        }

        Wide => return Err(CompileError::UnsupportedBytecode(op)),

        _ => {
            let width = javelin_bytecode::operand_width(op)
                .ok_or(CompileError::UnsupportedBytecode(op))?;
            reader.set_pos(bci + 1 + width as u32);
        }
    }

    Ok(())
}

fn op_load_type(op: BytecodeOpcode) -> BasicType {
    use BytecodeOpcode::*;

    match op {
        ILoad => BasicType::Int,
        LLoad => BasicType::Long,
        FLoad => BasicType::Float,
        DLoad => BasicType::Double,
        ALoad => BasicType::Object,
        _ => unreachable!(),
    }
}

fn cond_for_if(op: BytecodeOpcode) -> Cond {
    use BytecodeOpcode::*;

    match op {
        IfEq => Cond::Eq,
        IfNe => Cond::Ne,
        IfLt => Cond::Lt,
        IfGe => Cond::Ge,
        IfGt => Cond::Gt,
        IfLe => Cond::Le,
        _ => unreachable!(),
    }
}

fn cond_for_icmp(op: BytecodeOpcode) -> Cond {
    use BytecodeOpcode::*;

    match op {
        IfICmpEq => Cond::Eq,
        IfICmpNe => Cond::Ne,
        IfICmpLt => Cond::Lt,
        IfICmpGe => Cond::Ge,
        IfICmpGt => Cond::Gt,
        IfICmpLe => Cond::Le,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_op_positions() {
        // dispatch tables elsewhere index by these exact values
        assert_eq!(BinaryOp::Add as usize, 0);
        assert_eq!(BinaryOp::Sub as usize, 1);
        assert_eq!(BinaryOp::Mul as usize, 2);
        assert_eq!(BinaryOp::Div as usize, 3);
        assert_eq!(BinaryOp::Rem as usize, 4);
        assert_eq!(BinaryOp::Shl as usize, 5);
        assert_eq!(BinaryOp::Shr as usize, 6);
        assert_eq!(BinaryOp::Ushr as usize, 7);
        assert_eq!(BinaryOp::And as usize, 8);
        assert_eq!(BinaryOp::Or as usize, 9);
        assert_eq!(BinaryOp::Xor as usize, 10);
        assert_eq!(BinaryOp::Min as usize, 11);
        assert_eq!(BinaryOp::Max as usize, 12);
        assert_eq!(BinaryOp::Rsb as usize, 13);
    }

    #[test]
    fn test_dp_table_alignment() {
        // every operator with a plain data-processing form has its
        // emitter at the matching position
        for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::And, BinaryOp::Or, BinaryOp::Xor, BinaryOp::Rsb] {
            assert!(INT_DP_TABLE[op as usize].is_some());
        }
        for op in [BinaryOp::Mul, BinaryOp::Div, BinaryOp::Rem, BinaryOp::Shl, BinaryOp::Min] {
            assert!(INT_DP_TABLE[op as usize].is_none());
        }
    }
}

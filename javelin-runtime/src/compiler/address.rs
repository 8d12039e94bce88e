use javelin_asm::arm::Shift;
use javelin_bytecode::ARRAY_DATA_OFFSET;

use crate::compiler::regalloc::{FloatAllocator, RegisterAllocator};
use crate::compiler::value::Value;
use crate::compiler::CompileError;
use crate::cpu::{fits_mode2, fits_mode3, fits_mode5, Reg, CARD_SHIFT, REG_FP};
use crate::masm::MacroAssembler;
use crate::vm::RuntimeEntries;

/// Access width of one load or store. Each width maps to one hardware
/// addressing mode with its own signed-immediate range; the three ranges
/// are checked independently and never conflated.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AccessWidth {
    /// unsigned byte (mode 2)
    Byte,
    /// sign-extending byte load (mode 3)
    SignedByte,
    /// halfword, zero- or sign-extending (mode 3)
    Half,
    SignedHalf,
    /// word (mode 2)
    Word,
    /// coprocessor/VFP transfer (mode 5)
    Extended,
}

impl AccessWidth {
    pub fn fits(self, offset: i32) -> bool {
        match self {
            AccessWidth::Byte | AccessWidth::Word => fits_mode2(offset),
            AccessWidth::SignedByte | AccessWidth::Half | AccessWidth::SignedHalf => {
                fits_mode3(offset)
            }
            AccessWidth::Extended => fits_mode5(offset),
        }
    }

    fn is_extended(self) -> bool {
        self == AccessWidth::Extended
    }
}

/// A legalized memory operand: base register plus an encodable
/// immediate. With `pre_index` set the access folds the offset into the
/// base register as a side effect.
#[derive(Copy, Clone, Debug)]
pub struct MemOperand {
    pub base: Reg,
    pub offset: i32,
    pub pre_index: bool,
}

enum AddressKind {
    Field { offset: i32 },
    ArrayElement { shift: u8 },
    FrameSlot { offset: i32 },
}

/// Per-address-computation flag set: allocated address register, and
/// whether the symbolic base offset has already been folded into it.
struct AddressState {
    address_reg: Option<Reg>,
    base_offset_included: bool,
    pending_offset: i32,
}

/// A symbolic memory location before legalization: an object field, an
/// array element, or a frame slot. Owns the base/index values handed to
/// it; they are released exactly once, after address-register
/// materialization (or at teardown when no register was needed).
pub struct SymbolicAddress {
    kind: AddressKind,
    base: Option<Value>,
    index: Option<Value>,
    state: AddressState,
}

impl SymbolicAddress {
    pub fn field(base: Value, offset: i32) -> SymbolicAddress {
        // the base object must already be materialized
        let _ = base.reg();

        SymbolicAddress {
            kind: AddressKind::Field { offset },
            base: Some(base),
            index: None,
            state: AddressState::new(),
        }
    }

    pub fn array_element(base: Value, index: Value, shift: u8) -> SymbolicAddress {
        let _ = base.reg();
        assert!(index.is_immediate() || !index.is_spilled());

        SymbolicAddress {
            kind: AddressKind::ArrayElement { shift },
            base: Some(base),
            index: Some(index),
            state: AddressState::new(),
        }
    }

    pub fn frame_slot(offset: i32) -> SymbolicAddress {
        SymbolicAddress {
            kind: AddressKind::FrameSlot { offset },
            base: None,
            index: None,
            state: AddressState::new(),
        }
    }

    /// Statically known offset from the base register, when there is one
    /// (variable array indices have none).
    pub fn fixed_offset(&self) -> Option<i32> {
        match self.kind {
            AddressKind::Field { offset } => Some(offset),
            AddressKind::FrameSlot { offset } => Some(offset),
            AddressKind::ArrayElement { shift } => {
                let index = self.index.as_ref().expect("index consumed");
                if index.is_immediate() {
                    Some(ARRAY_DATA_OFFSET + (index.immediate_i32() << shift))
                } else {
                    None
                }
            }
        }
    }

    pub fn base_reg(&self) -> Reg {
        match self.kind {
            AddressKind::FrameSlot { .. } => REG_FP,
            _ => self.base.as_ref().expect("base consumed").reg(),
        }
    }

    pub fn has_address_reg(&self) -> bool {
        self.state.address_reg.is_some()
    }

    /// Legalize this address for one access of the given width at
    /// `extra_offset` beyond the element/field itself (used for the
    /// second word of a wide value).
    ///
    /// Direct encoding is preferred; otherwise a dedicated address
    /// register is materialized once and reused. For plain (non-extended)
    /// accesses at extra offset zero with an unfolded base offset, a
    /// pre-indexed operand folds the offset for free; the extended form
    /// only does this when `preindex_extended` is set (disabled by
    /// default, see `CompilerFlags`).
    pub fn resolve(
        &mut self,
        masm: &mut MacroAssembler,
        regs: &RegisterAllocator,
        fregs: &mut FloatAllocator,
        extra_offset: i32,
        width: AccessWidth,
        preindex_extended: bool,
    ) -> Result<MemOperand, CompileError> {
        if self.state.address_reg.is_none() {
            if let Some(fixed) = self.fixed_offset() {
                let total = fixed + extra_offset;

                if width.fits(total) {
                    return Ok(MemOperand {
                        base: self.base_reg(),
                        offset: total,
                        pre_index: false,
                    });
                }
            }

            self.materialize(masm, regs, fregs)?;
        }

        let address_reg = self.state.address_reg.expect("just materialized");
        let pending = if self.state.base_offset_included {
            0
        } else {
            self.state.pending_offset
        };

        let total = pending + extra_offset;

        if width.fits(total) {
            let fold_allowed = !width.is_extended() || preindex_extended;

            if extra_offset == 0 && pending != 0 && fold_allowed {
                self.state.base_offset_included = true;
                return Ok(MemOperand {
                    base: address_reg,
                    offset: pending,
                    pre_index: true,
                });
            }

            return Ok(MemOperand {
                base: address_reg,
                offset: total,
                pre_index: false,
            });
        }

        // fold the pending part into the register, then the extra offset
        // must be encodable on its own
        self.fold_pending(masm, address_reg, pending);

        if width.fits(extra_offset) {
            Ok(MemOperand {
                base: address_reg,
                offset: extra_offset,
                pre_index: false,
            })
        } else {
            Err(CompileError::UnencodableImmediate)
        }
    }

    fn fold_pending(&mut self, masm: &mut MacroAssembler, address_reg: Reg, pending: i32) {
        if pending != 0 {
            add_offset(masm, address_reg, address_reg, pending);
        }
        self.state.base_offset_included = true;
    }

    /// Compute `base + fixed_part` into a dedicated address register and
    /// release the base/index values; runs at most once per address.
    fn materialize(
        &mut self,
        masm: &mut MacroAssembler,
        regs: &RegisterAllocator,
        fregs: &mut FloatAllocator,
    ) -> Result<(), CompileError> {
        debug_assert!(self.state.address_reg.is_none());

        let address_reg = regs.allocate()?;

        match self.kind {
            AddressKind::ArrayElement { shift } => {
                let index = self.index.as_ref().expect("index consumed");

                if index.is_immediate() {
                    let total = ARRAY_DATA_OFFSET + (index.immediate_i32() << shift);
                    add_offset(masm, address_reg, self.base_reg(), total);
                    self.state.base_offset_included = true;
                    self.state.pending_offset = 0;
                } else {
                    masm.asm.add_shift_imm(
                        address_reg.into(),
                        self.base_reg().into(),
                        index.reg().into(),
                        Shift::Lsl,
                        shift as u32,
                    );
                    self.state.base_offset_included = false;
                    self.state.pending_offset = ARRAY_DATA_OFFSET;
                }
            }

            AddressKind::Field { offset } => {
                add_offset(masm, address_reg, self.base_reg(), offset);
                self.state.base_offset_included = true;
                self.state.pending_offset = 0;
            }

            AddressKind::FrameSlot { offset } => {
                add_offset(masm, address_reg, REG_FP, offset);
                self.state.base_offset_included = true;
                self.state.pending_offset = 0;
            }
        }

        self.state.address_reg = Some(address_reg);

        // the address register carries everything needed from here on
        if let Some(base) = self.base.take() {
            base.destroy(regs, fregs);
        }
        if let Some(index) = self.index.take() {
            index.destroy(regs, fregs);
        }

        Ok(())
    }

    /// Before an object-reference store: make sure an address register
    /// exists so the barrier epilogue has the written-to address.
    pub fn write_barrier_prolog(
        &mut self,
        masm: &mut MacroAssembler,
        regs: &RegisterAllocator,
        fregs: &mut FloatAllocator,
    ) -> Result<(), CompileError> {
        if self.state.address_reg.is_none() {
            self.materialize(masm, regs, fregs)?;
        }

        Ok(())
    }

    /// After the store: mark the card covering the written address.
    /// Requires the base offset to be folded in already (the store's
    /// pre-indexed form does that). Takes three scratch registers and
    /// releases all four.
    pub fn write_barrier_epilog(
        &mut self,
        masm: &mut MacroAssembler,
        regs: &RegisterAllocator,
        entries: &RuntimeEntries,
    ) -> Result<(), CompileError> {
        let address_reg = self
            .state
            .address_reg
            .expect("write_barrier_epilog before prolog");
        assert!(
            self.state.base_offset_included || self.state.pending_offset == 0,
            "barrier epilogue requires the folded address"
        );

        let card_base = regs.allocate()?;
        let card_index = regs.allocate()?;
        let zero = regs.allocate()?;

        masm.load_pool_address(card_base, entries.card_table);
        masm.asm.mov_shift_imm(
            card_index.into(),
            address_reg.into(),
            Shift::Lsr,
            CARD_SHIFT,
        );
        masm.asm.mov_imm(zero.into(), 0);
        masm.asm.strb_reg(
            zero.into(),
            card_base.into(),
            card_index.into(),
            Shift::Lsl,
            0,
        );

        regs.dereference(zero);
        regs.dereference(card_index);
        regs.dereference(card_base);
        regs.dereference(address_reg);
        self.state.address_reg = None;

        Ok(())
    }

    /// Release everything still held. Safe to call whether or not an
    /// address register was materialized.
    pub fn destroy(mut self, regs: &RegisterAllocator, fregs: &mut FloatAllocator) {
        if let Some(base) = self.base.take() {
            base.destroy(regs, fregs);
        }
        if let Some(index) = self.index.take() {
            index.destroy(regs, fregs);
        }
        if let Some(address_reg) = self.state.address_reg.take() {
            regs.dereference(address_reg);
        }
    }
}

impl AddressState {
    fn new() -> AddressState {
        AddressState {
            address_reg: None,
            base_offset_included: false,
            pending_offset: 0,
        }
    }
}

/// `dest = base + offset` for arbitrary 32-bit offsets: single
/// `add`/`sub` when the immediate has a rotated encoding, constant
/// materialization otherwise.
fn add_offset(masm: &mut MacroAssembler, dest: Reg, base: Reg, offset: i32) {
    use javelin_asm::arm::is_encodable_imm;

    if offset == 0 {
        if dest != base {
            masm.asm.mov_reg(dest.into(), base.into());
        }
    } else if offset > 0 && is_encodable_imm(offset as u32) {
        masm.asm.add_imm(dest.into(), base.into(), offset as u32);
    } else if offset < 0 && is_encodable_imm(offset.unsigned_abs()) {
        masm.asm.sub_imm(dest.into(), base.into(), offset.unsigned_abs());
    } else {
        assert!(dest != base);
        masm.load_int_const(dest, offset);
        masm.asm.add_reg(dest.into(), dest.into(), base.into());
    }
}

use byteorder::{ByteOrder, LittleEndian};

use javelin_asm::arm::{self, Assembler, Cond};
pub use javelin_asm::Label;

use crate::code::{CommentTable, RelocationKind};
use crate::compiler::CompileError;
use crate::cpu::{FReg, Reg, REG_SCRATCH};
use crate::gc::Address;
use crate::vm::RuntimeEntries;

/// Conditions that divert execution to a shared out-of-line sequence at
/// the end of the method. Each trap calls the matching runtime throw
/// entry and never returns.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Trap {
    NullPointer,
    ArrayIndexOutOfBounds,
}

/// Finished translation of one method, ready for installation: literal
/// pool (addressed below the first instruction), code, relocation
/// entries and direct-call fixups. All offsets are relative to the
/// content start (the first pool byte); the first instruction sits at
/// `pool_size`.
pub struct CodeDescriptor {
    pub pool: Vec<u8>,
    pub code: Vec<u8>,
    pub relocations: Vec<(u32, RelocationKind)>,
    /// (content offset of the `bl` word, absolute callee entry)
    pub call_sites: Vec<(u32, Address)>,
    pub comments: CommentTable,
}

impl CodeDescriptor {
    pub fn pool_size(&self) -> u32 {
        self.pool.len() as u32
    }

    pub fn total_content_size(&self) -> u32 {
        (self.pool.len() + self.code.len()) as u32
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum PoolValue {
    /// plain data word (integer or float bits), no relocation
    Word(u32),
    /// address of a runtime entry, static cell or descriptor
    Addr(u32),
    /// address of a heap object the collector may move
    Obj(u32),
}

struct Pool {
    entries: Vec<(i32, PoolValue)>,
    size: i32,
}

impl Pool {
    fn new() -> Pool {
        Pool {
            entries: Vec::new(),
            size: 0,
        }
    }

    /// Displacement of `value`, reusing an existing slot when the same
    /// word is already pooled. Displacements grow away from the code.
    fn add(&mut self, value: PoolValue) -> i32 {
        for &(disp, existing) in &self.entries {
            if existing == value {
                return disp;
            }
        }

        self.size += 4;
        self.entries.push((self.size, value));
        self.size
    }

    /// Byte offset of the entry with displacement `disp`, measured from
    /// the pool start.
    fn offset_of(&self, disp: i32) -> u32 {
        debug_assert!(disp > 0 && disp <= self.size);
        (self.size - disp) as u32
    }

    fn emit(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.size as usize, 0);

        for &(disp, value) in &self.entries {
            let at = start + self.offset_of(disp) as usize;
            let word = match value {
                PoolValue::Word(w) | PoolValue::Addr(w) | PoolValue::Obj(w) => w,
            };
            LittleEndian::write_u32(&mut out[at..at + 4], word);
        }
    }
}

#[derive(Copy, Clone)]
enum WhichPool {
    Object,
    Data,
}

#[derive(Copy, Clone)]
enum PoolLoadKind {
    Core(Reg),
    Float(FReg),
}

struct PoolLoad {
    code_pos: u32,
    which: WhichPool,
    disp: i32,
    kind: PoolLoadKind,
}

/// Assembler wrapper owning everything a method translation accumulates
/// beside raw instructions: the two literal pools (object words first,
/// then data words, both placed below the method's first instruction),
/// forward jumps, relocation and comment records, trap sequences and
/// direct-call fixup sites.
pub struct MacroAssembler {
    pub asm: Assembler,
    object_pool: Pool,
    data_pool: Pool,
    pool_loads: Vec<PoolLoad>,
    bailouts: Vec<(Label, Trap)>,
    code_relocs: Vec<(u32, RelocationKind)>,
    direct_calls: Vec<(u32, Address)>,
    comments: Vec<(u32, String)>,
    emit_comments: bool,
}

impl MacroAssembler {
    pub fn new(emit_comments: bool) -> MacroAssembler {
        MacroAssembler {
            asm: Assembler::new(),
            object_pool: Pool::new(),
            data_pool: Pool::new(),
            pool_loads: Vec::new(),
            bailouts: Vec::new(),
            code_relocs: Vec::new(),
            direct_calls: Vec::new(),
            comments: Vec::new(),
            emit_comments,
        }
    }

    pub fn pos(&self) -> u32 {
        self.asm.position() as u32
    }

    pub fn create_label(&mut self) -> Label {
        self.asm.create_label()
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.asm.create_and_bind_label()
    }

    pub fn bind_label(&mut self, lbl: Label) {
        self.asm.bind_label(lbl);
    }

    pub fn jump(&mut self, lbl: Label) {
        self.asm.b(lbl);
    }

    pub fn jump_if(&mut self, cond: Cond, lbl: Label) {
        self.asm.b_cond(cond, lbl);
    }

    pub fn emit_comment(&mut self, comment: String) {
        if self.emit_comments {
            self.comments.push((self.pos(), comment));
        }
    }

    /// Load a 32-bit constant: `mov`/`mvn` when the value has a rotated
    /// encoding, a literal-pool word otherwise.
    pub fn load_int_const(&mut self, dest: Reg, value: i32) {
        let bits = value as u32;

        if arm::is_encodable_imm(bits) {
            self.asm.mov_imm(dest.into(), bits);
        } else if arm::is_encodable_imm(!bits) {
            self.asm.mvn_imm(dest.into(), !bits);
        } else {
            self.load_pool(WhichPool::Data, PoolValue::Word(bits), PoolLoadKind::Core(dest));
        }
    }

    /// Embed a non-heap address (runtime entry, static cell, method
    /// block) and load it; recorded as an address-reference relocation.
    pub fn load_pool_address(&mut self, dest: Reg, addr: Address) {
        self.load_pool(
            WhichPool::Data,
            PoolValue::Addr(addr.to_u32()),
            PoolLoadKind::Core(dest),
        );
    }

    /// Embed a heap object address; recorded as an object-reference
    /// relocation the collector visits.
    pub fn load_pool_object(&mut self, dest: Reg, addr: Address) {
        self.load_pool(
            WhichPool::Object,
            PoolValue::Obj(addr.to_u32()),
            PoolLoadKind::Core(dest),
        );
    }

    pub fn load_float_const(&mut self, dest: FReg, bits: u32) {
        self.load_pool(WhichPool::Data, PoolValue::Word(bits), PoolLoadKind::Float(dest));
    }

    fn load_pool(&mut self, which: WhichPool, value: PoolValue, kind: PoolLoadKind) {
        let pool = match which {
            WhichPool::Object => &mut self.object_pool,
            WhichPool::Data => &mut self.data_pool,
        };
        let disp = pool.add(value);

        let code_pos = self.pos();

        // placeholder; the real pc-relative displacement is known once
        // both pool sizes are final
        match kind {
            PoolLoadKind::Core(reg) => self.asm.ldr_imm(reg.into(), arm::R15, 0),
            PoolLoadKind::Float(freg) => self.asm.vldr(freg.into(), arm::R15, 0),
        }

        self.pool_loads.push(PoolLoad {
            code_pos,
            which,
            disp,
            kind,
        });
    }

    /// Direct `bl` to a callee whose entry address is statically known.
    /// The displacement is fixed up at installation time (the method's
    /// own base address is unknown here) and a branch relocation entry
    /// keeps the site adjustable when the callee moves.
    pub fn direct_call(&mut self, target: Address) {
        let pos = self.pos();
        self.asm.bl_imm(0);
        self.code_relocs.push((pos, RelocationKind::Branch));
        self.direct_calls.push((pos, target));
    }

    /// Call a runtime entry through the literal pool; entries live
    /// outside branch range, so the call goes through the scratch
    /// register.
    pub fn call_runtime(&mut self, entry: Address) {
        self.load_pool_address(REG_SCRATCH, entry);
        self.asm.blx_reg(REG_SCRATCH.into());
    }

    /// Patch point: a `nop` recorded in the relocation table so later
    /// instrumentation can rewrite it.
    pub fn emit_checkpoint(&mut self) {
        let pos = self.pos();
        self.code_relocs.push((pos, RelocationKind::Checkpoint));
        self.asm.nop();
    }

    pub fn emit_bailout(&mut self, lbl: Label, trap: Trap) {
        self.bailouts.push((lbl, trap));
    }

    pub fn bailout_if(&mut self, cond: Cond, trap: Trap) {
        let lbl = self.create_label();
        self.jump_if(cond, lbl);
        self.emit_bailout(lbl, trap);
    }

    /// Build the frame: save lr/fp, establish fp, carve the local area.
    pub fn prolog(&mut self, framesize: i32) -> Result<(), CompileError> {
        assert!(framesize >= 0 && framesize % 4 == 0);

        self.asm.str_pre(arm::REG_LR, arm::REG_SP, -4);
        self.asm.str_pre(crate::cpu::REG_FP.into(), arm::REG_SP, -4);
        self.asm.mov_reg(crate::cpu::REG_FP.into(), arm::REG_SP);

        if framesize > 0 {
            if !arm::is_encodable_imm(framesize as u32) {
                return Err(CompileError::UnencodableImmediate);
            }
            self.asm.sub_imm(arm::REG_SP, arm::REG_SP, framesize as u32);
        }

        Ok(())
    }

    pub fn epilog(&mut self) {
        self.asm.mov_reg(arm::REG_SP, crate::cpu::REG_FP.into());
        self.asm.ldr_post(crate::cpu::REG_FP.into(), arm::REG_SP, 4);
        self.asm.ldr_post(arm::REG_PC, arm::REG_SP, 4);
    }

    fn emit_bailouts(&mut self, entries: &RuntimeEntries) {
        let bailouts = std::mem::replace(&mut self.bailouts, Vec::new());

        for (lbl, trap) in &bailouts {
            self.bind_label(*lbl);
            self.emit_comment(format!("trap {:?}", trap));
            self.call_runtime(entries.trap_entry(*trap));
        }

        // nop after the trap calls so a return address at the method end
        // still maps into this method
        if bailouts.len() > 0 {
            self.asm.nop();
        }
    }

    fn resolve_pool_loads(&mut self) -> Result<(), CompileError> {
        let data_size = self.data_pool.size;
        let loads = std::mem::replace(&mut self.pool_loads, Vec::new());

        let end = self.asm.position();

        for load in loads {
            // entry address relative to the first instruction: data pool
            // words sit directly below it, object words below those
            let below = match load.which {
                WhichPool::Object => data_size + load.disp,
                WhichPool::Data => load.disp,
            };
            let offset = -(below + load.code_pos as i32 + 8);

            let fits = match load.kind {
                PoolLoadKind::Core(_) => crate::cpu::fits_mode2(offset),
                PoolLoadKind::Float(_) => crate::cpu::fits_mode5(offset),
            };

            if !fits {
                return Err(CompileError::LiteralPoolOverflow);
            }

            self.asm.set_position(load.code_pos as usize);

            match load.kind {
                PoolLoadKind::Core(reg) => self.asm.ldr_imm(reg.into(), arm::R15, offset),
                PoolLoadKind::Float(freg) => self.asm.vldr(freg.into(), arm::R15, offset),
            }
        }

        self.asm.set_position(end);
        Ok(())
    }

    /// Finish the translation: emit trap sequences, fix pool-relative
    /// loads, resolve forward jumps and lay out pool + relocations.
    pub fn code(mut self, entries: &RuntimeEntries) -> Result<CodeDescriptor, CompileError> {
        self.emit_bailouts(entries);
        self.resolve_pool_loads()?;

        let object_size = self.object_pool.size as u32;
        let pool_size = object_size + self.data_pool.size as u32;

        let mut pool = Vec::with_capacity(pool_size as usize);
        self.object_pool.emit(&mut pool);
        self.data_pool.emit(&mut pool);

        let mut relocations = Vec::new();

        // object references first, each group in ascending offset order
        let mut object_offsets: Vec<u32> = self
            .object_pool
            .entries
            .iter()
            .map(|&(disp, _)| self.object_pool.offset_of(disp))
            .collect();
        object_offsets.sort_unstable();

        for offset in object_offsets {
            relocations.push((offset, RelocationKind::ObjectRef));
        }

        let mut addr_offsets: Vec<u32> = self
            .data_pool
            .entries
            .iter()
            .filter(|&&(_, value)| matches!(value, PoolValue::Addr(_)))
            .map(|&(disp, _)| object_size + self.data_pool.offset_of(disp))
            .collect();
        addr_offsets.sort_unstable();

        for offset in addr_offsets {
            relocations.push((offset, RelocationKind::AddressRef));
        }

        let mut code_relocs = self.code_relocs;
        code_relocs.sort_by_key(|&(offset, _)| offset);

        for (offset, kind) in code_relocs {
            relocations.push((pool_size + offset, kind));
        }

        let call_sites = self
            .direct_calls
            .into_iter()
            .map(|(offset, target)| (pool_size + offset, target))
            .collect();

        let mut comments = CommentTable::new();
        for (offset, comment) in self.comments {
            comments.insert(pool_size + offset, comment);
        }

        let code = self.asm.finalize();

        Ok(CodeDescriptor {
            pool,
            code,
            relocations,
            call_sites,
            comments,
        })
    }
}

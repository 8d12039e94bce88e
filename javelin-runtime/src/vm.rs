use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use javelin_asm::arm::{decode_branch, encode_branch, Cond};
use javelin_bytecode::{MethodId, Program};

use crate::code::{
    CommentTable, CompiledMethod, RelocationKind, RelocationTable, CODE_ALIGNMENT, HEADER_SIZE,
    MAX_METHOD_SIZE,
};
use crate::code_space::MethodSpace;
use crate::compiler::codegen::CodeGen;
use crate::compiler::CompileError;
use crate::cpu::flush_icache;
use crate::gc::{Address, HeapAccess};
use crate::masm::{CodeDescriptor, Trap};
use crate::method_cache::{CodeId, MethodCache};
use crate::patch::PatchTable;

/// Device-space layout defaults: per-method blocks below the method
/// space proper.
const BLOCK_SPACE_BASE: u32 = 0x0008_0000;
const METHOD_SPACE_BASE: u32 = 0x0010_0000;
const METHOD_SPACE_SIZE: usize = 256 * 1024;

#[derive(Clone)]
pub struct CompilerFlags {
    /// retain per-offset comment records on compiled methods
    pub emit_comments: bool,
    /// pre-indexed addressing for the extended (coprocessor) access
    /// form; architecturally available but disabled pending a decision,
    /// the plain-form folding is always on
    pub preindex_extended: bool,
    /// emit a checkpoint patch point after each method prolog
    pub entry_checkpoints: bool,
}

impl Default for CompilerFlags {
    fn default() -> CompilerFlags {
        CompilerFlags {
            emit_comments: false,
            preindex_extended: false,
            entry_checkpoints: false,
        }
    }
}

/// Addresses of the runtime's entry points, provided by the embedder.
/// Emitted code reaches them through literal-pool words recorded as
/// address-reference relocations.
#[derive(Clone)]
pub struct RuntimeEntries {
    /// execution entry of not-yet-compiled methods; every method block
    /// initially points here
    pub interpreter_bridge: Address,

    pub alloc_object: Address,
    pub alloc_array: Address,
    pub monitor_enter: Address,
    pub monitor_exit: Address,
    pub throw_exception: Address,
    pub throw_null_pointer: Address,
    pub throw_array_index: Address,
    pub checkcast: Address,
    pub instance_of: Address,
    pub itable_lookup: Address,

    pub idiv: Address,
    pub irem: Address,
    pub lmul: Address,
    pub ldiv: Address,
    pub lrem: Address,
    pub frem: Address,
    pub dadd: Address,
    pub dsub: Address,
    pub dmul: Address,
    pub ddiv: Address,
    pub drem: Address,
    pub dcmpl: Address,
    pub dcmpg: Address,

    pub i2d: Address,
    pub l2f: Address,
    pub l2d: Address,
    pub f2l: Address,
    pub f2d: Address,
    pub d2i: Address,
    pub d2l: Address,
    pub d2f: Address,

    /// base of the collector's card table, used by emitted write
    /// barriers
    pub card_table: Address,
}

impl RuntimeEntries {
    /// All entries spread out from `base`, each on its own 16-byte slot;
    /// convenient for embedders and the test harness.
    pub fn with_base(base: Address) -> RuntimeEntries {
        let mut next = base.to_u32();
        let mut slot = || {
            let addr = Address::from(next);
            next += 16;
            addr
        };

        RuntimeEntries {
            interpreter_bridge: slot(),
            alloc_object: slot(),
            alloc_array: slot(),
            monitor_enter: slot(),
            monitor_exit: slot(),
            throw_exception: slot(),
            throw_null_pointer: slot(),
            throw_array_index: slot(),
            checkcast: slot(),
            instance_of: slot(),
            itable_lookup: slot(),
            idiv: slot(),
            irem: slot(),
            lmul: slot(),
            ldiv: slot(),
            lrem: slot(),
            frem: slot(),
            dadd: slot(),
            dsub: slot(),
            dmul: slot(),
            ddiv: slot(),
            drem: slot(),
            dcmpl: slot(),
            dcmpg: slot(),
            i2d: slot(),
            l2f: slot(),
            l2d: slot(),
            f2l: slot(),
            f2d: slot(),
            d2i: slot(),
            d2l: slot(),
            d2f: slot(),
            card_table: slot(),
        }
    }

    pub fn trap_entry(&self, trap: Trap) -> Address {
        match trap {
            Trap::NullPointer => self.throw_null_pointer,
            Trap::ArrayIndexOutOfBounds => self.throw_array_index,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CompilationStatus {
    Compiled(CodeId),
    NotCompilable,
}

/// Per-method compilation state. Compilation runs one method at a time
/// (cooperative scheduling), so this is a plain memo rather than the
/// condvar-synchronized variant a concurrent compiler would need.
struct CompilationDatabase {
    inner: Mutex<HashMap<MethodId, CompilationStatus>>,
}

impl CompilationDatabase {
    fn new() -> CompilationDatabase {
        CompilationDatabase {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn status(&self, id: MethodId) -> Option<CompilationStatus> {
        self.inner.lock().get(&id).copied()
    }

    fn is_compiled(&self, id: MethodId) -> Option<CodeId> {
        match self.status(id) {
            Some(CompilationStatus::Compiled(code_id)) => Some(code_id),
            _ => None,
        }
    }

    fn finish_compilation(&self, id: MethodId, code_id: CodeId) {
        let old = self
            .inner
            .lock()
            .insert(id, CompilationStatus::Compiled(code_id));
        assert!(old.is_none(), "method compiled twice");
    }

    fn mark_not_compilable(&self, id: MethodId) {
        self.inner
            .lock()
            .insert(id, CompilationStatus::NotCompilable);
    }

    fn forget(&self, id: MethodId) {
        self.inner.lock().remove(&id);
    }
}

/// The compiler backend's owner: program data, the method space and
/// cache, the patch table and the collector handle. Exposes the two
/// in-process surfaces -- `compile_method`, and the patch/unpatch/
/// evict/compact maintenance interface for the method-cache owner.
pub struct Vm {
    pub program: Program,
    pub entries: RuntimeEntries,
    pub flags: CompilerFlags,

    space: MethodSpace,
    blocks: MethodSpace,
    cache: RwLock<MethodCache>,
    patch_table: Mutex<PatchTable>,
    compilation: CompilationDatabase,
    heap: Box<dyn HeapAccess>,
}

impl Vm {
    pub fn new(
        program: Program,
        entries: RuntimeEntries,
        heap: Box<dyn HeapAccess>,
        flags: CompilerFlags,
    ) -> Vm {
        let block_bytes = crate::mem::align_usize(
            (program.methods.len().max(1)) * 4,
            CODE_ALIGNMENT as usize,
        );
        let blocks = MethodSpace::new(Address::from(BLOCK_SPACE_BASE), block_bytes);
        blocks.alloc(block_bytes).expect("block area fits its space");

        let vm = Vm {
            space: MethodSpace::new(Address::from(METHOD_SPACE_BASE), METHOD_SPACE_SIZE),
            blocks,
            cache: RwLock::new(MethodCache::new()),
            patch_table: Mutex::new(PatchTable::new()),
            compilation: CompilationDatabase::new(),
            heap,
            program,
            entries,
            flags,
        };

        for idx in 0..vm.program.methods.len() {
            let block = vm.method_block(MethodId::from(idx));
            vm.blocks
                .write_u32(block, vm.entries.interpreter_bridge.to_u32());
        }

        vm
    }

    pub fn space(&self) -> &MethodSpace {
        &self.space
    }

    pub fn block_space(&self) -> &MethodSpace {
        &self.blocks
    }

    /// Direct access to the patch table for the method-cache owner's
    /// bookkeeping (and the test-suite's assertions).
    pub fn patches(&self) -> parking_lot::MutexGuard<'_, PatchTable> {
        self.patch_table.lock()
    }

    pub fn heap(&self) -> &dyn HeapAccess {
        &*self.heap
    }

    /// Address of the one-word block holding this method's current
    /// execution entry (interpreter bridge until compiled).
    pub fn method_block(&self, id: MethodId) -> Address {
        Address::from(BLOCK_SPACE_BASE + (id.idx() as u32) * 4)
    }

    pub fn method_entry(&self, id: MethodId) -> Address {
        Address::from(self.blocks.read_u32(self.method_block(id)))
    }

    pub fn code_id_for(&self, id: MethodId) -> Option<CodeId> {
        self.compilation.is_compiled(id)
    }

    pub fn compiled_method(&self, id: CodeId) -> Option<Arc<CompiledMethod>> {
        self.cache.read().get(id)
    }

    /// "method containing pc" query; the address must point into a
    /// registered method.
    pub fn find_method(&self, pc: Address) -> CodeId {
        self.cache.read().find(pc)
    }

    /// Translate one verified method. Recoverable failures mark the
    /// method not-compilable (it stays on the interpreter) and are
    /// remembered; nothing already compiled is ever affected.
    pub fn compile_method(&self, id: MethodId) -> Result<CodeId, CompileError> {
        match self.compilation.status(id) {
            Some(CompilationStatus::Compiled(code_id)) => return Ok(code_id),
            Some(CompilationStatus::NotCompilable) => return Err(CompileError::NotCompilable),
            None => {}
        }

        let compiled_entry = |callee: MethodId| -> Option<Address> {
            let code_id = self.compilation.is_compiled(callee)?;
            let method = self.cache.read().get(code_id)?;
            Some(method.instruction_start())
        };
        let method_block = |callee: MethodId| self.method_block(callee);

        let descriptor = match CodeGen::new(
            &self.program,
            id,
            &self.entries,
            &self.flags,
            &compiled_entry,
            &method_block,
        )
        .generate()
        {
            Ok(descriptor) => descriptor,
            Err(err) => {
                log::warn!(
                    "method {} not compilable: {}",
                    self.program.method(id).name,
                    err
                );
                self.compilation.mark_not_compilable(id);
                return Err(err);
            }
        };

        let code_id = self.install(id, descriptor)?;
        self.compilation.finish_compilation(id, code_id);

        let method = self.cache.read().get(code_id).expect("just registered");
        self.blocks.write_u32(
            self.method_block(id),
            method.instruction_start().to_u32(),
        );

        log::debug!(
            "compiled {} at {} ({} bytes)",
            self.program.method(id).name,
            method.object_start(),
            method.total_size()
        );

        Ok(code_id)
    }

    /// Lay the descriptor out in the method space:
    /// header, literal pool, code, packed relocation table.
    fn install(&self, id: MethodId, descriptor: CodeDescriptor) -> Result<CodeId, CompileError> {
        let CodeDescriptor {
            pool,
            code,
            relocations: reloc_entries,
            call_sites,
            comments,
        } = descriptor;

        let relocations = RelocationTable::from_entries(&reloc_entries);
        let pool_size = pool.len() as u32;
        let code_len = code.len() as u32;
        let content_size = pool_size + code_len;
        let total = HEADER_SIZE + content_size + relocations.size_in_bytes();
        let total = crate::mem::align_u32(total, CODE_ALIGNMENT);

        if total >= MAX_METHOD_SIZE {
            return Err(CompileError::OutOfMemory);
        }

        let object_start = match self.space.alloc(total as usize) {
            Some(addr) => addr,
            None => {
                // one compaction pass, then a single retry
                self.compact();
                match self.space.alloc(total as usize) {
                    Some(addr) => addr,
                    None => return Err(CompileError::OutOfMemory),
                }
            }
        };

        let method = Arc::new(CompiledMethod::new(
            object_start,
            total,
            id,
            HEADER_SIZE + pool_size,
            code_len,
            relocations,
            if self.flags.emit_comments {
                comments
            } else {
                CommentTable::new()
            },
        ));

        let header = method.header();
        self.space.write_u32(object_start, header.size_and_flags);
        self.space.write_u32(object_start.offset(4), header.method);
        self.space
            .write_u32(object_start.offset(8), header.entry_offset);
        self.space
            .write_u32(object_start.offset(12), header.reloc_offset);

        let content_start = object_start.offset(HEADER_SIZE);
        self.space.write_bytes(content_start, &pool);
        self.space
            .write_bytes(content_start.offset(pool_size), &code);
        self.space.write_bytes(
            content_start.offset(content_size),
            method.relocations().bytes(),
        );

        // fix up direct calls now that the method's own address is known
        for &(offset, target) in &call_sites {
            let site = content_start.offset(offset);
            let disp = (target.to_u32() as i64 - (site.to_u32() as i64 + 8)) / 4;
            self.space
                .write_u32(site, encode_branch(Cond::Al, true, disp as i32));
        }

        flush_icache(object_start, total as usize);

        Ok(self.cache.write().register(method))
    }

    /// Give back the trailing capacity of an installed method; only
    /// shrinking is supported. The header's size word follows along.
    pub fn reduce_method_size(&self, id: CodeId, new_total: u32) {
        let method = self.cache.read().get(id).expect("method evicted");
        let new_total = crate::mem::align_u32(new_total, CODE_ALIGNMENT);
        let old_total = method.total_size();

        method.reduce_size(new_total);
        self.space
            .shrink(method.object_start(), old_total, new_total);
        self.space
            .write_u32(method.object_start(), method.size_and_flags());
    }

    // maintenance interface for the method-cache owner; called at safe
    // points only

    /// Patch the direct-call site at `site` (currently an indirect call
    /// through the callee's method block) into a direct branch to the
    /// compiled callee, logging it in the patch table.
    pub fn patch_direct_call(&self, site: Address, callee: MethodId) {
        assert!(!self.heap.is_collecting(), "patching during collection");

        let callee_code = match self.compilation.is_compiled(callee) {
            Some(code_id) => code_id,
            None => return,
        };

        let cache = self.cache.read();
        let caller_code = cache.find(site);
        let caller = cache.get(caller_code).expect("caller not registered");
        let callee_method = cache.get(callee_code).expect("callee not registered");

        let original = self.space.read_u32(site);
        self.patch_table.lock().append(
            &self.space,
            site,
            (caller.object_start(), caller_code),
            (callee_method.object_start(), callee_code),
            callee_method.instruction_start(),
            original,
        );
    }

    /// Restore every recently patched call site of `caller`.
    pub fn unpatch_caller(&self, caller: CodeId) {
        assert!(!self.heap.is_collecting(), "patching during collection");

        let base = match self.cache.read().get(caller) {
            Some(method) => method.object_start(),
            None => return,
        };

        self.patch_table.lock().revoke(&self.space, base);
    }

    /// Discard a compiled method. Its patched call sites are restored,
    /// its block reverts to the interpreter bridge, and any live method
    /// holding a compile-time direct branch into it is discarded too
    /// (its code cannot be repaired in place).
    pub fn evict_method(&self, id: CodeId) {
        let mut cache = self.cache.write();
        self.evict_locked(&mut cache, id);
    }

    fn evict_locked(&self, cache: &mut MethodCache, id: CodeId) {
        let victim = match cache.get(id) {
            Some(method) => method,
            None => return,
        };
        let span = victim.span();

        let dependent_callers: Vec<CodeId> = cache
            .live()
            .map(|(_, code_id)| code_id)
            .filter(|&code_id| code_id != id)
            .filter(|&code_id| {
                let method = cache.get(code_id).expect("live entry evicted");
                method.has_branch_relocs() && self.branches_into(&method, span)
            })
            .collect();

        log::debug!(
            "evicting {} at {}",
            self.program.method(victim.method()).name,
            victim.object_start()
        );

        cache.evict(id);

        let mut patch = self.patch_table.lock();
        patch.remove_only(&self.space, victim.object_start());
        patch.remove_caller(&self.space, victim.object_start());
        drop(patch);

        self.blocks.write_u32(
            self.method_block(victim.method()),
            self.entries.interpreter_bridge.to_u32(),
        );
        self.compilation.forget(victim.method());

        for code_id in dependent_callers {
            self.evict_locked(cache, code_id);
        }
    }

    fn branches_into(&self, method: &CompiledMethod, span: crate::gc::Region) -> bool {
        let content = method.object_start().offset(HEADER_SIZE);

        for (offset, kind) in method.relocations().iter() {
            if kind != RelocationKind::Branch {
                continue;
            }

            let site = content.offset(offset);
            let word = self.space.read_u32(site);
            if let Some((_, _, disp)) = decode_branch(word) {
                let target = site.ioffset(8 + disp * 4);
                if span.contains(target) {
                    return true;
                }
            }
        }

        false
    }

    /// Slide all live methods down over the dead space, fixing embedded
    /// object references through the collector, re-encoding direct-call
    /// branches, and driving the patch table's compaction pass.
    pub fn compact(&self) {
        assert!(!self.heap.is_collecting(), "compaction during collection");

        let mut cache = self.cache.write();
        let mut patch = self.patch_table.lock();

        // plan the new layout first; branch fixups need every method's
        // final address
        let mut plan: Vec<(CodeId, Address, Address, u32)> = Vec::new();
        let mut new_top = self.space.total().start;

        for (old, id) in cache.live() {
            let method = cache.get(id).expect("live entry evicted");
            let size = crate::mem::align_u32(method.total_size(), CODE_ALIGNMENT);
            plan.push((id, old, new_top, size));
            new_top = new_top.offset(size);
        }

        // entries referencing evicted methods go away while the old
        // layout (and thus their sites) is still intact
        patch.remove_stale(&self.space, |code_id, base| {
            cache.record_matches(code_id, base)
        });

        let deltas: HashMap<CodeId, i32> = plan
            .iter()
            .map(|&(id, old, new, _)| (id, new.to_u32() as i32 - old.to_u32() as i32))
            .collect();
        let old_ranges: Vec<(Address, Address, i32)> = plan
            .iter()
            .map(|&(id, old, _, size)| (old, old.offset(size), deltas[&id]))
            .collect();

        let mut moved = 0usize;

        for &(id, old, new, size) in &plan {
            if new != old {
                self.space.move_range(old, new, size as usize);
                moved += 1;
            }

            let method = cache.get(id).expect("live entry evicted");
            method.set_object_start(new);

            // both flags clear means there is nothing to fix in the body
            if method.has_object_refs() || method.has_branch_relocs() {
                self.apply_relocations(&method, old, &old_ranges);
            }

            flush_icache(new, size as usize);
        }

        cache.rebuild_table();
        self.space.set_top(new_top);

        // method blocks track the moved entry points
        for (_, id) in cache.live().collect::<Vec<_>>() {
            let method = cache.get(id).expect("live entry evicted");
            self.blocks.write_u32(
                self.method_block(method.method()),
                method.instruction_start().to_u32(),
            );
        }

        patch.adjust_moved(&self.space, |code_id| {
            deltas.get(&code_id).copied().unwrap_or(0)
        });

        log::debug!(
            "compaction moved {} of {} methods, top {}",
            moved,
            plan.len(),
            new_top
        );
    }

    fn apply_relocations(
        &self,
        method: &CompiledMethod,
        old_start: Address,
        old_ranges: &[(Address, Address, i32)],
    ) {
        let new_start = method.object_start();
        let content = new_start.offset(HEADER_SIZE);
        let site_delta = new_start.to_u32() as i32 - old_start.to_u32() as i32;

        for (offset, kind) in method.relocations().iter() {
            let at = content.offset(offset);

            match kind {
                RelocationKind::ObjectRef => {
                    let word = self.space.read_u32(at);
                    let relocated = self.heap.relocate(Address::from(word));
                    if relocated.to_u32() != word {
                        self.space.write_u32(at, relocated.to_u32());
                    }
                }

                RelocationKind::Branch => {
                    let word = self.space.read_u32(at);
                    let (cond, link, disp) =
                        decode_branch(word).expect("branch relocation on a non-branch word");
                    assert!(cond == Cond::Al && link);

                    let old_site = old_start.offset(HEADER_SIZE + offset);
                    let old_target = old_site.ioffset(8 + disp * 4);
                    let target_delta = old_ranges
                        .iter()
                        .find(|&&(start, end, _)| start <= old_target && old_target < end)
                        .map(|&(_, _, delta)| delta)
                        .unwrap_or(0);

                    if target_delta != site_delta {
                        let new_disp = disp + (target_delta - site_delta) / 4;
                        self.space
                            .write_u32(at, encode_branch(Cond::Al, true, new_disp));
                    }
                }

                RelocationKind::AddressRef
                | RelocationKind::Checkpoint
                | RelocationKind::Comment => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_entries_distinct() {
        let entries = RuntimeEntries::with_base(Address::from(0xF000_0000));

        let all = [
            entries.interpreter_bridge,
            entries.alloc_object,
            entries.alloc_array,
            entries.monitor_enter,
            entries.monitor_exit,
            entries.throw_exception,
            entries.throw_null_pointer,
            entries.throw_array_index,
            entries.checkcast,
            entries.instance_of,
            entries.itable_lookup,
            entries.idiv,
            entries.irem,
            entries.lmul,
            entries.ldiv,
            entries.lrem,
            entries.frem,
            entries.dadd,
            entries.dsub,
            entries.dmul,
            entries.ddiv,
            entries.drem,
            entries.dcmpl,
            entries.dcmpg,
            entries.i2d,
            entries.l2f,
            entries.l2d,
            entries.f2l,
            entries.f2d,
            entries.d2i,
            entries.d2l,
            entries.d2f,
            entries.card_table,
        ];

        for (idx, addr) in all.iter().enumerate() {
            for other in &all[idx + 1..] {
                assert_ne!(addr, other);
            }
        }

        assert_eq!(entries.trap_entry(Trap::NullPointer), entries.throw_null_pointer);
    }
}

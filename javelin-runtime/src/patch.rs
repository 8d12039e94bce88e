use javelin_asm::arm::{decode_branch, encode_branch, Cond};

use crate::code_space::MethodSpace;
use crate::gc::Address;
use crate::method_cache::CodeId;

pub const PATCH_TABLE_CAPACITY: usize = 32;

/// One recorded direct-call patch site: the instruction address holds a
/// direct branch to `callee` while the entry is live; clearing the entry
/// restores `original` and flushes that word.
#[derive(Clone, Debug)]
pub struct PatchEntry {
    pub instruction: Address,
    pub caller: Address,
    pub callee: Address,
    pub caller_code: CodeId,
    pub callee_code: CodeId,
    pub original: u32,
}

/// Bounded circular log of patched inter-method call sites. Slots cycle
/// `empty -> active -> (revoked | superseded | adjusted) -> empty`;
/// inserting past capacity first restores the oldest entry.
pub struct PatchTable {
    slots: Vec<Option<PatchEntry>>,
    cursor: usize,
}

impl PatchTable {
    pub fn new() -> PatchTable {
        PatchTable::with_capacity(PATCH_TABLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> PatchTable {
        assert!(capacity > 0);

        PatchTable {
            slots: vec![None; capacity],
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn entry_for_site(&self, instruction: Address) -> Option<&PatchEntry> {
        self.slots
            .iter()
            .flatten()
            .find(|entry| entry.instruction == instruction)
    }

    fn encode_call(site: Address, target: Address) -> u32 {
        // branch displacement is relative to the fetch address two words
        // beyond the instruction
        let disp = (target.to_u32() as i64 - (site.to_u32() as i64 + 8)) / 4;
        encode_branch(Cond::Al, true, disp as i32)
    }

    fn restore(space: &MethodSpace, entry: &PatchEntry) {
        space.patch_instruction(entry.instruction, None, entry.original);
    }

    /// Patch `instruction` to branch directly to `target` (the callee's
    /// first instruction) and log the site. Re-patching the same site to
    /// the same callee is a no-op; to a different callee it rewrites the
    /// branch in place, keeping the originally saved encoding. When the
    /// table is full the oldest entry is restored and reused.
    pub fn append(
        &mut self,
        space: &MethodSpace,
        instruction: Address,
        caller: (Address, CodeId),
        callee: (Address, CodeId),
        target: Address,
        original: u32,
    ) {
        if let Some(existing) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.instruction == instruction)
        {
            if existing.callee == callee.0 {
                return;
            }

            existing.callee = callee.0;
            existing.callee_code = callee.1;
            space.patch_instruction(
                instruction,
                None,
                PatchTable::encode_call(instruction, target),
            );
            return;
        }

        if let Some(oldest) = self.slots[self.cursor].take() {
            log::debug!(
                "patch table full, unpatching call site {}",
                oldest.instruction
            );
            PatchTable::restore(space, &oldest);
        }

        space.patch_instruction(
            instruction,
            Some(original),
            PatchTable::encode_call(instruction, target),
        );

        self.slots[self.cursor] = Some(PatchEntry {
            instruction,
            caller: caller.0,
            callee: callee.0,
            caller_code: caller.1,
            callee_code: callee.1,
            original,
        });
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Unpatch the most recent entries of `caller`, walking backward
    /// from the last insert and stopping at the first entry that is
    /// empty, belongs to someone else, or wraps around.
    pub fn revoke(&mut self, space: &MethodSpace, caller: Address) {
        let capacity = self.slots.len();

        for step in 1..=capacity {
            let idx = (self.cursor + capacity - step) % capacity;

            match &self.slots[idx] {
                Some(entry) if entry.caller == caller => {
                    let entry = self.slots[idx].take().expect("just matched");
                    PatchTable::restore(space, &entry);
                }
                _ => break,
            }
        }
    }

    /// Unpatch every site branching into `callee`; scans the whole
    /// table. Used when a single method is discarded.
    pub fn remove_only(&mut self, space: &MethodSpace, callee: Address) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|entry| entry.callee == callee) == Some(true) {
                let entry = slot.take().expect("just matched");
                PatchTable::restore(space, &entry);
            }
        }
    }

    /// Unpatch every site owned by `caller` (full scan); used when the
    /// caller itself is discarded, where `revoke`'s backward walk would
    /// miss older entries.
    pub fn remove_caller(&mut self, space: &MethodSpace, caller: Address) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|entry| entry.caller == caller) == Some(true) {
                let entry = slot.take().expect("just matched");
                PatchTable::restore(space, &entry);
            }
        }
    }

    /// First half of the compaction pass, run while the old layout is
    /// still in place: drop every entry whose caller or callee no longer
    /// matches the cache record at its remembered index.
    pub fn remove_stale(
        &mut self,
        space: &MethodSpace,
        record_matches: impl Fn(CodeId, Address) -> bool,
    ) {
        for slot in self.slots.iter_mut() {
            let stale = match slot {
                Some(entry) => {
                    !record_matches(entry.caller_code, entry.caller)
                        || !record_matches(entry.callee_code, entry.callee)
                }
                None => false,
            };

            if stale {
                let entry = slot.take().expect("just matched");
                PatchTable::restore(space, &entry);
            }
        }
    }

    /// Second half of the compaction pass, run after live objects moved:
    /// shift each entry by its caller's delta, and when caller and
    /// callee moved by different amounts re-encode the branch
    /// displacement at the (already moved) site.
    pub fn adjust_moved(
        &mut self,
        space: &MethodSpace,
        delta_of: impl Fn(CodeId) -> i32,
    ) {
        for slot in self.slots.iter_mut() {
            let entry = match slot {
                Some(entry) => entry,
                None => continue,
            };

            let caller_delta = delta_of(entry.caller_code);
            let callee_delta = delta_of(entry.callee_code);

            entry.instruction = entry.instruction.ioffset(caller_delta);
            entry.caller = entry.caller.ioffset(caller_delta);
            entry.callee = entry.callee.ioffset(callee_delta);

            if caller_delta != callee_delta {
                let word = space.read_u32(entry.instruction);
                let (cond, link, disp) =
                    decode_branch(word).expect("patched site does not hold a branch");
                assert!(
                    cond == Cond::Al && link,
                    "patched site lost its always-branch encoding"
                );

                let new_disp = disp + (callee_delta - caller_delta) / 4;
                space.patch_instruction(
                    entry.instruction,
                    Some(word),
                    encode_branch(Cond::Al, true, new_disp),
                );
            }
        }
    }
}

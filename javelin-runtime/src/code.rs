use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::gc::{Address, Region};
use javelin_bytecode::MethodId;

pub const CODE_ALIGNMENT: u32 = 16;

/// The size field occupies the low 24 bits of `size_and_flags`.
pub const MAX_METHOD_SIZE: u32 = 1 << 24;

pub const FLAG_HAS_BRANCH_RELOCS: u32 = 1 << 30;
pub const FLAG_HAS_OBJECT_REFS: u32 = 1 << 31;

/// Kinds of relocation entries. `ObjectRef` entries are required to
/// precede every other kind so the collector can stop scanning at the
/// first non-object entry.
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RelocationKind {
    ObjectRef = 0,
    AddressRef = 1,
    Branch = 2,
    Checkpoint = 3,
    Comment = 4,
}

const DELTA_BITS: u32 = 13;
const DELTA_MAX: u32 = (1 << DELTA_BITS) - 1;

/// Relocation table in its packed on-disk form: one little-endian `u16`
/// per entry, kind in the top 3 bits, word-granular offset delta in the
/// low 13. A `Comment` entry doubles as the no-op filler when a delta
/// overflows the field.
pub struct RelocationTable {
    packed: Vec<u8>,
}

impl RelocationTable {
    pub fn new() -> RelocationTable {
        RelocationTable { packed: Vec::new() }
    }

    /// Pack entries given as (byte offset, kind). Offsets must be word
    /// aligned and non-decreasing, with all `ObjectRef` entries first.
    pub fn from_entries(entries: &[(u32, RelocationKind)]) -> RelocationTable {
        let mut packed = Vec::with_capacity(entries.len() * 2);
        let mut last_offset = 0u32;
        let mut seen_non_object = false;

        for &(offset, kind) in entries {
            assert!(offset % 4 == 0, "relocation offset not word aligned");
            assert!(offset >= last_offset, "relocation offsets must not decrease");

            if kind == RelocationKind::ObjectRef {
                assert!(!seen_non_object, "object references must come first");
            } else {
                seen_non_object = true;
            }

            let mut delta = (offset - last_offset) / 4;

            while delta > DELTA_MAX {
                push_u16(&mut packed, pack(RelocationKind::Comment, DELTA_MAX));
                delta -= DELTA_MAX;
            }

            push_u16(&mut packed, pack(kind, delta));
            last_offset = offset;
        }

        RelocationTable { packed }
    }

    pub fn from_bytes(packed: Vec<u8>) -> RelocationTable {
        assert!(packed.len() % 2 == 0);
        RelocationTable { packed }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.packed
    }

    pub fn size_in_bytes(&self) -> u32 {
        self.packed.len() as u32
    }

    pub fn iter(&self) -> RelocationIter<'_> {
        RelocationIter {
            data: &self.packed,
            pos: 0,
            offset: 0,
        }
    }
}

fn pack(kind: RelocationKind, delta: u32) -> u16 {
    debug_assert!(delta <= DELTA_MAX);
    (u8::from(kind) as u16) << DELTA_BITS | delta as u16
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    out.extend_from_slice(&buf);
}

pub struct RelocationIter<'a> {
    data: &'a [u8],
    pos: usize,
    offset: u32,
}

impl<'a> Iterator for RelocationIter<'a> {
    type Item = (u32, RelocationKind);

    fn next(&mut self) -> Option<(u32, RelocationKind)> {
        if self.pos >= self.data.len() {
            return None;
        }

        let raw = LittleEndian::read_u16(&self.data[self.pos..]);
        self.pos += 2;

        let kind = RelocationKind::try_from((raw >> DELTA_BITS) as u8)
            .expect("corrupt relocation table");
        self.offset += ((raw as u32) & DELTA_MAX) * 4;

        Some((self.offset, kind))
    }
}

/// Persisted header at the start of every compiled-method object. The
/// image writer relies on this exact layout.
#[repr(C)]
pub struct MethodHeader {
    pub size_and_flags: u32,
    pub method: u32,
    pub entry_offset: u32,
    pub reloc_offset: u32,
}

pub const HEADER_SIZE: u32 = 16;

const _: () = assert!(std::mem::size_of::<MethodHeader>() == HEADER_SIZE as usize);
const _: () = assert!(HEADER_SIZE % CODE_ALIGNMENT == 0 || CODE_ALIGNMENT % HEADER_SIZE == 0);

/// The persistent compiled-method artifact: header, literal pool, native
/// code, packed relocation table. The pool sits *below* the first
/// instruction and is addressed pc-relative with negative displacements.
/// Objects move during method-space compaction, so the start address and
/// size are interior-mutable; everything else is fixed at installation.
pub struct CompiledMethod {
    object_start: AtomicU32,
    total_size: AtomicU32,
    method: MethodId,
    entry_offset: u32,
    code_len: u32,
    flags: u32,
    relocations: RelocationTable,
    comments: CommentTable,
}

impl CompiledMethod {
    pub fn new(
        object_start: Address,
        total_size: u32,
        method: MethodId,
        entry_offset: u32,
        code_len: u32,
        relocations: RelocationTable,
        comments: CommentTable,
    ) -> CompiledMethod {
        assert!(total_size < MAX_METHOD_SIZE);
        assert!(entry_offset >= HEADER_SIZE);

        let mut flags = 0;

        for (_, kind) in relocations.iter() {
            match kind {
                RelocationKind::Branch => flags |= FLAG_HAS_BRANCH_RELOCS,
                RelocationKind::ObjectRef => flags |= FLAG_HAS_OBJECT_REFS,
                _ => {}
            }
        }

        CompiledMethod {
            object_start: AtomicU32::new(object_start.to_u32()),
            total_size: AtomicU32::new(total_size),
            method,
            entry_offset,
            code_len,
            flags,
            relocations,
            comments,
        }
    }

    pub fn object_start(&self) -> Address {
        Address::from(self.object_start.load(Ordering::Relaxed))
    }

    pub fn object_end(&self) -> Address {
        self.object_start().offset(self.total_size())
    }

    pub fn span(&self) -> Region {
        Region::new(self.object_start(), self.object_end())
    }

    pub fn instruction_start(&self) -> Address {
        self.object_start().offset(self.entry_offset)
    }

    pub fn instruction_end(&self) -> Address {
        self.instruction_start().offset(self.code_len)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.span().contains(addr)
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn entry_offset(&self) -> u32 {
        self.entry_offset
    }

    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    pub fn total_size(&self) -> u32 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn size_and_flags(&self) -> u32 {
        self.total_size() | self.flags
    }

    pub fn has_branch_relocs(&self) -> bool {
        self.flags & FLAG_HAS_BRANCH_RELOCS != 0
    }

    pub fn has_object_refs(&self) -> bool {
        self.flags & FLAG_HAS_OBJECT_REFS != 0
    }

    pub fn relocations(&self) -> &RelocationTable {
        &self.relocations
    }

    pub fn comments_for_offset(&self, offset: u32) -> Vec<&String> {
        self.comments.get(offset)
    }

    /// Compaction moved the object; the registry is responsible for
    /// having copied the bytes first.
    pub(crate) fn set_object_start(&self, addr: Address) {
        self.object_start.store(addr.to_u32(), Ordering::Relaxed);
    }

    /// Give back trailing capacity. Growing is never supported; callers
    /// may only shrink, and the space decides whether the bytes are
    /// actually reclaimable.
    pub fn reduce_size(&self, new_total: u32) {
        let old = self.total_size();
        assert!(new_total <= old, "compiled methods never grow in place");
        self.total_size.store(new_total, Ordering::Relaxed);
    }

    pub fn header(&self) -> MethodHeader {
        MethodHeader {
            size_and_flags: self.size_and_flags(),
            method: self.method.idx() as u32,
            entry_offset: self.entry_offset,
            reloc_offset: self.entry_offset + self.code_len,
        }
    }
}

pub struct CommentTable {
    entries: Vec<(u32, String)>,
}

impl CommentTable {
    pub fn new() -> CommentTable {
        CommentTable {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, offset: u32) -> Vec<&String> {
        let result = self
            .entries
            .binary_search_by_key(&offset, |&(offset, _)| offset);

        match result {
            Ok(mut idx) => {
                while idx > 0 && self.entries[idx - 1].0 == offset {
                    idx -= 1;
                }

                let mut comments = Vec::new();
                while idx < self.entries.len() && self.entries[idx].0 == offset {
                    comments.push(&self.entries[idx].1);
                    idx += 1;
                }
                comments
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn insert(&mut self, offset: u32, comment: String) {
        if let Some(last) = self.entries.last() {
            debug_assert!(offset >= last.0);
        }

        self.entries.push((offset, comment));
    }
}

use std::cell::UnsafeCell;

use parking_lot::Mutex;

use byteorder::{ByteOrder, LittleEndian};

use crate::code::CODE_ALIGNMENT;
use crate::cpu::flush_icache;
use crate::gc::{Address, Region};

pub const K: usize = 1024;

const DEFAULT_SIZE: usize = 1024 * K;

/// Bump-allocated region holding compiled-method objects. Lives at a
/// fixed base in the device address space; the host-side backing buffer
/// is an implementation detail. Freed space is only reclaimed by
/// compaction (sliding all live objects down) or by shrinking the most
/// recent allocation.
pub struct MethodSpace {
    total: Region,
    mutex: Mutex<AllocData>,
    storage: UnsafeCell<Box<[u8]>>,
}

// Mutation is confined to single call paths at safe points (allocation
// under the mutex, patching and compaction from the cache owner).
unsafe impl Sync for MethodSpace {}

struct AllocData {
    top: Address,
    limit: Address,
}

impl MethodSpace {
    pub fn new(base: Address, size: usize) -> MethodSpace {
        assert!(!base.is_null() && size % CODE_ALIGNMENT as usize == 0);

        let alloc_data = AllocData {
            top: base,
            limit: base.offset(size as u32),
        };

        MethodSpace {
            total: Region::new(base, base.offset(size as u32)),
            mutex: Mutex::new(alloc_data),
            storage: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn with_default_size(base: Address) -> MethodSpace {
        MethodSpace::new(base, DEFAULT_SIZE)
    }

    pub fn total(&self) -> Region {
        self.total
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.total.contains(addr)
    }

    /// Allocate `size` bytes rounded up to the minimum granularity.
    /// Returns `None` on exhaustion; the caller may compact and retry.
    pub fn alloc(&self, size: usize) -> Option<Address> {
        debug_assert!(size > 0);

        let mut data = self.mutex.lock();
        let aligned_size = crate::mem::align_usize(size, CODE_ALIGNMENT as usize);

        if data.top.offset(aligned_size as u32) > data.limit {
            return None;
        }

        let object_address = data.top;
        data.top = data.top.offset(aligned_size as u32);
        Some(object_address)
    }

    /// Release the tail of the most recent allocation. For any other
    /// object the freed bytes stay dead until the next compaction.
    pub fn shrink(&self, addr: Address, old_size: u32, new_size: u32) {
        assert!(new_size <= old_size);

        let old_size = crate::mem::align_u32(old_size, CODE_ALIGNMENT);
        let new_size = crate::mem::align_u32(new_size, CODE_ALIGNMENT);

        let mut data = self.mutex.lock();

        if addr.offset(old_size) == data.top {
            data.top = addr.offset(new_size);
        }
    }

    /// Reset the bump pointer after compaction rebuilt the space layout.
    pub(crate) fn set_top(&self, top: Address) {
        let mut data = self.mutex.lock();
        assert!(self.total.contains(top) || top == self.total.end);
        data.top = top;
    }

    pub fn top(&self) -> Address {
        self.mutex.lock().top
    }

    fn index(&self, addr: Address) -> usize {
        assert!(self.contains(addr), "address {} outside method space", addr);
        addr.offset_from(self.total.start) as usize
    }

    fn ptr(&self, addr: Address) -> *mut u8 {
        let idx = self.index(addr);
        unsafe { (*self.storage.get()).as_mut_ptr().add(idx) }
    }

    pub fn read_u32(&self, addr: Address) -> u32 {
        let mut buf = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(addr), buf.as_mut_ptr(), 4);
        }
        LittleEndian::read_u32(&buf)
    }

    pub fn write_u32(&self, addr: Address, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr(addr), 4);
        }
    }

    pub fn write_bytes(&self, addr: Address, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let _ = self.index(addr.offset(bytes.len() as u32 - 1));
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(addr), bytes.len());
        }
    }

    pub fn read_bytes(&self, addr: Address, len: usize, out: &mut Vec<u8>) {
        if len == 0 {
            return;
        }

        let _ = self.index(addr.offset(len as u32 - 1));
        let start = out.len();
        out.resize(start + len, 0);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr(addr), out[start..].as_mut_ptr(), len);
        }
    }

    /// Slide `len` bytes from `from` down to `to` (compaction move;
    /// ranges may overlap).
    pub(crate) fn move_range(&self, from: Address, to: Address, len: usize) {
        assert!(to <= from);
        unsafe {
            std::ptr::copy(self.ptr(from), self.ptr(to), len);
        }
    }

    /// Rewrite one already-emitted instruction word: the new encoding is
    /// computed up front, written with a single store, and the affected
    /// word flushed from the instruction cache. When `expected` is given
    /// the current encoding must match it.
    pub fn patch_instruction(&self, addr: Address, expected: Option<u32>, new: u32) {
        assert!(addr.to_u32() % 4 == 0);

        if let Some(expected) = expected {
            let current = self.read_u32(addr);
            assert!(
                current == expected,
                "patch target holds {:#010x}, expected {:#010x}",
                current,
                expected
            );
        }

        self.write_u32(addr, new);
        flush_icache(addr, 4);
    }

    /// Device-space snapshot for the embedder's image writer and the
    /// test harness.
    pub fn snapshot(&self) -> (Address, Vec<u8>) {
        let used = self.top().offset_from(self.total.start) as usize;
        let mut out = Vec::new();
        if used > 0 {
            self.read_bytes(self.total.start, used, &mut out);
        }
        (self.total.start, out)
    }
}

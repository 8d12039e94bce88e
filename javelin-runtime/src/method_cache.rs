use std::sync::Arc;

use crate::code::CompiledMethod;
use crate::gc::Address;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CodeId(usize);

impl CodeId {
    pub fn idx(self) -> usize {
        self.0
    }
}

impl From<usize> for CodeId {
    fn from(data: usize) -> CodeId {
        CodeId(data)
    }
}

/// Registry of installed methods plus an address-sorted table of the
/// live ones, answering "which method contains this pc" by binary
/// search. Eviction empties the registry slot but keeps the id stable,
/// so stale ids (e.g. in patch entries) can be detected by comparing
/// the current record against a remembered base pointer.
pub struct MethodCache {
    methods: Vec<Option<Arc<CompiledMethod>>>,
    table: Vec<(Address, CodeId)>,
}

impl MethodCache {
    pub fn new() -> MethodCache {
        MethodCache {
            methods: Vec::new(),
            table: Vec::new(),
        }
    }

    pub fn register(&mut self, method: Arc<CompiledMethod>) -> CodeId {
        let id = CodeId(self.methods.len());
        let start = method.object_start();
        self.methods.push(Some(method));

        let at = self.table.partition_point(|&(base, _)| base < start);
        self.table.insert(at, (start, id));

        id
    }

    pub fn get(&self, id: CodeId) -> Option<Arc<CompiledMethod>> {
        self.methods.get(id.idx()).and_then(|slot| slot.clone())
    }

    /// The registered method containing `addr`. The caller guarantees
    /// the address points into some registered method and that the
    /// table is non-empty.
    pub fn find(&self, addr: Address) -> CodeId {
        assert!(!self.table.is_empty(), "find on empty method table");

        let at = self.table.partition_point(|&(base, _)| base <= addr);
        assert!(at > 0, "address below every registered method");

        let (_, id) = self.table[at - 1];
        debug_assert!(self
            .get(id)
            .map(|method| method.contains(addr))
            .unwrap_or(false));

        id
    }

    /// True when the registry still holds `id` and its record sits at
    /// `base`; the patch table uses this to detect evicted methods.
    pub fn record_matches(&self, id: CodeId, base: Address) -> bool {
        self.get(id)
            .map(|method| method.object_start() == base)
            .unwrap_or(false)
    }

    pub fn evict(&mut self, id: CodeId) -> Option<Arc<CompiledMethod>> {
        let method = self.methods.get_mut(id.idx())?.take()?;
        self.table.retain(|&(_, entry)| entry != id);
        Some(method)
    }

    /// Live methods in ascending address order.
    pub fn live(&self) -> impl Iterator<Item = (Address, CodeId)> + '_ {
        self.table.iter().copied()
    }

    pub fn live_count(&self) -> usize {
        self.table.len()
    }

    /// Re-sort the table from the methods' current start addresses;
    /// called after compaction moved objects.
    pub fn rebuild_table(&mut self) {
        for entry in self.table.iter_mut() {
            let (_, id) = *entry;
            let method = self.methods[id.idx()].as_ref().expect("live entry evicted");
            *entry = (method.object_start(), id);
        }

        self.table.sort_by_key(|&(base, _)| base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CommentTable, RelocationTable};
    use javelin_bytecode::MethodId;

    fn method(start: u32, size: u32) -> Arc<CompiledMethod> {
        Arc::new(CompiledMethod::new(
            Address::from(start),
            size,
            MethodId::from(0),
            16,
            size - 16,
            RelocationTable::new(),
            CommentTable::new(),
        ))
    }

    #[test]
    fn test_find_containing_method() {
        let mut cache = MethodCache::new();

        let first = cache.register(method(0x1000, 0x40));
        let second = cache.register(method(0x1040, 0x20));
        let third = cache.register(method(0x1100, 0x30));

        assert_eq!(cache.find(Address::from(0x1000)), first);
        assert_eq!(cache.find(Address::from(0x103F)), first);
        assert_eq!(cache.find(Address::from(0x1040)), second);
        assert_eq!(cache.find(Address::from(0x1105)), third);
    }

    #[test]
    fn test_registration_keeps_table_sorted() {
        let mut cache = MethodCache::new();

        cache.register(method(0x3000, 0x10));
        cache.register(method(0x1000, 0x10));
        cache.register(method(0x2000, 0x10));

        let bases: Vec<u32> = cache.live().map(|(base, _)| base.to_u32()).collect();
        assert_eq!(bases, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_eviction() {
        let mut cache = MethodCache::new();

        let first = cache.register(method(0x1000, 0x10));
        let second = cache.register(method(0x2000, 0x10));

        assert!(cache.record_matches(first, Address::from(0x1000)));

        cache.evict(first);
        assert!(cache.get(first).is_none());
        assert!(!cache.record_matches(first, Address::from(0x1000)));
        assert_eq!(cache.live_count(), 1);

        // the surviving method is still found
        assert_eq!(cache.find(Address::from(0x2008)), second);
    }

    #[test]
    #[should_panic(expected = "find on empty method table")]
    fn test_find_requires_entries() {
        let cache = MethodCache::new();
        cache.find(Address::from(0x1000));
    }
}

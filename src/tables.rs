use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::unwind::arm64::Arm64RuntimeFunction;

/// One `[begin, end)` code range mapped to its unwind metadata, all three
/// fields image-relative. An odd `unwind_info` marks a chained entry whose
/// target RUNTIME_FUNCTION lives at `base + (unwind_info & !1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info: u32,
}

/// Growable table backing store: a fixed arena of `max_count` slots with a
/// monotonically increasing visible count. Growth never relocates or
/// mutates already-visible entries, so a concurrent lookup can never
/// observe a torn entry.
pub struct GrowableTable {
    slots: Box<[RuntimeFunction]>,
    visible: AtomicUsize,
}

impl GrowableTable {
    fn lookup(&self, rva: u32) -> Option<RuntimeFunction> {
        let count = self.visible.load(Ordering::Acquire);
        find_runtime_function(rva, &self.slots[..count])
    }
}

/// Handle to a growable table; clonable across threads so growth can race
/// lookups on the registry side.
#[derive(Clone)]
pub struct GrowableHandle {
    id: u64,
    table: Arc<GrowableTable>,
}

impl GrowableHandle {
    /// Atomically publish more already-stored entries. Counts that do not
    /// grow, or exceed the preallocated maximum, are ignored.
    pub fn grow(&self, new_count: usize) {
        let table = &self.table;
        if new_count > table.slots.len() {
            return;
        }
        let mut current = table.visible.load(Ordering::Relaxed);
        while new_count > current {
            match table.visible.compare_exchange(
                current,
                new_count,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }
}

pub type TableResolver = Rc<dyn Fn(u64) -> Option<RuntimeFunction>>;

enum TableKind {
    Static { entries: Arc<[RuntimeFunction]> },
    Arm64 { entries: Arc<[Arm64RuntimeFunction]> },
    Growable(Arc<GrowableTable>),
    Callback { resolver: TableResolver },
}

struct TableEntry {
    id: u64,
    base: u64,
    begin: u64,
    end: u64,
    kind: TableKind,
}

/// Registry of every published unwind table: static tables registered at
/// module load, growable tables for jitted ranges, and callback tables
/// resolved lazily per lookup.
#[derive(Default)]
pub struct FunctionTables {
    entries: Vec<TableEntry>,
    next_growable_id: u64,
}

impl FunctionTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a static, address-sorted table. Registering the same table
    /// id twice succeeds as a no-op on the duplicate. Zero-length tables
    /// are accepted.
    pub fn add_function_table(&mut self, id: u64, entries: &[RuntimeFunction], base: u64) -> bool {
        if self
            .entries
            .iter()
            .any(|e| e.id == id && matches!(e.kind, TableKind::Static { .. }))
        {
            trace!(id, "duplicate static table registration ignored");
            return true;
        }
        let end = match entries.last() {
            Some(last) => base + last.end_address as u64,
            None => base,
        };
        self.entries.push(TableEntry {
            id,
            base,
            begin: base,
            end,
            kind: TableKind::Static {
                entries: entries.into(),
            },
        });
        true
    }

    /// Publish an address-sorted aarch64 table covering `[base, base+length)`.
    /// The entries carry no end address; the covering range bounds the lookup.
    pub fn add_arm64_function_table(
        &mut self,
        id: u64,
        entries: &[Arm64RuntimeFunction],
        base: u64,
        length: u64,
    ) -> bool {
        if self
            .entries
            .iter()
            .any(|e| e.id == id && matches!(e.kind, TableKind::Arm64 { .. }))
        {
            trace!(id, "duplicate arm64 table registration ignored");
            return true;
        }
        self.entries.push(TableEntry {
            id,
            base,
            begin: base,
            end: base + length,
            kind: TableKind::Arm64 {
                entries: entries.into(),
            },
        });
        true
    }

    /// Remove a static, aarch64 or callback table by the id it was
    /// registered under; growable tables go through their handle. True on
    /// first removal, false if it was never registered or already removed.
    pub fn delete_function_table(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.id != id || matches!(e.kind, TableKind::Growable(_)));
        self.entries.len() != before
    }

    /// Register a PC range whose entries are produced on demand by
    /// `resolver`. The handle value must carry both low bits set; that tag
    /// is what distinguishes callback tables from static ones.
    pub fn install_function_table_callback(
        &mut self,
        id: u64,
        base: u64,
        length: u64,
        resolver: TableResolver,
    ) -> bool {
        if id & 0x3 != 0x3 {
            return false;
        }
        self.entries.push(TableEntry {
            id,
            base,
            begin: base,
            end: base + length,
            kind: TableKind::Callback { resolver },
        });
        true
    }

    /// Preallocate a table of `max_count` slots with `count` initially
    /// visible. The arena never moves, so previously returned entries stay
    /// valid while the table grows.
    pub fn add_growable_function_table(
        &mut self,
        entries: &[RuntimeFunction],
        count: usize,
        max_count: usize,
        range_start: u64,
        range_end: u64,
    ) -> Option<GrowableHandle> {
        if count > entries.len() || entries.len() > max_count {
            return None;
        }
        let mut slots = vec![RuntimeFunction::default(); max_count];
        slots[..entries.len()].copy_from_slice(entries);
        let table = Arc::new(GrowableTable {
            slots: slots.into_boxed_slice(),
            visible: AtomicUsize::new(count),
        });
        self.next_growable_id += 1;
        let id = self.next_growable_id;
        self.entries.push(TableEntry {
            id,
            base: range_start,
            begin: range_start,
            end: range_end,
            kind: TableKind::Growable(Arc::clone(&table)),
        });
        Some(GrowableHandle { id, table })
    }

    pub fn delete_growable_function_table(&mut self, handle: &GrowableHandle) {
        self.entries
            .retain(|e| !(e.id == handle.id && matches!(e.kind, TableKind::Growable(_))));
    }

    /// Binary-search every registered table for the entry containing `pc`.
    /// A callback table's resolver is invoked at most once per lookup and
    /// nothing is cached across calls.
    pub fn lookup_function_entry(&self, pc: u64) -> Option<(RuntimeFunction, u64)> {
        for entry in &self.entries {
            if pc < entry.begin || pc >= entry.end {
                continue;
            }
            let rva = (pc - entry.base) as u32;
            let found = match &entry.kind {
                TableKind::Static { entries } => find_runtime_function(rva, entries),
                TableKind::Arm64 { .. } => None,
                TableKind::Growable(table) => table.lookup(rva),
                TableKind::Callback { resolver } => resolver(pc),
            };
            if let Some(func) = found {
                return Some((func, entry.base));
            }
        }
        None
    }

    /// aarch64 counterpart of [`lookup_function_entry`]. Entries have no
    /// end address, so a match is the closest begin address at or below
    /// `pc` inside the table's covering range.
    pub fn lookup_arm64_function_entry(&self, pc: u64) -> Option<(Arm64RuntimeFunction, u64)> {
        for entry in &self.entries {
            if pc < entry.begin || pc >= entry.end {
                continue;
            }
            if let TableKind::Arm64 { entries } = &entry.kind {
                let rva = (pc - entry.base) as u32;
                if let Some(func) = find_arm64_runtime_function(rva, entries) {
                    return Some((func, entry.base));
                }
            }
        }
        None
    }
}

fn find_arm64_runtime_function(
    rva: u32,
    function_list: &[Arm64RuntimeFunction],
) -> Option<Arm64RuntimeFunction> {
    match function_list.binary_search_by(|func| func.begin_address.cmp(&rva)) {
        Ok(pos) => function_list.get(pos).copied(),
        Err(0) => None,
        Err(pos) => function_list.get(pos - 1).copied(),
    }
}

fn find_runtime_function(rva: u32, function_list: &[RuntimeFunction]) -> Option<RuntimeFunction> {
    let index = function_list.binary_search_by(|func| func.begin_address.cmp(&rva));

    match index {
        // Exact match
        Ok(pos) => function_list.get(pos).copied(),
        // Inexact match
        Err(pos) => {
            if pos > 0
                && function_list.get(pos - 1).map_or(false, |func| {
                    func.begin_address <= rva && rva < func.end_address
                })
            {
                function_list.get(pos - 1).copied()
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(begin: u32, end: u32, unwind: u32) -> RuntimeFunction {
        RuntimeFunction {
            begin_address: begin,
            end_address: end,
            unwind_info: unwind,
        }
    }

    #[test]
    fn duplicate_registration_is_idempotent_and_delete_twice_fails() {
        let mut tables = FunctionTables::new();
        let entries = [func(0x100, 0x200, 0x300)];
        assert!(tables.add_function_table(0x4000, &entries, 0x40_0000));
        assert!(tables.add_function_table(0x4000, &entries, 0x40_0000));
        assert!(tables.lookup_function_entry(0x40_0150).is_some());

        assert!(tables.delete_function_table(0x4000));
        assert!(!tables.delete_function_table(0x4000));
        assert!(tables.lookup_function_entry(0x40_0150).is_none());
    }

    #[test]
    fn empty_table_registers_and_resolves_nothing() {
        let mut tables = FunctionTables::new();
        assert!(tables.add_function_table(0x8000, &[], 0x40_0000));
        assert!(tables.lookup_function_entry(0x40_0000).is_none());
    }

    #[test]
    fn callback_tables_are_deleted_by_their_tagged_handle() {
        let mut tables = FunctionTables::new();
        let resolver: TableResolver = Rc::new(|_| Some(func(0, 0x1000, 0x2000)));
        assert!(tables.install_function_table_callback(0x4007, 0x50_0000, 0x1000, resolver));
        assert!(tables.lookup_function_entry(0x50_0080).is_some());

        assert!(tables.delete_function_table(0x4007));
        assert!(tables.lookup_function_entry(0x50_0080).is_none());
        assert!(!tables.delete_function_table(0x4007));
    }

    #[test]
    fn static_registration_ignores_unrelated_kinds_with_the_same_id() {
        let mut tables = FunctionTables::new();
        let entries = [func(0x100, 0x200, 0x300)];
        let handle = tables
            .add_growable_function_table(&entries, 1, 1, 0x60_0000, 0x60_1000)
            .unwrap();

        // the growable table's internal id is 1; a static table named 1 is
        // a different registration entirely
        assert!(tables.add_function_table(1, &entries, 0x40_0000));
        assert!(tables.lookup_function_entry(0x40_0150).is_some());
        assert!(tables.lookup_function_entry(0x60_0150).is_some());

        assert!(tables.delete_function_table(1));
        assert!(tables.lookup_function_entry(0x40_0150).is_none());
        assert!(
            tables.lookup_function_entry(0x60_0150).is_some(),
            "deleting by id leaves growable tables alone"
        );
        tables.delete_growable_function_table(&handle);
    }

    #[test]
    fn arm64_tables_resolve_by_begin_address_within_range() {
        let mut tables = FunctionTables::new();
        let entries = [
            Arm64RuntimeFunction {
                begin_address: 0x000,
                data: 0x2000,
            },
            Arm64RuntimeFunction {
                begin_address: 0x400,
                data: 0x2010,
            },
        ];
        assert!(tables.add_arm64_function_table(0x20, &entries, 0x18_0000, 0x800));

        let (func, base) = tables.lookup_arm64_function_entry(0x18_0404).unwrap();
        assert_eq!(base, 0x18_0000);
        assert_eq!(func.begin_address, 0x400);
        assert!(tables.lookup_arm64_function_entry(0x18_0900).is_none());

        assert!(tables.delete_function_table(0x20));
        assert!(tables.lookup_arm64_function_entry(0x18_0404).is_none());
    }

    #[test]
    fn callback_handle_requires_tag_bits() {
        let mut tables = FunctionTables::new();
        let resolver: TableResolver = Rc::new(|_| None);
        assert!(!tables.install_function_table_callback(0x4000, 0, 0x1000, Rc::clone(&resolver)));
        assert!(tables.install_function_table_callback(0x4003, 0, 0x1000, resolver));
    }

    #[test]
    fn callback_resolver_runs_per_lookup() {
        use std::cell::Cell;

        let mut tables = FunctionTables::new();
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let resolver: TableResolver = Rc::new(move |pc| {
            seen.set(seen.get() + 1);
            (pc >= 0x50_0000).then(|| func(0, 0x1000, 0x2000))
        });
        tables.install_function_table_callback(0x7, 0x50_0000, 0x1000, resolver);

        assert!(tables.lookup_function_entry(0x50_0080).is_some());
        assert!(tables.lookup_function_entry(0x50_0080).is_some());
        assert_eq!(calls.get(), 2, "nothing may be cached between lookups");
    }

    #[test]
    fn growable_visibility_tracks_grow_calls() {
        let mut tables = FunctionTables::new();
        let entries = [func(0x000, 0x100, 0x800), func(0x100, 0x200, 0x900)];
        let handle = tables
            .add_growable_function_table(&entries, 0, 2, 0x60_0000, 0x60_1000)
            .unwrap();

        assert!(tables.lookup_function_entry(0x60_0010).is_none());

        handle.grow(1);
        assert!(tables.lookup_function_entry(0x60_0010).is_some());
        assert!(tables.lookup_function_entry(0x60_0110).is_none());

        handle.grow(2);
        assert!(tables.lookup_function_entry(0x60_0110).is_some());

        // Growth is monotonic: shrinking attempts are ignored.
        handle.grow(0);
        assert!(tables.lookup_function_entry(0x60_0110).is_some());

        tables.delete_growable_function_table(&handle);
        assert!(tables.lookup_function_entry(0x60_0010).is_none());
    }
}

//! Metadata four-tuples and the scope tables that track them.
//!
//! Every tracked pointer is associated with four shadow cells holding its
//! base, bound, key, and lock. A `Metadata` records the *addresses* of
//! those cells as SSA values; the values inside the cells mutate as
//! metadata flows, the cell addresses do not.
//!
//! Two per-function tables map SSA pointers to their metadata and are
//! mutually exclusive by construction:
//!
//! - block-scoped: metadata whose validity ends at the defining block
//!   (phis, loaded pointers, call results, derived aliases). Snapshot on
//!   block entry, restore on exit, so identifiers never bleed across
//!   blocks in violation of SSA dominance.
//! - function-scoped: metadata valid anywhere in the function (allocas,
//!   parameters).
//!
//! A third, module-scoped table maps global names to metadata and is never
//! torn down. Global metadata is not computed yet (globals degrade to
//! don't-care), so that table stays empty today; the scaffolding exists so
//! the lookup order is already right when it is filled in.

use std::collections::BTreeMap;

use crate::common::error::InstrumentError;
use crate::ir::instruction::Value;

/// The four shadow-cell addresses for one tracked pointer.
///
/// `base`, `bound`, and `lock` are values of type `i8**`; `key` is a value
/// of type `i64*`. They are either prologue allocas or block-local values
/// that evaluate to cell addresses (metadata phis and metadata selects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub base: Value,
    pub bound: Value,
    pub key: Value,
    pub lock: Value,
}

/// Which table a metadata entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Block,
    Function,
}

/// A saved copy of the block-scoped table, taken on block entry.
#[derive(Debug)]
pub struct BlockSnapshot(BTreeMap<Value, Metadata>);

/// The per-function metadata tables. Ordered maps keep traversal (and
/// therefore emitted IR) deterministic.
#[derive(Debug, Default)]
pub struct MetadataTables {
    block: BTreeMap<Value, Metadata>,
    func: BTreeMap<Value, Metadata>,
}

impl MetadataTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `v`, enforcing table exclusivity. Function scope wins the
    /// ordering question only in the sense that it is reported first; if
    /// both tables contain `v` that is a fatal pass bug.
    pub fn lookup(
        &self,
        function: &str,
        v: Value,
    ) -> Result<Option<(Scope, Metadata)>, InstrumentError> {
        match (self.func.get(&v), self.block.get(&v)) {
            (Some(_), Some(_)) => Err(InstrumentError::ScopeConflict {
                function: function.to_string(),
                operand: v.to_string(),
            }),
            (Some(m), None) => Ok(Some((Scope::Function, *m))),
            (None, Some(m)) => Ok(Some((Scope::Block, *m))),
            (None, None) => Ok(None),
        }
    }

    /// Insert `v` into the given scope. Inserting a value the *other*
    /// scope already holds is the same fatal exclusivity violation as
    /// observing one.
    pub fn insert(
        &mut self,
        function: &str,
        scope: Scope,
        v: Value,
        meta: Metadata,
    ) -> Result<(), InstrumentError> {
        let other = match scope {
            Scope::Block => &self.func,
            Scope::Function => &self.block,
        };
        if other.contains_key(&v) {
            return Err(InstrumentError::ScopeConflict {
                function: function.to_string(),
                operand: v.to_string(),
            });
        }
        match scope {
            Scope::Block => self.block.insert(v, meta),
            Scope::Function => self.func.insert(v, meta),
        };
        Ok(())
    }

    /// Drop a block-scoped entry (metadata invalidated, e.g. by a call
    /// that may have freed the pointee).
    pub fn remove_block(&mut self, v: Value) {
        self.block.remove(&v);
    }

    /// Capture the block-scoped table on block entry.
    pub fn snapshot_block(&self) -> BlockSnapshot {
        BlockSnapshot(self.block.clone())
    }

    /// Restore the block-scoped table on block exit.
    pub fn restore_block(&mut self, snapshot: BlockSnapshot) {
        self.block = snapshot.0;
    }

    #[cfg(test)]
    pub fn block_len(&self) -> usize {
        self.block.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(n: u32) -> Metadata {
        Metadata { base: Value(n), bound: Value(n + 1), key: Value(n + 2), lock: Value(n + 3) }
    }

    #[test]
    fn test_lookup_reports_scope() {
        let mut tables = MetadataTables::new();
        tables.insert("f", Scope::Function, Value(1), meta(10)).unwrap();
        tables.insert("f", Scope::Block, Value(2), meta(20)).unwrap();
        assert_eq!(tables.lookup("f", Value(1)).unwrap(), Some((Scope::Function, meta(10))));
        assert_eq!(tables.lookup("f", Value(2)).unwrap(), Some((Scope::Block, meta(20))));
        assert_eq!(tables.lookup("f", Value(3)).unwrap(), None);
    }

    #[test]
    fn test_exclusivity_is_fatal() {
        let mut tables = MetadataTables::new();
        tables.insert("f", Scope::Function, Value(1), meta(10)).unwrap();
        let err = tables.insert("f", Scope::Block, Value(1), meta(20)).unwrap_err();
        assert!(matches!(err, InstrumentError::ScopeConflict { .. }));
        assert!(err.to_string().contains("%1"));
    }

    #[test]
    fn test_snapshot_restore_discards_block_entries() {
        let mut tables = MetadataTables::new();
        let snap = tables.snapshot_block();
        tables.insert("f", Scope::Block, Value(7), meta(30)).unwrap();
        assert_eq!(tables.block_len(), 1);
        tables.restore_block(snap);
        assert_eq!(tables.block_len(), 0);
        assert_eq!(tables.lookup("f", Value(7)).unwrap(), None);
    }
}

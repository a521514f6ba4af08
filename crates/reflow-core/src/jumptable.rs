//! Jump table view consumed by multiway-branch lowering.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::expr::Expr;

/// Index-to-target view of one jump table.
///
/// Maps each successor address to the set of table indices that dispatch to
/// it. Several indices aliasing one target produce several case labels over
/// a single case body.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JumpTable {
    /// Address of the dispatching instruction.
    pub addr: u64,
    /// The value being switched on, if recovered.
    pub scrutinee: Option<Expr>,
    targets: IndexMap<u64, BTreeSet<i64>>,
}

impl JumpTable {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            scrutinee: None,
            targets: IndexMap::new(),
        }
    }

    pub fn with_scrutinee(mut self, scrutinee: Expr) -> Self {
        self.scrutinee = Some(scrutinee);
        self
    }

    /// Records that table index `index` dispatches to `target`.
    pub fn add_case(&mut self, index: i64, target: u64) {
        self.targets.entry(target).or_default().insert(index);
    }

    /// True if some index dispatches to `target`.
    pub fn has_target(&self, target: u64) -> bool {
        self.targets.contains_key(&target)
    }

    /// The index values dispatching to `target`, in ascending order.
    pub fn get_target(&self, target: u64) -> Option<&BTreeSet<i64>> {
        self.targets.get(&target)
    }

    /// Number of distinct targets covered by the table.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_table_aliased_indices() {
        let mut table = JumpTable::new(0x1000);
        table.add_case(0, 0x2000);
        table.add_case(2, 0x2000);
        table.add_case(1, 0x2100);

        assert!(table.has_target(0x2000));
        assert!(!table.has_target(0x9999));
        let indices: Vec<i64> = table.get_target(0x2000).into_iter().flatten().copied().collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(table.target_count(), 2);
    }

    #[test]
    fn test_jump_table_scrutinee() {
        let table = JumpTable::new(0x1000).with_scrutinee(Expr::reg("r2"));
        assert_eq!(table.scrutinee, Some(Expr::reg("r2")));
    }
}

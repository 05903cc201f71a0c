//! Bytecode liveness as seen by the unoptimized tier

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::operand::{CodeOrigin, Operand};

/// Operands live at each bytecode index.
///
/// Indices without an entry are treated as "everything live", which is what
/// an exit must assume when no liveness was computed for that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeLiveness {
    live: FxHashMap<u32, FxHashSet<Operand>>,
}

impl BytecodeLiveness {
    /// Empty liveness (everything live everywhere).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the live set at `bytecode_index`.
    pub fn set_live(&mut self, bytecode_index: u32, operands: impl IntoIterator<Item = Operand>) {
        self.live
            .insert(bytecode_index, operands.into_iter().collect());
    }

    /// Whether `operand` is live at `origin`.
    pub fn is_live(&self, origin: CodeOrigin, operand: Operand) -> bool {
        match self.live.get(&origin.bytecode_index) {
            Some(set) => set.contains(&operand),
            None => true,
        }
    }

    /// Whether liveness was recorded for `origin`.
    pub fn has_entry(&self, origin: CodeOrigin) -> bool {
        self.live.contains_key(&origin.bytecode_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entries_are_conservative() {
        let mut liveness = BytecodeLiveness::new();
        liveness.set_live(4, [Operand::Local(0)]);
        assert!(liveness.is_live(CodeOrigin::new(4), Operand::Local(0)));
        assert!(!liveness.is_live(CodeOrigin::new(4), Operand::Local(1)));
        assert!(liveness.is_live(CodeOrigin::new(9), Operand::Local(1)));
    }
}

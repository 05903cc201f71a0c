//! Inline cache site descriptors.
//!
//! Property accesses and calls lower to a [`Patchpoint`](crate::lir::Inst)
//! whose code the runtime owns. Each patchpoint gets an [`InlineCacheSite`]
//! telling the runtime what the site does so it can install a specialized
//! stub once it has seen concrete structures.

use serde::{Deserialize, Serialize};
use strata_ir::{CodeOrigin, Graph, IdentifierIndex, Op};

/// Patchpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u32);

impl SiteId {
    /// Index into [`InlineCacheTable::sites`].
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operation a site performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InlineCacheKind {
    /// `base.name`; args `[base]`.
    GetById,
    /// `base.name = value`; args `[base, value]`.
    PutById,
    /// Own-property definition; args `[base, value]`.
    PutByIdDirect,
    /// `key in base`; args `[base, key]`.
    In,
    /// Call; args `[callee, this, args...]`.
    Call,
    /// Construct; args `[callee, this, args...]`.
    Construct,
    /// Call reading its arguments from the outgoing area; args
    /// `[callee, this, area, count]`.
    CallVarargs,
    /// Construct reading its arguments from the outgoing area.
    ConstructVarargs,
    /// Call forwarding the caller's arguments; args
    /// `[callee, this, area, count]`, where `area` is the caller's frame when
    /// the call has no limit.
    CallForwardVarargs,
}

impl InlineCacheKind {
    /// Bytes reserved in native code for the site.
    pub const fn size_bytes(self) -> u32 {
        match self {
            Self::GetById | Self::In => 48,
            Self::PutById | Self::PutByIdDirect => 56,
            Self::Call | Self::Construct => 64,
            Self::CallVarargs | Self::ConstructVarargs | Self::CallForwardVarargs => 80,
        }
    }

    /// Site performs a call.
    pub const fn is_call(self) -> bool {
        matches!(
            self,
            Self::Call
                | Self::Construct
                | Self::CallVarargs
                | Self::ConstructVarargs
                | Self::CallForwardVarargs
        )
    }
}

/// Descriptor queued for the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineCacheSite {
    /// Handle.
    pub id: SiteId,
    /// Operation.
    pub kind: InlineCacheKind,
    /// Source position.
    pub origin: CodeOrigin,
    /// Property name for by-id accesses.
    pub identifier: Option<IdentifierIndex>,
    /// Number of arguments including `this` for calls with a fixed count;
    /// leading spread elements skipped for varargs calls.
    pub argument_count: u32,
    /// Bytes reserved for the site.
    pub size_bytes: u32,
}

/// All sites of one compiled function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineCacheTable {
    /// Sites, indexed by [`SiteId`].
    pub sites: Vec<InlineCacheSite>,
    /// Outgoing argument slots reserved for varargs calls.
    pub varargs_outgoing_slots: u32,
}

impl InlineCacheTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site.
    pub fn push(
        &mut self,
        kind: InlineCacheKind,
        origin: CodeOrigin,
        identifier: Option<IdentifierIndex>,
        argument_count: u32,
    ) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(InlineCacheSite {
            id,
            kind,
            origin,
            identifier,
            argument_count,
            size_bytes: kind.size_bytes(),
        });
        id
    }

    /// Site by id.
    pub fn site(&self, id: SiteId) -> Option<&InlineCacheSite> {
        self.sites.get(id.index())
    }

    /// Number of sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// No sites.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Outgoing argument slots needed by the varargs calls of `graph`.
///
/// A call with a known limit needs `limit` argument slots plus the frame
/// header; calls without a limit are sized at runtime and reserve nothing
/// here. `LoadVarargs` writes into frame slots the graph already owns.
pub fn varargs_outgoing_slots(graph: &Graph) -> u32 {
    graph
        .nodes
        .iter()
        .filter_map(|node| match &node.op {
            Op::CallVarargs(data) | Op::ConstructVarargs(data) | Op::CallForwardVarargs(data)
                if data.limit > 0 =>
            {
                Some(data.limit + crate::abi::FRAME_HEADER_SLOTS as u32)
            }
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::{Edge, GraphBuilder, NodeResult, VarargsData};

    #[test]
    fn sites_are_numbered_in_order() {
        let mut table = InlineCacheTable::new();
        let a = table.push(InlineCacheKind::GetById, CodeOrigin::new(1), None, 0);
        let b = table.push(InlineCacheKind::Call, CodeOrigin::new(2), None, 3);
        assert_eq!((a, b), (SiteId(0), SiteId(1)));
        assert_eq!(table.site(b).map(|s| s.size_bytes), Some(64));
    }

    #[test]
    fn varargs_prepass_takes_the_largest_limit() {
        let mut b = GraphBuilder::new("v", 1, 0);
        let entry = b.entry();
        let undefined = b.add(
            entry,
            Op::JsConstant(strata_ir::FrozenValue::Undefined),
            [],
            NodeResult::JsValue,
        );
        for limit in [4, 9, 0] {
            b.add(
                entry,
                Op::CallVarargs(VarargsData {
                    first_vararg_offset: 0,
                    limit,
                }),
                [
                    Edge::untyped(undefined),
                    Edge::untyped(undefined),
                    Edge::untyped(undefined),
                ],
                NodeResult::JsValue,
            );
        }
        b.add(entry, Op::Return, [Edge::untyped(undefined)], NodeResult::None);
        let graph = b.build().expect("valid graph");
        assert_eq!(varargs_outgoing_slots(&graph), 12);
    }
}

//! Compile capability check.
//!
//! [`can_compile`] rejects graphs the lowering cannot handle before any code
//! is emitted. Lowering the same graph without the check crashes on the first
//! unsupported node instead.

use strata_ir::{ArrayType, Graph, IndexingType, Node, NodeId, NodeResult, Op, UseKind};
use tracing::warn;

use crate::compiler::JitError;

/// Why a node cannot be lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Shape(&'static str),
    Edge { child: usize, use_kind: UseKind },
}

/// Check that every node of `graph` has a lowering.
pub fn can_compile(graph: &Graph) -> Result<(), JitError> {
    graph.validate()?;
    for block in graph.block_indices() {
        for &id in &graph.block(block).nodes {
            let node = graph.node(id);
            if let Err(rejection) = check_node(node) {
                warn!(
                    target: "strata::lower",
                    function = %graph.name,
                    %block,
                    node = %id,
                    op = node.op.name(),
                    ?rejection,
                    "cannot compile"
                );
                return Err(rejection_error(id, node, rejection));
            }
        }
    }
    Ok(())
}

fn rejection_error(id: NodeId, node: &Node, rejection: Rejection) -> JitError {
    match rejection {
        Rejection::Shape(reason) => JitError::Unsupported {
            node: id,
            op: node.op.name(),
            reason,
        },
        Rejection::Edge { child, use_kind } => JitError::UnsupportedUseKind {
            node: id,
            op: node.op.name(),
            child,
            use_kind,
        },
    }
}

fn is_int32(kind: UseKind) -> bool {
    matches!(kind, UseKind::Int32 | UseKind::KnownInt32)
}

/// Indices are int32s, speculated when boxed.
fn is_index(kind: UseKind) -> bool {
    is_int32(kind) || kind == UseKind::Untyped
}

fn require(node: &Node, child: usize, accept: impl Fn(UseKind) -> bool) -> Result<(), Rejection> {
    match node.children.get(child) {
        Some(edge) if !accept(edge.use_kind) => Err(Rejection::Edge {
            child,
            use_kind: edge.use_kind,
        }),
        _ => Ok(()),
    }
}

fn require_cell(node: &Node, child: usize) -> Result<(), Rejection> {
    require(node, child, UseKind::is_cell)
}

/// Operands of a numeric node producing `result`.
fn require_numeric(node: &Node, children: usize, int52: bool) -> Result<(), Rejection> {
    let accept: fn(UseKind) -> bool = match node.result {
        NodeResult::Int32 => is_int32,
        NodeResult::Int52 if int52 => |kind| kind == UseKind::Int52Rep,
        NodeResult::Double => UseKind::is_double_rep,
        _ => return Err(Rejection::Shape("numeric result representation")),
    };
    (0..children).try_for_each(|child| require(node, child, accept))
}

fn check_node(node: &Node) -> Result<(), Rejection> {
    match &node.op {
        Op::BitAnd | Op::BitOr | Op::BitXor | Op::BitLShift | Op::BitRShift | Op::BitURShift => {
            require(node, 0, is_int32)?;
            require(node, 1, is_int32)
        }
        Op::ArithClz32 => require(node, 0, is_int32),
        Op::ArithAdd(_) | Op::ArithSub(_) | Op::ArithMul(_) => require_numeric(node, 2, true),
        Op::ArithNegate(_) => require_numeric(node, 1, true),
        Op::ArithDiv(_) | Op::ArithMod(_) | Op::ArithMin | Op::ArithMax => {
            require_numeric(node, 2, false)
        }
        Op::ArithAbs(_) => require_numeric(node, 1, false),
        Op::ArithSqrt
        | Op::ArithSin
        | Op::ArithCos
        | Op::ArithLog
        | Op::ArithFRound
        | Op::ArithRound(_) => require(node, 0, UseKind::is_double_rep),
        Op::ArithPow => {
            require(node, 0, UseKind::is_double_rep)?;
            require(node, 1, UseKind::is_double_rep)
        }

        Op::CheckStructure(_)
        | Op::CheckHasInstance
        | Op::GetButterfly
        | Op::AllocatePropertyStorage(_)
        | Op::ReallocatePropertyStorage(_)
        | Op::MultiGetByOffset(_)
        | Op::MultiPutByOffset(_)
        | Op::PutStructure(_)
        | Op::GetScope
        | Op::SkipScope
        | Op::GetExecutable
        | Op::GetClosureVar(_)
        | Op::PutClosureVar(_)
        | Op::NewFunction
        | Op::CreateActivation(_)
        | Op::GetFromArguments(_)
        | Op::PutToArguments(_)
        | Op::CreateScopedArguments
        | Op::MaterializeCreateActivation(_) => require_cell(node, 0),
        Op::InstanceOf => require_cell(node, 1),
        Op::PutByOffset(_) => {
            // The base is the second child of the three-child form.
            let base = if node.children.len() >= 3 { 1 } else { 0 };
            require_cell(node, base)
        }

        Op::CheckArray(mode) => match mode.array_type {
            ArrayType::Generic | ArrayType::ForceExit => Ok(()),
            _ => require_cell(node, 0),
        },
        Op::GetArrayLength(mode) => match mode.array_type {
            ArrayType::Int32
            | ArrayType::Double
            | ArrayType::Contiguous
            | ArrayType::String
            | ArrayType::DirectArguments
            | ArrayType::TypedArray(_) => require_cell(node, 0),
            _ => Err(Rejection::Shape("array length of this array mode")),
        },
        Op::GetByVal(mode) | Op::HasIndexedProperty(mode) => match mode.array_type {
            ArrayType::Generic | ArrayType::ScopedArguments | ArrayType::ForceExit => Ok(()),
            _ => {
                require_cell(node, 0)?;
                require(node, 1, is_index)
            }
        },
        Op::PutByVal(mode) => match mode.array_type {
            ArrayType::Generic
            | ArrayType::ScopedArguments
            | ArrayType::String
            | ArrayType::ForceExit => Ok(()),
            ArrayType::TypedArray(_) => {
                require_cell(node, 0)?;
                require(node, 1, is_index)?;
                require(node, 2, typed_store_accepts)
            }
            ArrayType::Double => {
                require_cell(node, 0)?;
                require(node, 1, is_index)?;
                require(node, 2, UseKind::is_double_rep)
            }
            _ => {
                require_cell(node, 0)?;
                require(node, 1, is_index)
            }
        },
        Op::ArrayPush(mode) | Op::ArrayPop(mode) => match mode.array_type {
            ArrayType::Int32 | ArrayType::Contiguous => require_cell(node, 0),
            ArrayType::Double => {
                require_cell(node, 0)?;
                if matches!(node.op, Op::ArrayPush(_)) {
                    require(node, 1, UseKind::is_double_rep)?;
                }
                Ok(())
            }
            _ => Err(Rejection::Shape("push or pop outside butterfly storage")),
        },
        Op::StringCharAt(mode) | Op::StringCharCodeAt(mode) => {
            if mode.array_type != ArrayType::String {
                return Err(Rejection::Shape("character access on a non-string mode"));
            }
            require_cell(node, 0)?;
            require(node, 1, is_index)
        }
        Op::GetIndexedPropertyStorage(_) => require_cell(node, 0),
        Op::NewArray(data) | Op::NewArrayWithSize(data) | Op::NewArrayBuffer(data, _) => {
            match data.indexing.shape() {
                IndexingType::INT32_SHAPE | IndexingType::CONTIGUOUS_SHAPE => Ok(()),
                IndexingType::DOUBLE_SHAPE => match &node.op {
                    Op::NewArray(_) => (0..node.children.len())
                        .try_for_each(|child| require(node, child, UseKind::is_double_rep)),
                    Op::NewArrayBuffer(_, elements) if elements.iter().any(|e| e.as_number().is_none()) => {
                        Err(Rejection::Shape("non-number constant in a double array"))
                    }
                    _ => Ok(()),
                },
                _ => Err(Rejection::Shape("array allocation with this indexing shape")),
            }
        }
        // Everything else reads boxed values or checks its own kinds.
        _ => Ok(()),
    }
}

/// Typed array stores convert int32, int52 and double operands.
fn typed_store_accepts(use_kind: UseKind) -> bool {
    is_int32(use_kind) || use_kind == UseKind::Int52Rep || use_kind.is_double_rep()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::{ArrayMode, Edge, FrozenValue, GraphBuilder, StackAccessData, FlushFormat, Operand};

    fn argument(b: &mut GraphBuilder, index: u32) -> NodeId {
        let entry = b.entry();
        b.add(
            entry,
            Op::GetStack(StackAccessData {
                local: Operand::Argument(index),
                machine_local: Operand::Argument(index),
                format: FlushFormat::JsValue,
            }),
            [],
            NodeResult::JsValue,
        )
    }

    fn finish(mut b: GraphBuilder, value: NodeId) -> Graph {
        let entry = b.entry();
        b.add(entry, Op::Return, [Edge::untyped(value)], NodeResult::None);
        b.build().expect("valid graph")
    }

    #[test]
    fn int32_bit_ops_compile() {
        let mut b = GraphBuilder::new("and", 3, 0);
        let x = argument(&mut b, 1);
        let y = argument(&mut b, 2);
        let entry = b.entry();
        let and = b.add(
            entry,
            Op::BitAnd,
            [Edge::new(x, UseKind::Int32), Edge::new(y, UseKind::Int32)],
            NodeResult::Int32,
        );
        let boxed = b.add(entry, Op::ValueRep, [Edge::new(and, UseKind::Int32)], NodeResult::JsValue);
        assert!(can_compile(&finish(b, boxed)).is_ok());
    }

    #[test]
    fn untyped_bit_op_is_rejected() {
        let mut b = GraphBuilder::new("or", 3, 0);
        let x = argument(&mut b, 1);
        let y = argument(&mut b, 2);
        let entry = b.entry();
        let or = b.add(
            entry,
            Op::BitOr,
            [Edge::new(x, UseKind::Int32), Edge::untyped(y)],
            NodeResult::Int32,
        );
        let boxed = b.add(entry, Op::ValueRep, [Edge::new(or, UseKind::Int32)], NodeResult::JsValue);
        let err = can_compile(&finish(b, boxed)).expect_err("untyped operand");
        assert!(matches!(
            err,
            JitError::UnsupportedUseKind {
                child: 1,
                use_kind: UseKind::Untyped,
                ..
            }
        ));
    }

    #[test]
    fn character_access_needs_a_string_mode() {
        let mut b = GraphBuilder::new("char", 3, 0);
        let s = argument(&mut b, 1);
        let i = argument(&mut b, 2);
        let entry = b.entry();
        let c = b.add(
            entry,
            Op::StringCharAt(ArrayMode::in_bounds(ArrayType::Contiguous)),
            [Edge::new(s, UseKind::String), Edge::new(i, UseKind::Int32)],
            NodeResult::JsValue,
        );
        let err = can_compile(&finish(b, c)).expect_err("contiguous mode");
        assert!(matches!(err, JitError::Unsupported { .. }));
    }

    #[test]
    fn array_storage_allocation_is_rejected() {
        let mut b = GraphBuilder::new("alloc", 1, 0);
        let entry = b.entry();
        let array = b.add(
            entry,
            Op::NewArrayBuffer(
                strata_ir::NewArrayData {
                    structure: strata_ir::StructureId(1),
                    indexing: IndexingType::new(IndexingType::ARRAY_STORAGE_SHAPE, true),
                },
                vec![FrozenValue::Int32(1)],
            ),
            [],
            NodeResult::JsValue,
        );
        assert!(can_compile(&finish(b, array)).is_err());
    }
}

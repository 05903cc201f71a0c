//! Arithmetic and bitwise operators.
//!
//! Int32 arithmetic follows the node's [`ArithMode`]: checked modes exit on
//! overflow (and on results that would be -0), unchecked modes wrap.
//! Division and remainder by zero, and `INT_MIN / -1`, are overflow in
//! checked modes and follow the chill semantics of the LIR otherwise.

use strata_ir::{ArithMode, Node, NodeId, NodeResult, Op, RoundingMode};

use super::values::double_to_int32_exact;
use super::{LowerCx, Repr};
use crate::exit::ExitKind;
use crate::helpers::HelperKind;
use crate::lir::{BinaryOp, FBinaryOp, FUnaryOp, FloatCC, IntCC, OverflowOp, UnaryOp, Value};

fn unexpected(cx: &LowerCx<'_>, node: &Node) -> ! {
    cx.crash(format_args!("{} with a {:?} result", node.op.name(), node.result))
}

/// `I32` flag: `lhs < 0 || rhs < 0`.
fn either_negative(cx: &mut LowerCx<'_>, lhs: Value, rhs: Value) -> Value {
    let both = cx.b.or(lhs, rhs);
    cx.b.icmp_imm(IntCC::Slt, both, 0)
}

/// `ArithAdd` and `ArithSub`.
pub(crate) fn add_or_sub(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode, subtract: bool) {
    let (op, overflow) = if subtract {
        (BinaryOp::Sub, OverflowOp::Sub)
    } else {
        (BinaryOp::Add, OverflowOp::Add)
    };
    match node.result {
        NodeResult::Int32 => {
            let lhs = cx.lower_int32(node.child1());
            let rhs = cx.lower_int32(node.child2());
            if cx.exit_only.contains(&id) {
                // Only exits read this value; they recompute it from the operands.
                return;
            }
            if mode.should_check_overflow() {
                let overflowed = cx.b.overflows(overflow, lhs, rhs);
                cx.speculate(ExitKind::Overflow, None, overflowed);
            }
            let result = cx.b.binary(op, lhs, rhs);
            cx.set_result(id, result);
        }
        NodeResult::Int52 => {
            let lhs = cx.lower_int52(node.child1());
            let rhs = cx.lower_int52(node.child2());
            if mode.should_check_overflow() {
                let overflowed = cx.b.overflows(overflow, lhs, rhs);
                cx.speculate(ExitKind::Int52Overflow, None, overflowed);
            }
            let result = cx.b.binary(op, lhs, rhs);
            cx.set_value(id, Repr::Int52, result);
        }
        NodeResult::Double => {
            let lhs = cx.lower_double(node.child1());
            let rhs = cx.lower_double(node.child2());
            let op = if subtract { FBinaryOp::Sub } else { FBinaryOp::Add };
            let result = cx.b.fbinary(op, lhs, rhs);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// `ArithMul`.
pub(crate) fn mul(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    match node.result {
        NodeResult::Int32 => {
            let lhs = cx.lower_int32(node.child1());
            let rhs = cx.lower_int32(node.child2());
            if mode.should_check_overflow() {
                let overflowed = cx.b.overflows(OverflowOp::Mul, lhs, rhs);
                cx.speculate(ExitKind::Overflow, None, overflowed);
            }
            let result = cx.b.binary(BinaryOp::Mul, lhs, rhs);
            if mode.should_check_negative_zero() {
                let zero = cx.b.icmp_imm(IntCC::Eq, result, 0);
                let negative = either_negative(cx, lhs, rhs);
                let negative_zero = cx.b.and(zero, negative);
                cx.speculate(ExitKind::NegativeZero, None, negative_zero);
            }
            cx.set_result(id, result);
        }
        NodeResult::Int52 => {
            let lhs = cx.lower_int52(node.child1());
            let rhs = cx.lower_strict_int52(node.child2());
            if mode.should_check_overflow() {
                let overflowed = cx.b.overflows(OverflowOp::Mul, lhs, rhs);
                cx.speculate(ExitKind::Int52Overflow, None, overflowed);
            }
            let result = cx.b.binary(BinaryOp::Mul, lhs, rhs);
            if mode.should_check_negative_zero() {
                let zero = cx.b.icmp_imm(IntCC::Eq, result, 0);
                let negative = either_negative(cx, lhs, rhs);
                let negative_zero = cx.b.and(zero, negative);
                cx.speculate(ExitKind::NegativeZero, None, negative_zero);
            }
            cx.set_value(id, Repr::Int52, result);
        }
        NodeResult::Double => {
            let lhs = cx.lower_double(node.child1());
            let rhs = cx.lower_double(node.child2());
            let result = cx.b.fbinary(FBinaryOp::Mul, lhs, rhs);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// Exit with `Overflow` when the denominator is zero or the division is
/// `INT_MIN / -1`.
fn check_division_overflow(cx: &mut LowerCx<'_>, numerator: Value, denominator: Value) {
    let zero = cx.b.icmp_imm(IntCC::Eq, denominator, 0);
    let min = cx.b.icmp_imm(IntCC::Eq, numerator, i32::MIN as i64);
    let minus_one = cx.b.icmp_imm(IntCC::Eq, denominator, -1);
    let min_by_minus_one = cx.b.and(min, minus_one);
    let overflowed = cx.b.or(zero, min_by_minus_one);
    cx.speculate(ExitKind::Overflow, None, overflowed);
}

/// `ArithDiv`.
pub(crate) fn div(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    match node.result {
        NodeResult::Int32 => {
            let numerator = cx.lower_int32(node.child1());
            let denominator = cx.lower_int32(node.child2());
            if mode.should_check_overflow() {
                check_division_overflow(cx, numerator, denominator);
            }
            if mode.should_check_negative_zero() {
                let zero = cx.b.icmp_imm(IntCC::Eq, numerator, 0);
                let negative = cx.b.icmp_imm(IntCC::Slt, denominator, 0);
                let negative_zero = cx.b.and(zero, negative);
                cx.speculate(ExitKind::NegativeZero, None, negative_zero);
            }
            let quotient = cx.b.binary(BinaryOp::SDiv, numerator, denominator);
            if mode.should_check_overflow() {
                // A fractional quotient is not an int32 result.
                let product = cx.b.binary(BinaryOp::Mul, quotient, denominator);
                let inexact = cx.b.icmp(IntCC::Ne, product, numerator);
                cx.speculate(ExitKind::Overflow, None, inexact);
            }
            cx.set_result(id, quotient);
        }
        NodeResult::Double => {
            let lhs = cx.lower_double(node.child1());
            let rhs = cx.lower_double(node.child2());
            let result = cx.b.fbinary(FBinaryOp::Div, lhs, rhs);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// `ArithMod`.
pub(crate) fn modulo(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    match node.result {
        NodeResult::Int32 => {
            let numerator = cx.lower_int32(node.child1());
            let denominator = cx.lower_int32(node.child2());
            if mode.should_check_overflow() {
                check_division_overflow(cx, numerator, denominator);
            }
            let remainder = cx.b.binary(BinaryOp::SRem, numerator, denominator);
            if mode.should_check_negative_zero() {
                let zero = cx.b.icmp_imm(IntCC::Eq, remainder, 0);
                let negative = cx.b.icmp_imm(IntCC::Slt, numerator, 0);
                let negative_zero = cx.b.and(zero, negative);
                cx.speculate(ExitKind::NegativeZero, None, negative_zero);
            }
            cx.set_result(id, remainder);
        }
        NodeResult::Double => {
            let lhs = cx.lower_double(node.child1());
            let rhs = cx.lower_double(node.child2());
            let lhs = cx.b.bitcast_to_int(lhs);
            let rhs = cx.b.bitcast_to_int(rhs);
            let bits = cx.call_helper(HelperKind::Fmod, &[lhs, rhs]);
            let result = cx.b.bitcast_to_double(bits);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// `ArithNegate`.
pub(crate) fn negate(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    match node.result {
        NodeResult::Int32 => {
            let value = cx.lower_int32(node.child1());
            if mode.should_check_overflow() {
                let min = cx.b.icmp_imm(IntCC::Eq, value, i32::MIN as i64);
                cx.speculate(ExitKind::Overflow, None, min);
            }
            if mode.should_check_negative_zero() {
                let zero = cx.b.icmp_imm(IntCC::Eq, value, 0);
                cx.speculate(ExitKind::NegativeZero, None, zero);
            }
            let result = cx.b.unary(UnaryOp::Neg, value);
            cx.set_result(id, result);
        }
        NodeResult::Int52 => {
            let value = cx.lower_int52(node.child1());
            if mode.should_check_overflow() {
                let zero = cx.b.i64(0);
                let overflowed = cx.b.overflows(OverflowOp::Sub, zero, value);
                cx.speculate(ExitKind::Int52Overflow, None, overflowed);
            }
            if mode.should_check_negative_zero() {
                let zero = cx.b.icmp_imm(IntCC::Eq, value, 0);
                cx.speculate(ExitKind::NegativeZero, None, zero);
            }
            let result = cx.b.unary(UnaryOp::Neg, value);
            cx.set_value(id, Repr::Int52, result);
        }
        NodeResult::Double => {
            let value = cx.lower_double(node.child1());
            let result = cx.b.funary(FUnaryOp::Neg, value);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// `ArithAbs`.
pub(crate) fn abs(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    match node.result {
        NodeResult::Int32 => {
            let value = cx.lower_int32(node.child1());
            let sign = cx.b.sshr_imm(value, 31);
            let flipped = cx.b.xor(value, sign);
            let result = cx.b.sub(flipped, sign);
            if mode.should_check_overflow() {
                let negative = cx.b.icmp_imm(IntCC::Slt, result, 0);
                cx.speculate(ExitKind::Overflow, None, negative);
            }
            cx.set_result(id, result);
        }
        NodeResult::Double => {
            let value = cx.lower_double(node.child1());
            let result = cx.b.funary(FUnaryOp::Abs, value);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// `ArithMin` and `ArithMax`.
pub(crate) fn min_max(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, max: bool) {
    match node.result {
        NodeResult::Int32 => {
            let lhs = cx.lower_int32(node.child1());
            let rhs = cx.lower_int32(node.child2());
            let cc = if max { IntCC::Sgt } else { IntCC::Slt };
            let pick_lhs = cx.b.icmp(cc, lhs, rhs);
            let result = cx.b.select(pick_lhs, lhs, rhs);
            cx.set_result(id, result);
        }
        NodeResult::Double => {
            let lhs = cx.lower_double(node.child1());
            let rhs = cx.lower_double(node.child2());
            let op = if max { FBinaryOp::Max } else { FBinaryOp::Min };
            let result = cx.b.fbinary(op, lhs, rhs);
            cx.set_result(id, result);
        }
        _ => unexpected(cx, node),
    }
}

/// One-operand math on doubles.
pub(crate) fn unary_math(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let value = cx.lower_double(node.child1());
    let result = match node.op {
        Op::ArithSqrt => cx.b.funary(FUnaryOp::Sqrt, value),
        Op::ArithFRound => cx.b.funary(FUnaryOp::Demote, value),
        Op::ArithSin | Op::ArithCos | Op::ArithLog => {
            let helper = match node.op {
                Op::ArithSin => HelperKind::Sin,
                Op::ArithCos => HelperKind::Cos,
                _ => HelperKind::Log,
            };
            let bits = cx.b.bitcast_to_int(value);
            let bits = cx.call_helper(helper, &[bits]);
            cx.b.bitcast_to_double(bits)
        }
        _ => unexpected(cx, node),
    };
    cx.set_result(id, result);
}

/// `ArithPow`.
pub(crate) fn pow(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let base = cx.lower_double(node.child1());
    let exponent = cx.lower_double(node.child2());
    let base = cx.b.bitcast_to_int(base);
    let exponent = cx.b.bitcast_to_int(exponent);
    let bits = cx.call_helper(HelperKind::Pow, &[base, exponent]);
    let result = cx.b.bitcast_to_double(bits);
    cx.set_result(id, result);
}

/// `ArithRound`: `Math.round`, rounding halves toward +infinity.
pub(crate) fn round(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: RoundingMode) {
    let value = cx.lower_double(node.child1());
    let ceiling = cx.b.funary(FUnaryOp::Ceil, value);
    let half = cx.b.f64(0.5);
    let one = cx.b.f64(1.0);
    let threshold = cx.b.fbinary(FBinaryOp::Sub, ceiling, half);
    let too_high = cx.b.fcmp(FloatCC::Gt, threshold, value);
    let lowered = cx.b.fbinary(FBinaryOp::Sub, ceiling, one);
    let rounded = cx.b.select(too_high, lowered, ceiling);
    let result = match mode {
        RoundingMode::Double => rounded,
        RoundingMode::Int32 => double_to_int32_exact(cx, rounded, false),
        RoundingMode::Int32WithNegativeZeroCheck => double_to_int32_exact(cx, rounded, true),
    };
    cx.set_result(id, result);
}

/// `ArithClz32`.
pub(crate) fn clz32(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let value = cx.lower_int32(node.child1());
    let result = cx.b.unary(UnaryOp::Clz, value);
    cx.set_result(id, result);
}

/// `ValueAdd`: generic `+`.
pub(crate) fn value_add(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let lhs = cx.lower_js_value(node.child1());
    let rhs = cx.lower_js_value(node.child2());
    let result = cx.call_helper(HelperKind::ValueAdd, &[lhs, rhs]);
    cx.set_result(id, result);
}

/// Int32 bitwise operators.
pub(crate) fn bitop(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let lhs = cx.lower_int32(node.child1());
    let rhs = cx.lower_int32(node.child2());
    let op = match node.op {
        Op::BitAnd => BinaryOp::And,
        Op::BitOr => BinaryOp::Or,
        Op::BitXor => BinaryOp::Xor,
        Op::BitLShift => BinaryOp::Shl,
        Op::BitRShift => BinaryOp::SShr,
        _ => BinaryOp::UShr,
    };
    let result = cx.b.binary(op, lhs, rhs);
    cx.set_result(id, result);
}

#[cfg(test)]
mod tests {
    use crate::config::LoweringOptions;
    use crate::exit::ExitKind;
    use crate::lir::eval::EvalOutcome;
    use crate::lower::LoweredFunction;
    use crate::testing;
    use crate::value::box_int32;
    use strata_ir::{ArithMode, Edge, GraphBuilder, NodeResult, Op, UseKind};

    /// `return a <op> b` over int32-speculated arguments.
    fn binary(op: Op) -> LoweredFunction {
        let mut b = GraphBuilder::new("binary", 3, 0);
        let entry = b.entry();
        let x = testing::get_argument(&mut b, entry, 1);
        let y = testing::get_argument(&mut b, entry, 2);
        let result = b.add(
            entry,
            op,
            [Edge::new(x, UseKind::Int32), Edge::new(y, UseKind::Int32)],
            NodeResult::Int32,
        );
        let boxed = b.add(entry, Op::ValueRep, [Edge::new(result, UseKind::Int32)], NodeResult::JsValue);
        b.add(entry, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
        let graph = b.build().expect("valid graph");
        testing::lower_default(&graph, &LoweringOptions::default())
    }

    fn exit_kind(lowered: &LoweredFunction, x: i32, y: i32) -> Option<ExitKind> {
        match testing::run(lowered, &[box_int32(x), box_int32(y)]) {
            EvalOutcome::Exited { exit, .. } => Some(lowered.exits.exits[exit.0 as usize].kind),
            _ => None,
        }
    }

    #[test]
    fn min_divided_by_minus_one_overflows() {
        let lowered = binary(Op::ArithDiv(ArithMode::CheckOverflow));
        assert_eq!(exit_kind(&lowered, i32::MIN, -1), Some(ExitKind::Overflow));
        assert_eq!(exit_kind(&lowered, 1, 0), Some(ExitKind::Overflow));
        assert_eq!(exit_kind(&lowered, 7, 2), Some(ExitKind::Overflow));
        assert_eq!(
            testing::run(&lowered, &[box_int32(6), box_int32(-2)]),
            EvalOutcome::Returned(box_int32(-3))
        );
    }

    #[test]
    fn min_modulo_minus_one_overflows() {
        let lowered = binary(Op::ArithMod(ArithMode::CheckOverflow));
        assert_eq!(exit_kind(&lowered, i32::MIN, -1), Some(ExitKind::Overflow));
        assert_eq!(exit_kind(&lowered, 5, 0), Some(ExitKind::Overflow));
        assert_eq!(
            testing::run(&lowered, &[box_int32(-7), box_int32(2)]),
            EvalOutcome::Returned(box_int32(-1))
        );
    }

    #[test]
    fn zero_times_negative_is_negative_zero() {
        let lowered = binary(Op::ArithMul(ArithMode::CheckOverflowAndNegativeZero));
        assert_eq!(exit_kind(&lowered, 0, -1), Some(ExitKind::NegativeZero));
        assert_eq!(exit_kind(&lowered, -4, 0), Some(ExitKind::NegativeZero));
        assert_eq!(exit_kind(&lowered, i32::MAX, 2), Some(ExitKind::Overflow));
        assert_eq!(
            testing::run(&lowered, &[box_int32(3), box_int32(-2)]),
            EvalOutcome::Returned(box_int32(-6))
        );
        assert_eq!(
            testing::run(&lowered, &[box_int32(0), box_int32(5)]),
            EvalOutcome::Returned(box_int32(0))
        );
    }

    #[test]
    fn unchecked_multiply_wraps_and_keeps_zero() {
        let lowered = binary(Op::ArithMul(ArithMode::Unchecked));
        assert_eq!(
            testing::run(&lowered, &[box_int32(0), box_int32(-1)]),
            EvalOutcome::Returned(box_int32(0))
        );
        assert_eq!(
            testing::run(&lowered, &[box_int32(i32::MAX), box_int32(2)]),
            EvalOutcome::Returned(box_int32(-2))
        );
    }
}

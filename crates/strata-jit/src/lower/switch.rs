//! `Switch` lowering.
//!
//! Immediate and character switches become LIR switches. String switches
//! over short one-byte cases become a discrimination tree: a switch on the
//! length, then for each group the characters all remaining cases share are
//! compared, then a switch on the first character where they differ, and so
//! on. Anything else asks the runtime for the case index.

use rustc_hash::{FxHashMap, FxHashSet};
use strata_ir::{BlockIndex, CellType, Node, SwitchData, SwitchKind, SwitchValue, UseKind};
use tracing::trace;

use super::LowerCx;
use crate::config::LoweringOptions;
use crate::helpers::HelperKind;
use crate::lir::{BlockId, BranchWeight, FloatCC, IntCC, MemWidth, Type, Value};
use crate::object_layout::{FieldKind, string_flags};

/// LIR targets of a switch, one edge block per graph target.
struct Targets {
    blocks: FxHashMap<BlockIndex, BlockId>,
    default: BlockId,
}

impl Targets {
    fn new(cx: &mut LowerCx<'_>, data: &SwitchData) -> Self {
        let mut blocks = FxHashMap::default();
        for case in &data.cases {
            if !blocks.contains_key(&case.target) {
                let block = cx.successor_block(case.target);
                blocks.insert(case.target, block);
            }
        }
        let default = match blocks.get(&data.fall_through) {
            Some(&block) => block,
            None => cx.successor_block(data.fall_through),
        };
        Self { blocks, default }
    }

    fn get(&self, target: BlockIndex) -> BlockId {
        self.blocks.get(&target).copied().unwrap_or(self.default)
    }
}

pub(crate) fn lower_switch(cx: &mut LowerCx<'_>, node: &Node, data: &SwitchData) {
    match data.kind {
        SwitchKind::Imm => switch_imm(cx, node, data),
        SwitchKind::Char => switch_char(cx, node, data),
        SwitchKind::String => switch_string(cx, node, data),
        SwitchKind::Cell => switch_cell(cx, node, data),
    }
}

/// Int32 keys in case order; a repeated key keeps its first target.
fn int_cases(data: &SwitchData, targets: &Targets) -> Vec<(i32, BlockId)> {
    let mut seen = FxHashSet::default();
    let mut cases = Vec::with_capacity(data.cases.len());
    for case in &data.cases {
        let key = match case.value {
            SwitchValue::Int(value) => value,
            SwitchValue::Char(code) => code as i32,
            _ => continue,
        };
        if seen.insert(key) {
            cases.push((key, targets.get(case.target)));
        }
    }
    cases
}

fn switch_imm(cx: &mut LowerCx<'_>, node: &Node, data: &SwitchData) {
    let edge = node.child1();
    if matches!(edge.use_kind, UseKind::Int32 | UseKind::KnownInt32) {
        let value = cx.lower_int32(edge);
        let targets = Targets::new(cx, data);
        let cases = int_cases(data, &targets);
        cx.b.switch(value, cases, targets.default);
        return;
    }

    let value = cx.lower_js_value(edge);
    let targets = Targets::new(cx, data);
    let cases = int_cases(data, &targets);

    let int_block = cx.b.create_block();
    let not_int = cx.b.create_block();
    let is_int = cx.is_int32(value);
    cx.b.branch(is_int, int_block, not_int, BranchWeight::Normal);

    cx.b.switch_to(int_block);
    let narrow = cx.b.trunc(value);
    cx.b.switch(narrow, cases.clone(), targets.default);

    // Doubles holding an integral value match too, -0 included.
    cx.b.switch_to(not_int);
    let double_block = cx.b.create_block();
    let is_number = cx.is_number(value);
    cx.b.branch(is_number, double_block, targets.default, BranchWeight::Normal);
    cx.b.switch_to(double_block);
    let double = cx.unbox_double(value);
    let truncated = cx.b.double_to_int(Type::I32, double);
    let back = cx.b.int_to_double(true, truncated);
    let exact = cx.b.fcmp(FloatCC::Eq, back, double);
    let exact_block = cx.b.create_block();
    cx.b.branch(exact, exact_block, targets.default, BranchWeight::Normal);
    cx.b.switch_to(exact_block);
    cx.b.switch(truncated, cases, targets.default);
}

/// Branch to `default` unless `value` is a string cell. Only used for
/// untyped switch operands, where anything else simply matches no case.
fn require_string(cx: &mut LowerCx<'_>, value: Value, default: BlockId) {
    let cell_block = cx.b.create_block();
    let string_block = cx.b.create_block();
    let is_cell = cx.is_cell(value);
    cx.b.branch(is_cell, cell_block, default, BranchWeight::Normal);
    cx.b.switch_to(cell_block);
    let is_string = cx.has_cell_type(value, CellType::String);
    cx.b.branch(is_string, string_block, default, BranchWeight::Normal);
    cx.b.switch_to(string_block);
}

/// Lower the operand of a string-keyed switch. Returns the string cell and
/// the switch targets.
fn string_operand(cx: &mut LowerCx<'_>, node: &Node, data: &SwitchData) -> (Value, Targets) {
    let edge = node.child1();
    match edge.use_kind {
        UseKind::String | UseKind::KnownString | UseKind::StringIdent => {
            let string = cx.lower_js_value(edge);
            let targets = Targets::new(cx, data);
            (string, targets)
        }
        UseKind::Untyped => {
            let value = cx.lower_js_value(edge);
            let targets = Targets::new(cx, data);
            require_string(cx, value, targets.default);
            (value, targets)
        }
        other => cx.crash(format_args!("string switch on a {other:?} edge")),
    }
}

/// Ask the runtime which case `string` matches and switch on the answer.
fn lookup_in_runtime(cx: &mut LowerCx<'_>, data: &SwitchData, targets: &Targets, string: Value) {
    let table = cx.b.i64(data.table_index as i64);
    let index = cx.call_helper(HelperKind::SwitchStringLookup, &[table, string]);
    let index = cx.b.trunc(index);
    let cases = data
        .cases
        .iter()
        .enumerate()
        .map(|(index, case)| (index as i32, targets.get(case.target)))
        .collect();
    cx.b.switch(index, cases, targets.default);
}

fn switch_char(cx: &mut LowerCx<'_>, node: &Node, data: &SwitchData) {
    let (string, targets) = string_operand(cx, node, data);
    let imp = cx.b.load64(string, cx.layout.field_offset(FieldKind::StringImpl));

    let rope = cx.b.icmp_imm(IntCC::Eq, imp, 0);
    let resolved = cx.b.create_block();
    let rope_block = cx.b.create_block();
    cx.b.branch(rope, rope_block, resolved, BranchWeight::TakenRare);
    cx.b.switch_to(rope_block);
    lookup_in_runtime(cx, data, &targets, string);

    cx.b.switch_to(resolved);
    let length = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplLength));
    let single = cx.b.icmp_imm(IntCC::Eq, length, 1);
    let single_block = cx.b.create_block();
    cx.b.branch(single, single_block, targets.default, BranchWeight::Normal);
    cx.b.switch_to(single_block);

    let chars = cx.b.load64(imp, cx.layout.field_offset(FieldKind::StringImplData));
    let flags = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplFlags));
    let eight_bit = cx.b.and_imm(flags, string_flags::IS_8BIT as i64);
    let eight_bit = cx.b.icmp_imm(IntCC::Ne, eight_bit, 0);
    let code = cx.diamond(
        Type::I32,
        eight_bit,
        BranchWeight::Normal,
        |cx| cx.b.load8(chars, 0),
        |cx| cx.b.load(Type::I32, MemWidth::W16, false, chars, 0),
    );
    let cases = int_cases(data, &targets);
    cx.b.switch(code, cases, targets.default);
}

fn switch_cell(cx: &mut LowerCx<'_>, node: &Node, data: &SwitchData) {
    let value = cx.lower_js_value(node.child1());
    let targets = Targets::new(cx, data);
    for case in &data.cases {
        let SwitchValue::Cell(address) = case.value else {
            cx.crash(format_args!("cell switch with a {:?} case", case.value));
        };
        let matches = cx.b.icmp_imm(IntCC::Eq, value, address as i64);
        let next = cx.b.create_block();
        cx.b.branch(matches, targets.get(case.target), next, BranchWeight::Normal);
        cx.b.switch_to(next);
    }
    cx.b.jump(targets.default, Vec::new());
}

/// One byte-string case of a discrimination tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StringCase {
    pub(crate) bytes: Vec<u8>,
    pub(crate) target: BlockIndex,
}

/// Cases of a string switch when they qualify for a discrimination tree:
/// every case is one-byte and short, the total length is bounded, and
/// repeated strings keep their first target.
pub(crate) fn tree_cases(data: &SwitchData, options: &LoweringOptions) -> Option<Vec<StringCase>> {
    let mut cases: Vec<StringCase> = Vec::with_capacity(data.cases.len());
    let mut total = 0;
    for case in &data.cases {
        let SwitchValue::String(text) = &case.value else {
            return None;
        };
        let bytes = text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).ok())
            .collect::<Option<Vec<u8>>>()?;
        if bytes.len() > options.max_string_switch_case_length {
            return None;
        }
        total += bytes.len();
        if total > options.max_string_switch_total_length {
            return None;
        }
        if cases.iter().all(|existing| existing.bytes != bytes) {
            cases.push(StringCase {
                bytes,
                target: case.target,
            });
        }
    }
    Some(cases)
}

/// Shape of a discrimination tree node, computed without emitting code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Every remaining case starts with `prefix` at the current position.
    /// When only one case is left, it matched; otherwise switch on the next
    /// character.
    Prefix { prefix: Vec<u8>, then: Box<Decision> },
    /// Switch on the character at `position`.
    Char {
        position: usize,
        arms: Vec<(u8, Decision)>,
    },
    /// The string matched this case.
    Matched(BlockIndex),
}

/// Build the tree for `cases`, all of the same length, from `depth` on.
pub(crate) fn decide(cases: &[StringCase], depth: usize) -> Decision {
    let length = cases.first().map_or(depth, |case| case.bytes.len());
    let first = &cases[0].bytes;
    let mut common = depth;
    while common < length && cases.iter().all(|case| case.bytes[common] == first[common]) {
        common += 1;
    }
    let rest = if common == length {
        Decision::Matched(cases[0].target)
    } else {
        let mut arms: Vec<(u8, Vec<StringCase>)> = Vec::new();
        for case in cases {
            let key = case.bytes[common];
            match arms.iter_mut().find(|(byte, _)| *byte == key) {
                Some((_, group)) => group.push(case.clone()),
                None => arms.push((key, vec![case.clone()])),
            }
        }
        arms.sort_by_key(|(byte, _)| *byte);
        Decision::Char {
            position: common,
            arms: arms
                .into_iter()
                .map(|(byte, group)| (byte, decide(&group, common + 1)))
                .collect(),
        }
    };
    if common == depth {
        rest
    } else {
        Decision::Prefix {
            prefix: first[depth..common].to_vec(),
            then: Box::new(rest),
        }
    }
}

/// Cases grouped by length, shortest first.
pub(crate) fn group_by_length(cases: &[StringCase]) -> Vec<(usize, Vec<StringCase>)> {
    let mut groups: Vec<(usize, Vec<StringCase>)> = Vec::new();
    for case in cases {
        let length = case.bytes.len();
        match groups.iter_mut().find(|(l, _)| *l == length) {
            Some((_, group)) => group.push(case.clone()),
            None => groups.push((length, vec![case.clone()])),
        }
    }
    groups.sort_by_key(|(length, _)| *length);
    groups
}

fn switch_string(cx: &mut LowerCx<'_>, node: &Node, data: &SwitchData) {
    let (string, targets) = string_operand(cx, node, data);
    let Some(cases) = tree_cases(data, cx.options) else {
        trace!(target: "strata::lower", cases = data.cases.len(), "string switch through runtime lookup");
        lookup_in_runtime(cx, data, &targets, string);
        return;
    };

    let imp = cx.b.load64(string, cx.layout.field_offset(FieldKind::StringImpl));
    let flags_offset = cx.layout.field_offset(FieldKind::StringImplFlags);

    // Ropes and two-byte strings take the runtime path.
    let fast = cx.b.create_block();
    let slow = cx.b.create_block();
    let rope = cx.b.icmp_imm(IntCC::Eq, imp, 0);
    let resolved = cx.b.create_block();
    cx.b.branch(rope, slow, resolved, BranchWeight::TakenRare);
    cx.b.switch_to(resolved);
    let flags = cx.b.load32(imp, flags_offset);
    let eight_bit = cx.b.and_imm(flags, string_flags::IS_8BIT as i64);
    cx.b.branch(eight_bit, fast, slow, BranchWeight::Normal);

    cx.b.switch_to(slow);
    lookup_in_runtime(cx, data, &targets, string);

    cx.b.switch_to(fast);
    let length = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplLength));
    let chars = cx.b.load64(imp, cx.layout.field_offset(FieldKind::StringImplData));
    let groups = group_by_length(&cases);
    let mut length_cases = Vec::with_capacity(groups.len());
    let mut pending = Vec::with_capacity(groups.len());
    for (group_length, group) in groups {
        let block = cx.b.create_block();
        length_cases.push((group_length as i32, block));
        pending.push((block, decide(&group, 0)));
    }
    cx.b.switch(length, length_cases, targets.default);
    for (block, tree) in pending {
        cx.b.switch_to(block);
        emit_decision(cx, &tree, chars, 0, &targets);
    }
}

fn emit_decision(cx: &mut LowerCx<'_>, tree: &Decision, chars: Value, depth: usize, targets: &Targets) {
    match tree {
        Decision::Matched(target) => cx.b.jump(targets.get(*target), Vec::new()),
        Decision::Prefix { prefix, then } => {
            for (index, &byte) in prefix.iter().enumerate() {
                let loaded = cx.b.load8(chars, (depth + index) as i32);
                let equal = cx.b.icmp_imm(IntCC::Eq, loaded, byte as i64);
                let next = cx.b.create_block();
                cx.b.branch(equal, next, targets.default, BranchWeight::Normal);
                cx.b.switch_to(next);
            }
            emit_decision(cx, then, chars, depth + prefix.len(), targets);
        }
        Decision::Char { position, arms } => {
            let loaded = cx.b.load8(chars, *position as i32);
            let mut cases = Vec::with_capacity(arms.len());
            let mut pending = Vec::with_capacity(arms.len());
            for (byte, next) in arms {
                let block = cx.b.create_block();
                cases.push((*byte as i32, block));
                pending.push((block, next));
            }
            cx.b.switch(loaded, cases, targets.default);
            for (block, next) in pending {
                cx.b.switch_to(block);
                emit_decision(cx, next, chars, position + 1, targets);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::eval::EvalOutcome;
    use crate::lower::LoweredFunction;
    use crate::object_layout::DefaultObjectLayout;
    use crate::testing;
    use crate::value::{box_int32, unbox_int32};
    use strata_ir::{Edge, FrozenValue, Graph, GraphBuilder, NodeResult, Op, SwitchCase};

    fn data(cases: &[(&str, u32)]) -> SwitchData {
        SwitchData {
            kind: SwitchKind::String,
            cases: cases
                .iter()
                .map(|(text, target)| SwitchCase {
                    value: SwitchValue::String((*text).to_string()),
                    target: BlockIndex(*target),
                })
                .collect(),
            fall_through: BlockIndex(99),
            table_index: 0,
        }
    }

    fn linear_scan(data: &SwitchData, input: &str) -> BlockIndex {
        data.cases
            .iter()
            .find(|case| matches!(&case.value, SwitchValue::String(text) if text == input))
            .map_or(data.fall_through, |case| case.target)
    }

    /// `switch (s)` where case block `n` returns `n`.
    fn switch_graph(table: &SwitchData) -> Graph {
        let blocks = table
            .cases
            .iter()
            .map(|case| case.target.0)
            .chain([table.fall_through.0])
            .max()
            .unwrap_or(0);
        let mut b = GraphBuilder::new("switch", 2, 0);
        let entry = b.entry();
        let targets: Vec<BlockIndex> = (0..blocks).map(|_| b.block()).collect();
        let s = testing::get_argument(&mut b, entry, 1);
        b.add(entry, Op::Switch(table.clone()), [Edge::untyped(s)], NodeResult::None);
        for target in targets {
            let n = b.add(
                target,
                Op::JsConstant(FrozenValue::Int32(target.0 as i32)),
                [],
                NodeResult::JsValue,
            );
            b.add(target, Op::Return, [Edge::untyped(n)], NodeResult::None);
        }
        b.build().expect("valid graph")
    }

    fn run_switch(lowered: &LoweredFunction, input: &str) -> BlockIndex {
        let string = 0x20_0000;
        let mut memory = testing::frame_memory(&[string]);
        testing::write_string(&mut memory, &DefaultObjectLayout, string, input);
        match testing::run_in(lowered, &mut memory) {
            EvalOutcome::Returned(bits) => BlockIndex(unbox_int32(bits) as u32),
            other => panic!("switch on {input:?} ended with {other:?}"),
        }
    }

    #[test]
    fn emitted_tree_agrees_with_linear_scan() {
        let table = data(&[
            ("get", 1),
            ("set", 2),
            ("getter", 3),
            ("setter", 4),
            ("", 5),
            ("gel", 6),
            ("get", 7),
            ("abcx", 8),
            ("abcy", 9),
        ]);
        let table = SwitchData {
            fall_through: BlockIndex(10),
            ..table
        };
        assert!(tree_cases(&table, &LoweringOptions::default()).is_some());
        let lowered = testing::lower_default(&switch_graph(&table), &LoweringOptions::default());
        for input in [
            "get", "set", "getter", "setter", "", "gel", "abcx", "abcy", "abcz", "abc", "ge", "gex",
            "sett", "x", "gettex",
        ] {
            assert_eq!(run_switch(&lowered, input), linear_scan(&table, input), "{input:?}");
        }
    }

    #[test]
    fn non_strings_fall_through() {
        let table = SwitchData {
            fall_through: BlockIndex(2),
            ..data(&[("a", 1)])
        };
        let lowered = testing::lower_default(&switch_graph(&table), &LoweringOptions::default());
        assert_eq!(testing::run(&lowered, &[box_int32(1)]), EvalOutcome::Returned(box_int32(2)));
    }

    #[test]
    fn shared_prefix_is_compared_once() {
        let cases = tree_cases(&data(&[("abcx", 1), ("abcy", 2)]), &LoweringOptions::default())
            .expect("eligible");
        let tree = decide(&cases, 0);
        let Decision::Prefix { prefix, then } = tree else {
            panic!("expected a prefix node");
        };
        assert_eq!(prefix, b"abc");
        assert!(matches!(*then, Decision::Char { position: 3, .. }));
    }

    #[test]
    fn long_or_wide_cases_use_the_runtime() {
        let options = LoweringOptions {
            max_string_switch_case_length: 4,
            ..LoweringOptions::default()
        };
        assert!(tree_cases(&data(&[("short", 1)]), &options).is_none());
        assert!(tree_cases(&data(&[("\u{3b1}", 1)]), &LoweringOptions::default()).is_none());
    }
}

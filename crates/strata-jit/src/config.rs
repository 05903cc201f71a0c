//! Lowering options.

/// How exit records treat operands the unoptimized tier considers dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitLivenessMode {
    /// Dead operands are recorded as [`ExitValue::Dead`](crate::exit::ExitValue::Dead).
    #[default]
    Pruned,
    /// Every operand with an available value is recorded.
    Conservative,
}

/// Knobs of one lowering pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringOptions {
    /// Treatment of dead operands in exit records.
    pub exit_liveness: ExitLivenessMode,
    /// Crash when a live operand would be recorded as dead.
    pub validate_exit_liveness: bool,
    /// Longest case string a binary string switch accepts.
    pub max_string_switch_case_length: usize,
    /// Largest total case length a binary string switch accepts.
    pub max_string_switch_total_length: usize,
    /// Largest array length allocated inline.
    pub max_inline_array_allocation: u32,
    /// Int52 arithmetic is lowered natively rather than through doubles.
    pub enable_int52: bool,
    /// Structure sets larger than this widen to top in the abstract state.
    pub max_structure_set_size: usize,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self {
            exit_liveness: ExitLivenessMode::Pruned,
            validate_exit_liveness: cfg!(debug_assertions),
            max_string_switch_case_length: 50,
            max_string_switch_total_length: 2000,
            max_inline_array_allocation: 64,
            enable_int52: true,
            max_structure_set_size: 8,
        }
    }
}

impl LoweringOptions {
    /// Options recording every available operand at exits.
    pub fn conservative() -> Self {
        Self {
            exit_liveness: ExitLivenessMode::Conservative,
            ..Self::default()
        }
    }
}

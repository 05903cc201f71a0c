//! Worklist configuration.
//!
//! Only the scheduler reads the environment. The lowering pass takes all of
//! its knobs through [`LoweringOptions`](strata_jit::LoweringOptions).

/// Worker count of the baseline tier-up worklist.
pub const WORKLIST_THREADS_VAR: &str = "STRATA_WORKLIST_THREADS";

/// Worker count of the high-tier entry worklist.
pub const HIGH_TIER_THREADS_VAR: &str = "STRATA_HIGH_TIER_THREADS";

/// Set to `0`/`false`/`off`/`no` to run plans on the enqueuing thread.
pub const BACKGROUND_VAR: &str = "STRATA_WORKLIST_BACKGROUND";

/// Default worker count of each worklist.
pub const DEFAULT_WORKLIST_THREADS: usize = 2;

/// Configuration of one [`Worklist`](crate::Worklist).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklistConfig {
    /// Worklist name; worker threads are named `{name}-{index}`.
    pub name: String,
    /// Number of worker threads. Zero is treated as one.
    pub threads: usize,
    /// Compile on worker threads. When off, plans are lowered inside
    /// `enqueue` and are ready when it returns.
    pub background: bool,
}

impl Default for WorklistConfig {
    fn default() -> Self {
        Self {
            name: "strata-worklist".to_string(),
            threads: DEFAULT_WORKLIST_THREADS,
            background: true,
        }
    }
}

impl WorklistConfig {
    /// Config named `name` with the worker count read from `threads_var`.
    ///
    /// Unset, unparsable or zero counts fall back to
    /// [`DEFAULT_WORKLIST_THREADS`]. Background compilation is on unless
    /// [`BACKGROUND_VAR`] is set to a falsy value.
    pub fn from_env(name: impl Into<String>, threads_var: &str) -> Self {
        let threads = parse_env_u32(threads_var)
            .filter(|threads| *threads > 0)
            .map(|threads| threads as usize)
            .unwrap_or(DEFAULT_WORKLIST_THREADS);
        let background = std::env::var(BACKGROUND_VAR)
            .ok()
            .map(|v| parse_env_truthy(&v))
            .unwrap_or(true);
        Self {
            name: name.into(),
            threads,
            background,
        }
    }

    /// Baseline tier-up worklist, sized by [`WORKLIST_THREADS_VAR`].
    pub fn baseline_tier_up() -> Self {
        Self::from_env("strata-baseline", WORKLIST_THREADS_VAR)
    }

    /// High-tier entry worklist, sized by [`HIGH_TIER_THREADS_VAR`].
    pub fn high_tier_entry() -> Self {
        Self::from_env("strata-high-tier", HIGH_TIER_THREADS_VAR)
    }

    /// Worker threads to spawn.
    pub fn worker_count(&self) -> usize {
        self.threads.max(1)
    }
}

pub(crate) fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

pub(crate) fn parse_env_u32(var_name: &str) -> Option<u32> {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "yes", " on ", "anything"] {
            assert!(parse_env_truthy(value), "{value:?}");
        }
        for value in ["", "0", "false", "OFF", "No", "  0  "] {
            assert!(!parse_env_truthy(value), "{value:?}");
        }
    }

    #[test]
    fn unset_variables_use_defaults() {
        let config = WorklistConfig::from_env("test", "STRATA_TEST_UNSET_THREADS_VAR");
        assert_eq!(config.threads, DEFAULT_WORKLIST_THREADS);
        assert_eq!(config.name, "test");
    }

    #[test]
    fn zero_threads_still_spawn_one_worker() {
        let config = WorklistConfig {
            threads: 0,
            ..WorklistConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
    }
}

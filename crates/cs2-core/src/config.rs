use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tolerance used when comparing numeric immediates of two builds.
///
/// Small values must match exactly; larger ones may drift by
/// `mean * relative + absolute` as long as the sign agrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImmediateTolerance {
    pub exact_below: i64,
    pub relative: f64,
    pub absolute: f64,
}

impl Default for ImmediateTolerance {
    fn default() -> Self {
        Self {
            exact_below: 10,
            relative: 0.2,
            absolute: 10.0,
        }
    }
}

impl ImmediateTolerance {
    pub fn exact() -> Self {
        Self {
            exact_below: i64::MAX,
            relative: 0.0,
            absolute: 0.0,
        }
    }

    pub fn matches(&self, a: i64, b: i64) -> bool {
        if a == b {
            return true;
        }
        if (a < 0) != (b < 0) {
            return false;
        }
        let in_exact = |v: i64| v >= 0 && v < self.exact_below;
        if in_exact(a) || in_exact(b) {
            return false;
        }
        let (a, b) = (a as f64, b as f64);
        let mean = (a.abs() + b.abs()) / 2.0;
        (a - b).abs() <= mean * self.relative + self.absolute
    }
}

/// Knobs of the calibration pipeline.
///
/// Every fixpoint loop and search has an explicit cap here; the defaults
/// are tuned for full caches of a few thousand scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Passes of cross-build candidate matching.
    pub match_iterations: usize,
    /// Live states of the immediate-kind search.
    pub max_search_states: usize,
    /// Solutions evaluated per candidate before narrowing.
    pub max_solutions: usize,
    /// Instruction-count limits tried in order by the immediate search.
    /// `None` means unlimited.
    pub escalation: Vec<Option<usize>>,
    /// Passes of stack-effect solving per stage.
    pub stack_iterations: usize,
    pub tolerance: ImmediateTolerance,
    /// Concurrent script fetches.
    pub fetch_workers: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let mut escalation: Vec<Option<usize>> =
            [10, 10, 10, 20, 30, 40, 50, 100].into_iter().map(Some).collect();
        escalation.extend([None; 4]);
        Self {
            match_iterations: 10,
            max_search_states: 1000,
            max_solutions: 10,
            escalation,
            stack_iterations: 10,
            tolerance: ImmediateTolerance::default(),
            fetch_workers: 10,
        }
    }
}

impl CalibrationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

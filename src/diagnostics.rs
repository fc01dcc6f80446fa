//! Diagnostics verbosity shared by all analyses
//!
//! Analyses take a [`Verbosity`] and report through `tracing`, so the
//! subscriber installed by the binary (or a test) decides where messages go.

use serde::{Deserialize, Serialize};

/// How much an analysis should say about its decisions.
///
/// `Disabled` silences per-edge and per-candidate output entirely,
/// `Minimal` reports summary decisions (an edge dropped, a refinement
/// skipped), `Maximal` additionally reports every candidate considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Verbosity {
    #[default]
    Disabled,
    Minimal,
    Maximal,
}

impl Verbosity {
    /// Parse the numeric convention used by the CLI (`0`, `1`, `2`).
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Disabled,
            1 => Verbosity::Minimal,
            _ => Verbosity::Maximal,
        }
    }
}

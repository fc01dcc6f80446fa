//! Dependence edge kinds
//!
//! Edges are a tagged variant: data dependences (RAW/WAR/WAW, by register
//! or by memory, may or must), control dependences, and an undefined
//! placeholder used while merges rewire aggregate edges.

use serde::{Deserialize, Serialize};

/// Flavor of a data dependence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Raw,
    War,
    Waw,
}

/// The typed edge variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependenceKind {
    Data {
        dep: DataKind,
        /// Through a memory location rather than an SSA value.
        memory: bool,
        /// The alias oracle proved the locations identical.
        must: bool,
    },
    Control,
    /// Placeholder carried by freshly-rewired aggregate edges until their
    /// sub-edges are attached.
    Undefined,
}

impl DependenceKind {
    /// A register (def-use) data dependence: RAW, must, not memory.
    pub fn variable() -> Self {
        DependenceKind::Data {
            dep: DataKind::Raw,
            memory: false,
            must: true,
        }
    }

    pub fn memory(dep: DataKind, must: bool) -> Self {
        DependenceKind::Data {
            dep,
            memory: true,
            must,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, DependenceKind::Data { .. })
    }

    pub fn is_control(&self) -> bool {
        matches!(self, DependenceKind::Control)
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, DependenceKind::Data { memory: true, .. })
    }

    pub fn is_must(&self) -> bool {
        matches!(self, DependenceKind::Data { must: true, .. })
    }

    pub fn is_raw(&self) -> bool {
        matches!(
            self,
            DependenceKind::Data {
                dep: DataKind::Raw,
                ..
            }
        )
    }

    pub fn is_war(&self) -> bool {
        matches!(
            self,
            DependenceKind::Data {
                dep: DataKind::War,
                ..
            }
        )
    }

    pub fn is_waw(&self) -> bool {
        matches!(
            self,
            DependenceKind::Data {
                dep: DataKind::Waw,
                ..
            }
        )
    }

    /// Short tag for DOT labels and logs.
    pub fn label(&self) -> &'static str {
        match self {
            DependenceKind::Data {
                dep: DataKind::Raw, ..
            } => "RAW",
            DependenceKind::Data {
                dep: DataKind::War, ..
            } => "WAR",
            DependenceKind::Data {
                dep: DataKind::Waw, ..
            } => "WAW",
            DependenceKind::Control => "CTRL",
            DependenceKind::Undefined => "UNDEF",
        }
    }
}

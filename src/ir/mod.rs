//! In-memory SSA intermediate representation
//!
//! The analyses in this crate are written against a compact SSA IR: a
//! [`Module`] owns an arena of [`Value`]s (instructions, arguments,
//! constants, globals, function references) addressed by [`ValueId`], and a
//! list of [`Function`]s whose basic blocks hold ordered instruction lists.
//! The last instruction of every block is its terminator.
//!
//! Instructions *are* values: an instruction's `ValueId` is both its
//! identity and the SSA name of its result. The whole model derives serde,
//! so modules can be loaded from JSON by the CLI and round-tripped by tests.

pub mod alias;
pub mod builder;
pub mod callgraph;
pub mod dominators;
pub mod loops;
pub mod scev;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Handle to a value in a module's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Handle to a function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

/// Handle to a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Handle to a global variable within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Value types, kept to what the analyses distinguish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Type {
    #[default]
    Void,
    Int,
    Float,
    Ptr,
    /// Fixed-size array; element type is not modeled.
    Array {
        size: u32,
    },
}

impl Type {
    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array { .. })
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Two-operand arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Call target: a function in this module, a named external, or an
/// indirect call through a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callee {
    Direct(FunctionId),
    External(String),
    Indirect(ValueId),
}

/// Instruction payloads. The set covers exactly what the dependence and
/// point-to transfer functions need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstKind {
    Alloca {
        allocated: Type,
    },
    Load {
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
    Gep {
        base: ValueId,
        indices: Vec<ValueId>,
    },
    Cast {
        operand: ValueId,
    },
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Cmp {
        pred: CmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    Call {
        callee: Callee,
        args: Vec<ValueId>,
    },
    Branch {
        target: BlockId,
    },
    CondBranch {
        cond: ValueId,
        on_true: BlockId,
        on_false: BlockId,
    },
    Return {
        value: Option<ValueId>,
    },
}

/// An instruction: a value with a position inside a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: InstKind,
    pub function: FunctionId,
    pub block: BlockId,
    pub ty: Type,
}

impl Instruction {
    /// True for the block-ending instructions.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Branch { .. } | InstKind::CondBranch { .. } | InstKind::Return { .. }
        )
    }

    /// PHI, GEP, and cast instructions carry no runtime cost of their own.
    pub fn is_syntactic_sugar(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Phi { .. } | InstKind::Gep { .. } | InstKind::Cast { .. }
        )
    }

    /// True for instructions that touch memory directly.
    pub fn accesses_memory(&self) -> bool {
        matches!(self.kind, InstKind::Load { .. } | InstKind::Store { .. })
    }

    /// The single pointer operand of a load or store.
    pub fn pointer_operand(&self) -> Option<ValueId> {
        match self.kind {
            InstKind::Load { ptr } => Some(ptr),
            InstKind::Store { ptr, .. } => Some(ptr),
            _ => None,
        }
    }

    /// Value operands in a stable order. Block references are not values
    /// and do not appear here.
    pub fn operands(&self) -> Vec<ValueId> {
        match &self.kind {
            InstKind::Alloca { .. } => vec![],
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { value, ptr } => vec![*value, *ptr],
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::Gep { base, indices } => {
                let mut ops = vec![*base];
                ops.extend(indices.iter().copied());
                ops
            }
            InstKind::Cast { operand } => vec![*operand],
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![*cond, *on_true, *on_false],
            InstKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Call { callee, args } => {
                let mut ops = Vec::new();
                if let Callee::Indirect(v) = callee {
                    ops.push(*v);
                }
                ops.extend(args.iter().copied());
                ops
            }
            InstKind::Branch { .. } => vec![],
            InstKind::CondBranch { cond, .. } => vec![*cond],
            InstKind::Return { value } => value.iter().copied().collect(),
        }
    }

    /// Successor blocks named by a terminator; empty for non-terminators.
    pub fn successor_blocks(&self) -> Vec<BlockId> {
        match &self.kind {
            InstKind::Branch { target } => vec![*target],
            InstKind::CondBranch {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => vec![],
        }
    }
}

/// A value in the module arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Inst(Instruction),
    Argument { function: FunctionId, index: u32 },
    ConstantInt(i64),
    Global(GlobalId),
    FunctionRef(FunctionId),
}

impl Value {
    pub fn as_inst(&self) -> Option<&Instruction> {
        match self {
            Value::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Value::ConstantInt(_) | Value::FunctionRef(_))
    }
}

/// A basic block: an ordered, non-empty (once finished) instruction list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub insts: Vec<ValueId>,
}

/// A function: parameters plus a list of basic blocks. Block 0 is the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    pub blocks: Vec<BasicBlock>,
    pub ret_ty: Type,
}

impl Function {
    /// True when the function has no body (a declaration).
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(BlockId(0))
        }
    }
}

/// A module-level global variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    /// Globals with external linkage may be accessed outside the module.
    pub external_linkage: bool,
}

/// A whole translation unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub values: Vec<Value>,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    /// The instruction behind a value, if the value is one.
    pub fn inst(&self, id: ValueId) -> Option<&Instruction> {
        self.value(id).as_inst()
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        (0..self.functions.len() as u32).map(FunctionId)
    }

    /// Look a function up by name.
    pub fn function_named(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunctionId(i as u32))
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> + '_ {
        (0..self.globals.len() as u32).map(GlobalId)
    }

    /// The value arena slot of a global, if one was interned.
    pub fn global_value(&self, id: GlobalId) -> Option<ValueId> {
        self.values
            .iter()
            .position(|v| matches!(v, Value::Global(g) if *g == id))
            .map(|i| ValueId(i as u32))
    }

    /// All instructions of a function, in block order then listed order.
    pub fn instructions_of(&self, function: FunctionId) -> Vec<ValueId> {
        let mut out = Vec::new();
        for block in &self.function(function).blocks {
            out.extend(block.insts.iter().copied());
        }
        out
    }

    /// The terminator instruction of a block.
    pub fn terminator_of(&self, function: FunctionId, block: BlockId) -> Option<ValueId> {
        self.function(function)
            .block(block)
            .insts
            .last()
            .copied()
            .filter(|v| self.inst(*v).is_some_and(|i| i.is_terminator()))
    }

    /// Successor blocks of a block, read off its terminator.
    pub fn successors(&self, function: FunctionId, block: BlockId) -> Vec<BlockId> {
        self.terminator_of(function, block)
            .and_then(|t| self.inst(t))
            .map(|t| t.successor_blocks())
            .unwrap_or_default()
    }

    /// Predecessor blocks, computed by scanning every terminator.
    pub fn predecessors(&self, function: FunctionId, block: BlockId) -> Vec<BlockId> {
        let f = self.function(function);
        f.block_ids()
            .filter(|b| self.successors(function, *b).contains(&block))
            .collect()
    }

    /// Exit blocks: blocks whose terminator is a return.
    pub fn exit_blocks(&self, function: FunctionId) -> Vec<BlockId> {
        let f = self.function(function);
        f.block_ids()
            .filter(|b| {
                self.terminator_of(function, *b)
                    .and_then(|t| self.inst(t))
                    .is_some_and(|t| matches!(t.kind, InstKind::Return { .. }))
            })
            .collect()
    }

    /// First instruction of the entry block of the named entry function.
    pub fn entry_instruction(&self, entry: FunctionId) -> Option<ValueId> {
        let f = self.function(entry);
        f.entry_block()
            .and_then(|b| f.block(b).insts.first().copied())
    }

    /// Use lists for every value: `users[v]` is every instruction or
    /// argument-consuming value whose operand list contains `v`, in arena
    /// order. Computed on demand; callers should reuse the map.
    pub fn def_use(&self) -> HashMap<ValueId, Vec<ValueId>> {
        let mut users: HashMap<ValueId, Vec<ValueId>> = HashMap::new();
        for (idx, value) in self.values.iter().enumerate() {
            let user = ValueId(idx as u32);
            if let Value::Inst(inst) = value {
                for op in inst.operands() {
                    users.entry(op).or_default().push(user);
                }
            }
        }
        users
    }

    /// Position of an instruction within its block, or `None` for
    /// non-instructions.
    pub fn position_in_block(&self, id: ValueId) -> Option<usize> {
        let inst = self.inst(id)?;
        self.function(inst.function)
            .block(inst.block)
            .insts
            .iter()
            .position(|v| *v == id)
    }

    /// Whether `a` appears before `b` in the same block.
    pub fn precedes_in_block(&self, a: ValueId, b: ValueId) -> bool {
        let (Some(ia), Some(ib)) = (self.inst(a), self.inst(b)) else {
            return false;
        };
        if ia.function != ib.function || ia.block != ib.block {
            return false;
        }
        match (self.position_in_block(a), self.position_in_block(b)) {
            (Some(pa), Some(pb)) => pa < pb,
            _ => false,
        }
    }
}

/// External functions the analyses treat specially, mirroring the
/// allocator / read-only / memoryless name tables of the dependence
/// builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Malloc,
    Calloc,
    Realloc,
    Free,
    MemCopy,
    Intrinsic,
    ReadOnly,
    Memoryless,
    Unknown,
}

/// Classify an external callee by name.
pub fn classify_external(name: &str) -> ExternalKind {
    match name {
        "malloc" => ExternalKind::Malloc,
        "calloc" => ExternalKind::Calloc,
        "realloc" => ExternalKind::Realloc,
        "free" => ExternalKind::Free,
        "memcpy" | "memmove" => ExternalKind::MemCopy,
        "printf" | "fprintf" | "puts" => ExternalKind::ReadOnly,
        "sqrt" | "sin" | "cos" | "fabs" => ExternalKind::Memoryless,
        name if name.starts_with("llvm.lifetime") => ExternalKind::Intrinsic,
        _ => ExternalKind::Unknown,
    }
}

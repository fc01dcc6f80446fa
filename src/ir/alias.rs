//! Alias and mod/ref oracles
//!
//! The dependence builder consults an [`AliasOracle`] rather than deciding
//! aliasing itself. Two implementations ship with the crate: a
//! [`ConservativeAliasOracle`] that answers may-alias whenever it cannot
//! prove identity, and a [`BaseObjectAliasOracle`] that separates accesses
//! whose pointers demonstrably root at different allocations.

use super::{classify_external, Callee, ExternalKind, InstKind, Module, Value, ValueId};

/// Answer of an alias query between two memory locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasResult {
    No,
    May,
    Partial,
    Must,
}

/// Answer of a mod/ref query for a call against a location or another call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModRefResult {
    NoModRef,
    Ref,
    Mod,
    ModRef,
}

/// The aliasing contract the dependence builder depends on. Queries take
/// the *instructions* (loads, stores, calls), not raw pointers; oracles
/// extract the pointer operands themselves.
pub trait AliasOracle {
    /// Alias relation between the locations accessed by two memory
    /// instructions.
    fn alias(&self, module: &Module, a: ValueId, b: ValueId) -> AliasResult;

    /// How `call` interacts with the location accessed by `mem`.
    fn mod_ref_with_location(&self, module: &Module, call: ValueId, mem: ValueId) -> ModRefResult;

    /// How `call` interacts with the locations another call may access.
    fn mod_ref_with_call(&self, module: &Module, call: ValueId, other: ValueId) -> ModRefResult;
}

impl<T: AliasOracle + ?Sized> AliasOracle for &T {
    fn alias(&self, module: &Module, a: ValueId, b: ValueId) -> AliasResult {
        (**self).alias(module, a, b)
    }

    fn mod_ref_with_location(&self, module: &Module, call: ValueId, mem: ValueId) -> ModRefResult {
        (**self).mod_ref_with_location(module, call, mem)
    }

    fn mod_ref_with_call(&self, module: &Module, call: ValueId, other: ValueId) -> ModRefResult {
        (**self).mod_ref_with_call(module, call, other)
    }
}

/// What a callee can do to memory, judged from its body or external name.
fn callee_effect(module: &Module, call: ValueId) -> ModRefResult {
    let Some(inst) = module.inst(call) else {
        return ModRefResult::ModRef;
    };
    let InstKind::Call { callee, .. } = &inst.kind else {
        return ModRefResult::ModRef;
    };
    match callee {
        Callee::External(name) => match classify_external(name) {
            ExternalKind::ReadOnly => ModRefResult::Ref,
            ExternalKind::Memoryless | ExternalKind::Intrinsic => ModRefResult::NoModRef,
            // Allocators produce fresh memory; they do not touch existing
            // locations.
            ExternalKind::Malloc | ExternalKind::Calloc => ModRefResult::NoModRef,
            ExternalKind::Realloc | ExternalKind::Free | ExternalKind::MemCopy => {
                ModRefResult::ModRef
            }
            ExternalKind::Unknown => ModRefResult::ModRef,
        },
        Callee::Indirect(_) => ModRefResult::ModRef,
        Callee::Direct(f) => {
            let func = module.function(*f);
            if func.is_empty() {
                return ModRefResult::ModRef;
            }
            let mut reads = false;
            let mut writes = false;
            for v in module.instructions_of(*f) {
                match module.inst(v).map(|i| &i.kind) {
                    Some(InstKind::Load { .. }) => reads = true,
                    Some(InstKind::Store { .. }) => writes = true,
                    // A nested call may do anything.
                    Some(InstKind::Call { .. }) => return ModRefResult::ModRef,
                    _ => {}
                }
            }
            match (reads, writes) {
                (false, false) => ModRefResult::NoModRef,
                (true, false) => ModRefResult::Ref,
                (false, true) => ModRefResult::Mod,
                (true, true) => ModRefResult::ModRef,
            }
        }
    }
}

/// May-alias on everything it cannot prove identical.
#[derive(Debug, Default)]
pub struct ConservativeAliasOracle;

impl AliasOracle for ConservativeAliasOracle {
    fn alias(&self, module: &Module, a: ValueId, b: ValueId) -> AliasResult {
        let pa = module.inst(a).and_then(|i| i.pointer_operand());
        let pb = module.inst(b).and_then(|i| i.pointer_operand());
        match (pa, pb) {
            (Some(pa), Some(pb)) if pa == pb => AliasResult::Must,
            _ => AliasResult::May,
        }
    }

    fn mod_ref_with_location(&self, module: &Module, call: ValueId, _mem: ValueId) -> ModRefResult {
        callee_effect(module, call)
    }

    fn mod_ref_with_call(&self, module: &Module, call: ValueId, _other: ValueId) -> ModRefResult {
        callee_effect(module, call)
    }
}

/// Follows GEP/cast chains to the allocation a pointer roots at and
/// separates accesses rooted at provably distinct allocations.
#[derive(Debug, Default)]
pub struct BaseObjectAliasOracle;

/// The allocation a pointer expression roots at, when it can be followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseObject {
    Alloca(ValueId),
    Global(ValueId),
    HeapCall(ValueId),
    Unknown,
}

fn base_object(module: &Module, mut ptr: ValueId) -> BaseObject {
    loop {
        match module.value(ptr) {
            Value::Global(_) => return BaseObject::Global(ptr),
            Value::Inst(inst) => match &inst.kind {
                InstKind::Alloca { .. } => return BaseObject::Alloca(ptr),
                InstKind::Gep { base, .. } => ptr = *base,
                InstKind::Cast { operand } => ptr = *operand,
                InstKind::Call { callee, .. } => {
                    if let Callee::External(name) = callee {
                        if matches!(
                            classify_external(name),
                            ExternalKind::Malloc | ExternalKind::Calloc
                        ) {
                            return BaseObject::HeapCall(ptr);
                        }
                    }
                    return BaseObject::Unknown;
                }
                _ => return BaseObject::Unknown,
            },
            _ => return BaseObject::Unknown,
        }
    }
}

impl AliasOracle for BaseObjectAliasOracle {
    fn alias(&self, module: &Module, a: ValueId, b: ValueId) -> AliasResult {
        let (Some(pa), Some(pb)) = (
            module.inst(a).and_then(|i| i.pointer_operand()),
            module.inst(b).and_then(|i| i.pointer_operand()),
        ) else {
            return AliasResult::May;
        };
        if pa == pb {
            return AliasResult::Must;
        }
        match (base_object(module, pa), base_object(module, pb)) {
            (BaseObject::Unknown, _) | (_, BaseObject::Unknown) => AliasResult::May,
            (ba, bb) if ba == bb => AliasResult::May,
            // Distinct named allocations cannot overlap.
            _ => AliasResult::No,
        }
    }

    fn mod_ref_with_location(&self, module: &Module, call: ValueId, _mem: ValueId) -> ModRefResult {
        callee_effect(module, call)
    }

    fn mod_ref_with_call(&self, module: &Module, call: ValueId, _other: ValueId) -> ModRefResult {
        callee_effect(module, call)
    }
}

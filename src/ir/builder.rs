//! Programmatic module construction
//!
//! [`ModuleBuilder`] is how tests and fixtures assemble IR: create a
//! function, append blocks, append instructions. Every append returns the
//! `ValueId` of the new instruction so later instructions can use it as an
//! operand. PHIs may be created empty and filled in with
//! [`ModuleBuilder::add_phi_incoming`] once the late values exist.

use super::{
    BasicBlock, BinaryOp, BlockId, Callee, CmpPred, Function, FunctionId, Global, GlobalId,
    InstKind, Instruction, Module, Type, Value, ValueId,
};

/// Incrementally builds a [`Module`].
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ModuleBuilder {
            module: Module::new(name),
        }
    }

    /// Finish construction and take the module.
    pub fn finish(self) -> Module {
        self.module
    }

    fn intern(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.module.values.len() as u32);
        self.module.values.push(value);
        id
    }

    /// Declare a function with `param_count` integer-typed parameters.
    pub fn function(&mut self, name: impl Into<String>, param_count: u32, ret_ty: Type) -> FunctionId {
        let id = FunctionId(self.module.functions.len() as u32);
        self.module.functions.push(Function {
            name: name.into(),
            params: Vec::new(),
            blocks: Vec::new(),
            ret_ty,
        });
        for index in 0..param_count {
            let arg = self.intern(Value::Argument {
                function: id,
                index,
            });
            self.module.functions[id.0 as usize].params.push(arg);
        }
        id
    }

    /// Append an empty block to a function.
    pub fn block(&mut self, function: FunctionId) -> BlockId {
        let f = &mut self.module.functions[function.0 as usize];
        let id = BlockId(f.blocks.len() as u32);
        f.blocks.push(BasicBlock::default());
        id
    }

    /// Declare a global variable.
    pub fn global(&mut self, name: impl Into<String>, ty: Type, external_linkage: bool) -> GlobalId {
        let id = GlobalId(self.module.globals.len() as u32);
        self.module.globals.push(Global {
            name: name.into(),
            ty,
            external_linkage,
        });
        self.intern(Value::Global(id));
        id
    }

    /// The arena value for a global declared with [`Self::global`].
    pub fn global_value(&self, id: GlobalId) -> ValueId {
        self.module
            .global_value(id)
            .expect("global was interned at declaration")
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.intern(Value::ConstantInt(value))
    }

    pub fn function_ref(&mut self, function: FunctionId) -> ValueId {
        self.intern(Value::FunctionRef(function))
    }

    pub fn param(&self, function: FunctionId, index: usize) -> ValueId {
        self.module.functions[function.0 as usize].params[index]
    }

    fn append(&mut self, function: FunctionId, block: BlockId, kind: InstKind, ty: Type) -> ValueId {
        let id = self.intern(Value::Inst(Instruction {
            kind,
            function,
            block,
            ty,
        }));
        self.module.functions[function.0 as usize].blocks[block.0 as usize]
            .insts
            .push(id);
        id
    }

    pub fn alloca(&mut self, f: FunctionId, b: BlockId, allocated: Type) -> ValueId {
        self.append(f, b, InstKind::Alloca { allocated }, Type::Ptr)
    }

    pub fn load(&mut self, f: FunctionId, b: BlockId, ptr: ValueId) -> ValueId {
        self.append(f, b, InstKind::Load { ptr }, Type::Int)
    }

    /// Load producing a pointer-typed result (for pointer-chasing fixtures).
    pub fn load_ptr(&mut self, f: FunctionId, b: BlockId, ptr: ValueId) -> ValueId {
        self.append(f, b, InstKind::Load { ptr }, Type::Ptr)
    }

    pub fn store(&mut self, f: FunctionId, b: BlockId, value: ValueId, ptr: ValueId) -> ValueId {
        self.append(f, b, InstKind::Store { value, ptr }, Type::Void)
    }

    pub fn phi(&mut self, f: FunctionId, b: BlockId, ty: Type) -> ValueId {
        self.append(f, b, InstKind::Phi { incoming: vec![] }, ty)
    }

    /// Add an incoming (value, predecessor) pair to a PHI created earlier.
    pub fn add_phi_incoming(&mut self, phi: ValueId, value: ValueId, from: BlockId) {
        let Value::Inst(inst) = &mut self.module.values[phi.0 as usize] else {
            panic!("add_phi_incoming on a non-instruction");
        };
        let InstKind::Phi { incoming } = &mut inst.kind else {
            panic!("add_phi_incoming on a non-phi");
        };
        incoming.push((value, from));
    }

    pub fn gep(&mut self, f: FunctionId, b: BlockId, base: ValueId, indices: Vec<ValueId>) -> ValueId {
        self.append(f, b, InstKind::Gep { base, indices }, Type::Ptr)
    }

    pub fn cast(&mut self, f: FunctionId, b: BlockId, operand: ValueId) -> ValueId {
        self.append(f, b, InstKind::Cast { operand }, Type::Int)
    }

    pub fn select(
        &mut self,
        f: FunctionId,
        b: BlockId,
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    ) -> ValueId {
        self.append(
            f,
            b,
            InstKind::Select {
                cond,
                on_true,
                on_false,
            },
            Type::Int,
        )
    }

    pub fn binary(
        &mut self,
        f: FunctionId,
        b: BlockId,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> ValueId {
        self.append(f, b, InstKind::Binary { op, lhs, rhs }, Type::Int)
    }

    pub fn add(&mut self, f: FunctionId, b: BlockId, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(f, b, BinaryOp::Add, lhs, rhs)
    }

    pub fn cmp(
        &mut self,
        f: FunctionId,
        b: BlockId,
        pred: CmpPred,
        lhs: ValueId,
        rhs: ValueId,
    ) -> ValueId {
        self.append(f, b, InstKind::Cmp { pred, lhs, rhs }, Type::Int)
    }

    pub fn call(
        &mut self,
        f: FunctionId,
        b: BlockId,
        callee: Callee,
        args: Vec<ValueId>,
        ty: Type,
    ) -> ValueId {
        self.append(f, b, InstKind::Call { callee, args }, ty)
    }

    pub fn call_direct(
        &mut self,
        f: FunctionId,
        b: BlockId,
        callee: FunctionId,
        args: Vec<ValueId>,
    ) -> ValueId {
        self.call(f, b, Callee::Direct(callee), args, Type::Int)
    }

    pub fn call_external(
        &mut self,
        f: FunctionId,
        b: BlockId,
        name: impl Into<String>,
        args: Vec<ValueId>,
        ty: Type,
    ) -> ValueId {
        self.call(f, b, Callee::External(name.into()), args, ty)
    }

    pub fn br(&mut self, f: FunctionId, b: BlockId, target: BlockId) -> ValueId {
        self.append(f, b, InstKind::Branch { target }, Type::Void)
    }

    pub fn cond_br(
        &mut self,
        f: FunctionId,
        b: BlockId,
        cond: ValueId,
        on_true: BlockId,
        on_false: BlockId,
    ) -> ValueId {
        self.append(
            f,
            b,
            InstKind::CondBranch {
                cond,
                on_true,
                on_false,
            },
            Type::Void,
        )
    }

    pub fn ret(&mut self, f: FunctionId, b: BlockId, value: Option<ValueId>) -> ValueId {
        self.append(f, b, InstKind::Return { value }, Type::Void)
    }

    /// Peek at the module mid-construction.
    pub fn module(&self) -> &Module {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::CmpPred;

    /// A counted loop:
    ///
    /// ```text
    /// b0: br b1
    /// b1: i = phi [0, b0], [i', b2]; c = cmp eq i, n; cond_br c, b3, b2
    /// b2: i' = add i, 1; br b1
    /// b3: ret
    /// ```
    #[test]
    fn test_counted_loop_shape() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("f", 1, Type::Void);
        let n = mb.param(f, 0);
        let b0 = mb.block(f);
        let b1 = mb.block(f);
        let b2 = mb.block(f);
        let b3 = mb.block(f);

        mb.br(f, b0, b1);
        let zero = mb.const_int(0);
        let one = mb.const_int(1);
        let i = mb.phi(f, b1, Type::Int);
        let c = mb.cmp(f, b1, CmpPred::Eq, i, n);
        mb.cond_br(f, b1, c, b3, b2);
        let next = mb.add(f, b2, i, one);
        mb.br(f, b2, b1);
        mb.ret(f, b3, None);
        mb.add_phi_incoming(i, zero, b0);
        mb.add_phi_incoming(i, next, b2);

        let m = mb.finish();
        assert_eq!(m.successors(f, b1), vec![b3, b2]);
        assert_eq!(m.predecessors(f, b1), vec![b0, b2]);
        let phi = m.inst(i).unwrap();
        let InstKind::Phi { incoming } = &phi.kind else {
            panic!("expected phi");
        };
        assert_eq!(incoming.len(), 2);
    }

    #[test]
    fn test_arguments_precede_instructions_in_arena() {
        let mut mb = ModuleBuilder::new("m");
        let f = mb.function("f", 2, Type::Int);
        let b0 = mb.block(f);
        let sum = mb.add(f, b0, mb.param(f, 0), mb.param(f, 1));
        mb.ret(f, b0, Some(sum));
        let m = mb.finish();
        assert!(matches!(m.value(ValueId(0)), Value::Argument { .. }));
        assert!(matches!(m.value(ValueId(1)), Value::Argument { .. }));
        assert!(m.inst(sum).is_some());
    }
}

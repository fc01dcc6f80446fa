//! May-point-to analysis
//!
//! A monotone intra/interprocedural forward analysis. Pointers are either
//! SSA variables or memory objects (allocation sites plus one
//! distinguished unknown object for everything that escapes); each
//! function accumulates a point-to graph to a local fixed point, and an
//! outer worklist re-runs functions until no summary changes across call
//! edges.

use crate::error::Result;
use crate::ir::callgraph::CallGraph;
use crate::ir::{
    classify_external, Callee, ExternalKind, FunctionId, GlobalId, InstKind, Module, ValueId,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Handle to a memory object of one [`PointToSummary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemObjId(pub u32);

/// Where a memory object comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjSource {
    /// A stack allocation site.
    Alloca(ValueId),
    /// A heap allocation site (malloc/calloc call).
    Heap(ValueId),
    Global(GlobalId),
    /// The distinguished non-local object standing in for everything the
    /// analysis cannot name.
    Unknown,
}

/// A pointer in the analysis domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pointer {
    Variable(ValueId),
    Object(MemObjId),
}

/// A finite map Pointer -> Set<MemoryObject> with monotone updates.
#[derive(Debug, Clone, Default)]
pub struct PointToGraph {
    map: BTreeMap<Pointer, BTreeSet<MemObjId>>,
}

impl PointToGraph {
    pub fn pointees(&self, ptr: Pointer) -> BTreeSet<MemObjId> {
        self.map.get(&ptr).cloned().unwrap_or_default()
    }

    /// Union `objs` into the pointee set; reports whether anything grew.
    pub fn add_pointees(&mut self, ptr: Pointer, objs: &BTreeSet<MemObjId>) -> bool {
        if objs.is_empty() {
            return false;
        }
        let set = self.map.entry(ptr).or_default();
        let before = set.len();
        set.extend(objs.iter().copied());
        set.len() != before
    }

    pub fn set_pointees(&mut self, ptr: Pointer, objs: BTreeSet<MemObjId>) {
        self.map.insert(ptr, objs);
    }

    /// Objects transitively reachable from a pointer by chasing pointee
    /// links.
    pub fn reachable_memory_objects(&self, ptr: Pointer) -> BTreeSet<MemObjId> {
        let mut reached: BTreeSet<MemObjId> = BTreeSet::new();
        let mut worklist: VecDeque<MemObjId> = self.pointees(ptr).into_iter().collect();
        while let Some(obj) = worklist.pop_front() {
            if !reached.insert(obj) {
                continue;
            }
            for next in self.pointees(Pointer::Object(obj)) {
                if !reached.contains(&next) {
                    worklist.push_back(next);
                }
            }
        }
        reached
    }

    /// Pointees of the pointees of `ptr` (what a load through it yields).
    fn pointees_of_pointees(&self, ptr: Pointer) -> BTreeSet<MemObjId> {
        let mut out = BTreeSet::new();
        for pte in self.pointees(ptr) {
            out.extend(self.pointees(Pointer::Object(pte)));
        }
        out
    }
}

/// Per-function analysis state.
#[derive(Debug, Clone, Default)]
pub struct FunctionSummary {
    pub graph: PointToGraph,
    /// Objects the function may return.
    pub return_values: BTreeSet<MemObjId>,
    /// Objects that must be treated as heap-resident (e.g. memcpy
    /// destinations).
    pub must_heap: BTreeSet<MemObjId>,
}

/// Whole-module result.
pub struct PointToSummary {
    objects: Vec<ObjSource>,
    site_objects: BTreeMap<ValueId, MemObjId>,
    global_objects: BTreeMap<GlobalId, MemObjId>,
    unknown: MemObjId,
    summaries: BTreeMap<FunctionId, FunctionSummary>,
}

impl PointToSummary {
    pub fn unknown_object(&self) -> MemObjId {
        self.unknown
    }

    pub fn object_source(&self, obj: MemObjId) -> ObjSource {
        self.objects[obj.0 as usize]
    }

    pub fn function_summary(&self, function: FunctionId) -> Option<&FunctionSummary> {
        self.summaries.get(&function)
    }

    /// The may-point-to set of `ptr` at `inst` (the function's stable
    /// graph; the analysis is flow-insensitive within a function).
    pub fn pointees_at(&self, module: &Module, inst: ValueId, ptr: ValueId) -> BTreeSet<MemObjId> {
        let Some(i) = module.inst(inst) else {
            return BTreeSet::new();
        };
        self.summaries
            .get(&i.function)
            .map(|s| s.graph.pointees(Pointer::Variable(ptr)))
            .unwrap_or_default()
    }

    /// Alloca sites are registered eagerly, so a site first seen here is a
    /// heap allocation.
    fn object_for_site(&mut self, site: ValueId) -> MemObjId {
        if let Some(obj) = self.site_objects.get(&site) {
            return *obj;
        }
        let obj = MemObjId(self.objects.len() as u32);
        self.objects.push(ObjSource::Heap(site));
        self.site_objects.insert(site, obj);
        obj
    }
}

/// Entry point: run the analysis for every function reachable from the
/// module entry.
pub struct MayPointTo;

impl MayPointTo {
    pub fn analyze(module: &Module, call_graph: &CallGraph) -> Result<PointToSummary> {
        let entry = module
            .function_named("main")
            .or_else(|| module.function_ids().next());

        let mut summary = PointToSummary {
            objects: Vec::new(),
            site_objects: BTreeMap::new(),
            global_objects: BTreeMap::new(),
            unknown: MemObjId(0),
            summaries: BTreeMap::new(),
        };
        summary.objects.push(ObjSource::Unknown);

        for g in module.global_ids() {
            let obj = MemObjId(summary.objects.len() as u32);
            summary.objects.push(ObjSource::Global(g));
            summary.global_objects.insert(g, obj);
        }
        // Alloca sites registered eagerly so their source kind is exact.
        for f in module.function_ids() {
            for v in module.instructions_of(f) {
                if matches!(
                    module.inst(v).map(|i| &i.kind),
                    Some(InstKind::Alloca { .. })
                ) {
                    let obj = MemObjId(summary.objects.len() as u32);
                    summary.objects.push(ObjSource::Alloca(v));
                    summary.site_objects.insert(v, obj);
                }
            }
        }

        let Some(entry) = entry else {
            return Ok(summary);
        };
        let reachable = call_graph.functions_reachable_from(module, entry);
        for f in &reachable {
            summary.summaries.insert(*f, FunctionSummary::default());
        }

        // Every reachable function sees the globals.
        for f in &reachable {
            let fs = summary.summaries.get_mut(f).expect("summary seeded");
            for g in module.global_ids() {
                if let Some(gv) = module.global_value(g) {
                    let obj = summary.global_objects[&g];
                    fs.graph
                        .set_pointees(Pointer::Variable(gv), [obj].into_iter().collect());
                }
            }
        }

        // Outer worklist across call edges: re-run functions until no
        // summary changes anywhere.
        let order: Vec<FunctionId> = reachable.iter().copied().collect();
        let mut changed = true;
        while changed {
            changed = false;
            for f in &order {
                if module.function(*f).is_empty() {
                    continue;
                }
                changed |= Self::run_function_to_local_fixed_point(module, *f, &mut summary)?;
            }
        }
        Ok(summary)
    }

    fn run_function_to_local_fixed_point(
        module: &Module,
        function: FunctionId,
        summary: &mut PointToSummary,
    ) -> Result<bool> {
        let mut changed_any = false;
        let mut modified = true;
        while modified {
            modified = false;
            for inst in module.instructions_of(function) {
                modified |= Self::transfer(module, function, inst, summary)?;
            }
            changed_any |= modified;
        }
        Ok(changed_any)
    }

    fn transfer(
        module: &Module,
        function: FunctionId,
        inst: ValueId,
        summary: &mut PointToSummary,
    ) -> Result<bool> {
        let kind = module.inst(inst).expect("instruction").kind.clone();
        let var = Pointer::Variable(inst);
        let mut modified = false;

        // Work on the function's own graph; cross-function effects go
        // through the summaries map afterwards.
        macro_rules! graph {
            () => {
                summary
                    .summaries
                    .get_mut(&function)
                    .expect("summary seeded")
                    .graph
            };
        }

        match kind {
            InstKind::Alloca { .. } => {
                let obj = summary.object_for_site(inst);
                modified |= graph!().add_pointees(var, &[obj].into_iter().collect());
            }
            InstKind::Store { value, ptr } => {
                let g = &mut graph!();
                let targets = g.pointees(Pointer::Variable(ptr));
                let stored = g.pointees(Pointer::Variable(value));
                for m in targets {
                    modified |= g.add_pointees(Pointer::Object(m), &stored);
                }
            }
            InstKind::Load { ptr } => {
                let g = &mut graph!();
                let loaded = g.pointees_of_pointees(Pointer::Variable(ptr));
                modified |= g.add_pointees(var, &loaded);
            }
            InstKind::Phi { incoming } => {
                let g = &mut graph!();
                let mut union = BTreeSet::new();
                for (v, _) in incoming {
                    union.extend(g.pointees(Pointer::Variable(v)));
                }
                modified |= g.add_pointees(var, &union);
            }
            InstKind::Select {
                on_true, on_false, ..
            } => {
                let g = &mut graph!();
                let mut union = g.pointees(Pointer::Variable(on_true));
                union.extend(g.pointees(Pointer::Variable(on_false)));
                modified |= g.add_pointees(var, &union);
            }
            InstKind::Gep { base, .. } => {
                // Field-insensitive: the element pointer aliases the base.
                let g = &mut graph!();
                let base_ptes = g.pointees(Pointer::Variable(base));
                modified |= g.add_pointees(var, &base_ptes);
            }
            InstKind::Cast { operand } => {
                let g = &mut graph!();
                let ptes = g.pointees(Pointer::Variable(operand));
                modified |= g.add_pointees(var, &ptes);
            }
            InstKind::Return { value: Some(v) } => {
                let fs = summary.summaries.get_mut(&function).expect("summary seeded");
                let ptes = fs.graph.pointees(Pointer::Variable(v));
                let before = fs.return_values.len();
                fs.return_values.extend(ptes);
                modified |= fs.return_values.len() != before;
            }
            InstKind::Call { callee, args } => {
                modified |= Self::transfer_call(module, function, inst, &callee, &args, summary)?;
            }
            _ => {}
        }
        Ok(modified)
    }

    fn transfer_call(
        module: &Module,
        function: FunctionId,
        inst: ValueId,
        callee: &Callee,
        args: &[ValueId],
        summary: &mut PointToSummary,
    ) -> Result<bool> {
        let var = Pointer::Variable(inst);
        let mut modified = false;

        match callee {
            Callee::External(name) => match classify_external(name) {
                ExternalKind::Malloc | ExternalKind::Calloc => {
                    let obj = summary.object_for_site(inst);
                    let fs = summary.summaries.get_mut(&function).expect("summary seeded");
                    modified |= fs.graph.add_pointees(var, &[obj].into_iter().collect());
                }
                ExternalKind::Realloc => {
                    let fs = summary.summaries.get_mut(&function).expect("summary seeded");
                    if let Some(arg0) = args.first() {
                        let ptes = fs.graph.pointees(Pointer::Variable(*arg0));
                        modified |= fs.graph.add_pointees(var, &ptes);
                    }
                }
                ExternalKind::Free | ExternalKind::Intrinsic | ExternalKind::ReadOnly
                | ExternalKind::Memoryless => {}
                ExternalKind::MemCopy => {
                    let fs = summary.summaries.get_mut(&function).expect("summary seeded");
                    if let (Some(dest), Some(src)) = (args.first(), args.get(1)) {
                        let dest_objs = fs.graph.pointees(Pointer::Variable(*dest));
                        let copied = fs.graph.pointees_of_pointees(Pointer::Variable(*src));
                        for m in dest_objs {
                            modified |= fs.graph.add_pointees(Pointer::Object(m), &copied);
                            modified |= fs.must_heap.insert(m);
                        }
                    }
                }
                ExternalKind::Unknown => {
                    modified |= Self::apply_unknown_call(function, inst, args, summary);
                }
            },
            Callee::Indirect(_) => {
                modified |= Self::apply_unknown_call(function, inst, args, summary);
            }
            Callee::Direct(callee_fn) => {
                if module.function(*callee_fn).is_empty()
                    || !summary.summaries.contains_key(callee_fn)
                {
                    modified |= Self::apply_unknown_call(function, inst, args, summary);
                } else {
                    // Push argument and global pointees into the callee.
                    let callee_params = module.function(*callee_fn).params.clone();
                    for (idx, arg) in args.iter().enumerate() {
                        let Some(param) = callee_params.get(idx) else {
                            continue;
                        };
                        let caller_graph =
                            &summary.summaries.get(&function).expect("summary seeded").graph;
                        let arg_ptes = caller_graph.pointees(Pointer::Variable(*arg));
                        let mut reach_updates: Vec<(Pointer, BTreeSet<MemObjId>)> = Vec::new();
                        for obj in caller_graph.reachable_memory_objects(Pointer::Variable(*arg)) {
                            reach_updates
                                .push((Pointer::Object(obj), caller_graph.pointees(Pointer::Object(obj))));
                        }
                        let callee_sum =
                            summary.summaries.get_mut(callee_fn).expect("summary seeded");
                        modified |= callee_sum
                            .graph
                            .add_pointees(Pointer::Variable(*param), &arg_ptes);
                        for (ptr, objs) in reach_updates {
                            modified |= callee_sum.graph.add_pointees(ptr, &objs);
                        }
                    }

                    // The return summary flows back, as do the pointee
                    // sets of objects the callee could reach through the
                    // arguments.
                    let ret = summary
                        .summaries
                        .get(callee_fn)
                        .expect("summary seeded")
                        .return_values
                        .clone();
                    let mut back_updates: Vec<(Pointer, BTreeSet<MemObjId>)> = Vec::new();
                    {
                        let callee_graph =
                            &summary.summaries.get(callee_fn).expect("summary seeded").graph;
                        let caller_graph =
                            &summary.summaries.get(&function).expect("summary seeded").graph;
                        for arg in args {
                            for obj in
                                caller_graph.reachable_memory_objects(Pointer::Variable(*arg))
                            {
                                back_updates.push((
                                    Pointer::Object(obj),
                                    callee_graph.pointees(Pointer::Object(obj)),
                                ));
                            }
                        }
                    }
                    let fs = summary.summaries.get_mut(&function).expect("summary seeded");
                    modified |= fs.graph.add_pointees(var, &ret);
                    for (ptr, objs) in back_updates {
                        modified |= fs.graph.add_pointees(ptr, &objs);
                    }
                }
            }
        }
        Ok(modified)
    }

    /// The conservative escape closure for a call nothing is known about:
    /// everything reachable from the arguments, plus the distinguished
    /// unknown object, may point to everything in that set, and the
    /// return value may point anywhere in it.
    fn apply_unknown_call(
        function: FunctionId,
        inst: ValueId,
        args: &[ValueId],
        summary: &mut PointToSummary,
    ) -> bool {
        let unknown = summary.unknown;
        let fs = summary.summaries.get_mut(&function).expect("summary seeded");
        let mut escaped: BTreeSet<MemObjId> = BTreeSet::new();
        for arg in args {
            escaped.extend(fs.graph.reachable_memory_objects(Pointer::Variable(*arg)));
        }
        escaped.insert(unknown);

        let mut modified = fs.graph.add_pointees(Pointer::Variable(inst), &escaped);
        for obj in escaped.clone() {
            modified |= fs.graph.add_pointees(Pointer::Object(obj), &escaped);
        }
        modified
    }
}

use std::sync::Arc;

use hashbrown::HashMap;
use slotmap::{new_key_type, SecondaryMap, SlotMap};

use crate::ty::{self, Ty, TINITCELL};
use crate::value::Val;

new_key_type! {
    pub struct ClassId;
    pub struct FuncId;
}

/// A resolved class. `exact` means no subclass can appear at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RClass {
    pub id: ClassId,
    pub exact: bool,
}

/// A resolved callee. `exact` means the resolution cannot be overridden at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RFunc {
    pub id: FuncId,
    pub exact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassRel {
    Same,
    /// The first class derives from the second.
    Sub,
    /// The second class derives from the first.
    Super,
    Disjoint,
    Unknown,
}

/// Context for a return-type query: argument types bottom-up and the
/// receiver/context type.
#[derive(Debug, Clone)]
pub struct CallCtx<'a> {
    pub args: &'a [Ty],
    pub ctx: Ty,
}

/// The read-only program-wide resolution surface this pass consumes. Every
/// query has a sound "don't know" answer, which the default methods give.
pub trait Index {
    fn resolve_class(&self, _name: &str) -> Option<RClass> {
        None
    }

    fn resolve_func(&self, _name: &str) -> Option<RFunc> {
        None
    }

    /// Resolves a method against a receiver type (an object or class-ref
    /// lattice value).
    fn resolve_method(&self, _recv: &Ty, _name: &str) -> Option<RFunc> {
        None
    }

    fn resolve_ctor(&self, _cls: RClass) -> Option<RFunc> {
        None
    }

    fn class_rel(&self, _a: ClassId, _b: ClassId) -> ClassRel {
        ClassRel::Unknown
    }

    fn class_name(&self, _cls: ClassId) -> Option<Arc<str>> {
        None
    }

    fn lookup_return_type(&self, _callee: RFunc, _call: &CallCtx<'_>) -> Ty {
        TINITCELL
    }

    fn lookup_constant(&self, _name: &str) -> Option<Val> {
        None
    }

    fn lookup_class_constant(&self, _cls: ClassId, _name: &str) -> Option<Val> {
        None
    }

    fn lookup_public_static(&self, _cls: &Ty, _name: &Ty) -> Ty {
        TINITCELL
    }

    /// Evaluates a call to a pure, foldable function on constant arguments.
    fn fold_call(&self, _callee: RFunc, _args: &[Val]) -> Option<Val> {
        None
    }

    /// The base class every thrown value derives from.
    fn throwable_class(&self) -> Option<RClass> {
        None
    }
}

/// An index that resolves nothing. Every answer is the sound fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownIndex;

impl Index for UnknownIndex {}

struct ClassInfo {
    name: Arc<str>,
    parent: Option<ClassId>,
    has_subclasses: bool,
    constants: HashMap<Arc<str>, Val>,
    methods: HashMap<Arc<str>, FuncId>,
    ctor: Option<FuncId>,
}

struct FuncInfo {
    ret: Ty,
    fold: Option<fn(&[Val]) -> Option<Val>>,
}

/// A small in-memory index for tests and harnesses: a class hierarchy with
/// per-class methods/constants, plus free functions with fixed return
/// types and optional constant folders.
#[derive(Default)]
pub struct TestIndex {
    classes: SlotMap<ClassId, ClassInfo>,
    class_names: HashMap<Arc<str>, ClassId>,
    funcs: SlotMap<FuncId, FuncInfo>,
    func_names: HashMap<Arc<str>, FuncId>,
    constants: HashMap<Arc<str>, Val>,
    statics: SecondaryMap<ClassId, HashMap<Arc<str>, Ty>>,
    throwable: Option<ClassId>,
}

impl TestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, name: &str, parent: Option<ClassId>) -> ClassId {
        let name: Arc<str> = name.into();
        let id = self.classes.insert(ClassInfo {
            name: Arc::clone(&name),
            parent,
            has_subclasses: false,
            constants: HashMap::new(),
            methods: HashMap::new(),
            ctor: None,
        });
        if let Some(parent) = parent {
            let mut up = Some(parent);
            while let Some(cls) = up {
                self.classes[cls].has_subclasses = true;
                up = self.classes[cls].parent;
            }
        }
        self.class_names.insert(name, id);
        id
    }

    pub fn add_func(&mut self, name: &str, ret: Ty) -> FuncId {
        let name: Arc<str> = name.into();
        let id = self.funcs.insert(FuncInfo { ret, fold: None });
        self.func_names.insert(name, id);
        id
    }

    pub fn add_foldable_func(
        &mut self,
        name: &str,
        ret: Ty,
        fold: fn(&[Val]) -> Option<Val>,
    ) -> FuncId {
        let id = self.add_func(name, ret);
        self.funcs[id].fold = Some(fold);
        id
    }

    pub fn add_method(&mut self, cls: ClassId, name: &str, ret: Ty) -> FuncId {
        let id = self.funcs.insert(FuncInfo { ret, fold: None });
        self.classes[cls].methods.insert(name.into(), id);
        id
    }

    pub fn add_ctor(&mut self, cls: ClassId, ret: Ty) -> FuncId {
        let id = self.funcs.insert(FuncInfo { ret, fold: None });
        self.classes[cls].ctor = Some(id);
        id
    }

    pub fn add_constant(&mut self, name: &str, value: Val) {
        self.constants.insert(name.into(), value);
    }

    pub fn add_class_constant(&mut self, cls: ClassId, name: &str, value: Val) {
        self.classes[cls].constants.insert(name.into(), value);
    }

    pub fn add_public_static(&mut self, cls: ClassId, name: &str, ty: Ty) {
        self.statics
            .entry(cls)
            .unwrap()
            .or_default()
            .insert(name.into(), ty);
    }

    pub fn set_throwable(&mut self, cls: ClassId) {
        self.throwable = Some(cls);
    }

    fn is_ancestor(&self, ancestor: ClassId, mut cls: ClassId) -> bool {
        loop {
            if cls == ancestor {
                return true;
            }
            match self.classes[cls].parent {
                Some(parent) => cls = parent,
                None => return false,
            }
        }
    }

    fn recv_class(&self, recv: &Ty) -> Option<ClassId> {
        recv.obj_spec().or_else(|| recv.cls_spec()).map(|spec| spec.cls)
    }
}

impl Index for TestIndex {
    fn resolve_class(&self, name: &str) -> Option<RClass> {
        let id = self.class_names.get(name).copied()?;
        Some(RClass {
            id,
            exact: !self.classes[id].has_subclasses,
        })
    }

    fn resolve_func(&self, name: &str) -> Option<RFunc> {
        let id = self.func_names.get(name).copied()?;
        Some(RFunc { id, exact: true })
    }

    fn resolve_method(&self, recv: &Ty, name: &str) -> Option<RFunc> {
        let mut cls = Some(self.recv_class(recv)?);
        while let Some(id) = cls {
            if let Some(&func) = self.classes[id].methods.get(name) {
                // an override below the receiver class could still win
                return Some(RFunc {
                    id: func,
                    exact: !self.classes[id].has_subclasses,
                });
            }
            cls = self.classes[id].parent;
        }
        None
    }

    fn resolve_ctor(&self, cls: RClass) -> Option<RFunc> {
        let func = self.classes[cls.id].ctor?;
        Some(RFunc { id: func, exact: cls.exact })
    }

    fn class_rel(&self, a: ClassId, b: ClassId) -> ClassRel {
        if a == b {
            ClassRel::Same
        } else if self.is_ancestor(b, a) {
            ClassRel::Sub
        } else if self.is_ancestor(a, b) {
            ClassRel::Super
        } else {
            ClassRel::Disjoint
        }
    }

    fn class_name(&self, cls: ClassId) -> Option<Arc<str>> {
        Some(Arc::clone(&self.classes.get(cls)?.name))
    }

    fn lookup_return_type(&self, callee: RFunc, _call: &CallCtx<'_>) -> Ty {
        self.funcs
            .get(callee.id)
            .map(|f| f.ret.clone())
            .unwrap_or(TINITCELL)
    }

    fn lookup_constant(&self, name: &str) -> Option<Val> {
        self.constants.get(name).cloned()
    }

    fn lookup_class_constant(&self, cls: ClassId, name: &str) -> Option<Val> {
        self.classes.get(cls)?.constants.get(name).cloned()
    }

    fn lookup_public_static(&self, cls: &Ty, name: &Ty) -> Ty {
        let resolved = cls.cls_spec().filter(|spec| spec.exact).and_then(|spec| {
            let name = name.as_const()?;
            let name = name.to_str()?.clone();
            self.statics.get(spec.cls)?.get(&name).cloned()
        });
        resolved.unwrap_or(TINITCELL)
    }

    fn fold_call(&self, callee: RFunc, args: &[Val]) -> Option<Val> {
        (self.funcs.get(callee.id)?.fold?)(args)
    }

    fn throwable_class(&self) -> Option<RClass> {
        let id = self.throwable?;
        Some(RClass { id, exact: !self.classes[id].has_subclasses })
    }
}

/// Index-aware subtype check between an object type and a class bound:
/// `Some(true)` when every value of `val` is an instance of `spec`'s class,
/// `Some(false)` when none can be, `None` otherwise.
pub fn obj_rel(index: &dyn Index, val: &Ty, spec: ty::ClsSpec) -> Option<bool> {
    let val_spec = val.obj_spec()?;
    match index.class_rel(val_spec.cls, spec.cls) {
        ClassRel::Same => Some(true),
        ClassRel::Sub => Some(true),
        ClassRel::Super => {
            if val_spec.exact {
                Some(false)
            } else {
                None
            }
        }
        ClassRel::Disjoint => Some(false),
        ClassRel::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::{obj_exact, obj_sub, TINT};

    #[test]
    fn test_class_hierarchy() {
        let mut idx = TestIndex::new();
        let base = idx.add_class("Base", None);
        let derived = idx.add_class("Derived", Some(base));
        let other = idx.add_class("Other", None);

        assert_eq!(idx.class_rel(derived, base), ClassRel::Sub);
        assert_eq!(idx.class_rel(base, derived), ClassRel::Super);
        assert_eq!(idx.class_rel(base, other), ClassRel::Disjoint);

        let resolved = idx.resolve_class("Base").unwrap();
        assert!(!resolved.exact);
        assert!(idx.resolve_class("Other").unwrap().exact);
    }

    #[test]
    fn test_obj_rel() {
        let mut idx = TestIndex::new();
        let base = idx.add_class("Base", None);
        let derived = idx.add_class("Derived", Some(base));
        let other = idx.add_class("Other", None);

        let spec = obj_sub(base).obj_spec().unwrap();
        assert_eq!(obj_rel(&idx, &obj_exact(derived), spec), Some(true));
        assert_eq!(obj_rel(&idx, &obj_exact(other), spec), Some(false));
        assert_eq!(obj_rel(&idx, &obj_exact(base), spec), Some(true));
        assert_eq!(obj_rel(&idx, &obj_sub(base), spec), Some(true));
        assert_eq!(obj_rel(&idx, &TINT, spec), None);
    }

    #[test]
    fn test_method_resolution_walks_parents() {
        let mut idx = TestIndex::new();
        let base = idx.add_class("Base", None);
        let derived = idx.add_class("Derived", Some(base));
        idx.add_method(base, "m", TINT);

        let got = idx.resolve_method(&obj_exact(derived), "m").unwrap();
        assert!(!got.exact);
        assert!(idx.resolve_method(&obj_exact(derived), "missing").is_none());
    }
}

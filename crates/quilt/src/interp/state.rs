use bitvec::prelude::*;

use crate::bc::{ClsRefSlot, FuncMeta, IterId, LocalId};
use crate::index::RFunc;
use crate::ty::{
    self, to_cell, union_of, IterInfo, Ty, TBOTTOM, TCLS, TINITCELL, TREF, TUNINIT,
};

/// What a stack slot is known to be a copy of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StkEquiv {
    None,
    /// Holds the same value as this local.
    Local(LocalId),
    /// Holds the same value as the slot immediately below it.
    Dup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StkElem {
    pub ty: Ty,
    pub equiv: StkEquiv,
}

/// The abstract state of one iterator slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Iter {
    Dead,
    Tracked(IterInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpiKind {
    Func,
    Method,
    Ctor,
    Unknown,
}

/// An in-flight call-preparation record: pushed by the call-push
/// instructions, consumed by the matching `FCall`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActRec {
    pub kind: FpiKind,
    /// Receiver or context type for the eventual invocation.
    pub ctx: Ty,
    pub func: Option<RFunc>,
    /// Secondary resolution used when the primary may not be the one
    /// loaded at runtime.
    pub fallback: Option<RFunc>,
}

impl ActRec {
    pub fn unknown() -> Self {
        Self { kind: FpiKind::Unknown, ctx: ty::TTOP, func: None, fallback: None }
    }
}

/// The per-block abstract machine state. Created fresh for one
/// block-interpretation, mutated in place by the transfer functions, and
/// snapshotted into propagation calls.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Set when the current path is known impossible; interpretation of
    /// the rest of the block stops.
    pub unreachable: bool,
    /// Whether `$this` is known to be non-null here.
    pub this_available: bool,
    pub stack: Vec<StkElem>,
    locals: Vec<Ty>,
    /// Circular rings of locals proven to hold identical values.
    equiv_locals: Vec<Option<LocalId>>,
    /// Per-local bit: the local may currently be bound to a reference, so
    /// its tracked type cannot be trusted across unknown writes.
    could_be_ref: BitVec,
    cls_ref_slots: Vec<Ty>,
    iters: Vec<Iter>,
    fpi_stack: Vec<ActRec>,
}

impl State {
    /// The entry state of a function body: all locals uninitialized.
    pub fn entry(func: &FuncMeta) -> Self {
        Self {
            unreachable: false,
            this_available: false,
            stack: Vec::new(),
            locals: vec![TUNINIT; func.num_locals as usize],
            equiv_locals: vec![None; func.num_locals as usize],
            could_be_ref: bitvec![0; func.num_locals as usize],
            cls_ref_slots: vec![TBOTTOM; func.num_cls_ref_slots as usize],
            iters: vec![Iter::Dead; func.num_iters as usize],
            fpi_stack: Vec::new(),
        }
    }

    /// The state an exceptional successor receives: evaluation and
    /// call-preparation stacks are gone by the time the handler runs.
    pub fn without_stacks(&self) -> Self {
        let mut state = self.clone();
        state.stack.clear();
        state.fpi_stack.clear();
        state
    }

    // --- operand stack ------------------------------------------------

    pub fn push(&mut self, ty: Ty) {
        self.push_equiv(ty, StkEquiv::None);
    }

    pub fn push_equiv(&mut self, ty: Ty, equiv: StkEquiv) {
        self.stack.push(StkElem { ty, equiv });
    }

    fn pop_flavor(&mut self, expect: &Ty, what: &str) -> Ty {
        let elem = self.stack.pop().unwrap_or_else(|| {
            panic!("pop{what} on an empty operand stack");
        });
        assert!(
            elem.ty.subtype_of(expect) || elem.ty.is_bottom(),
            "pop{what}: stack slot holds {}",
            elem.ty,
        );
        elem.ty
    }

    pub fn popc(&mut self) -> Ty {
        self.pop_flavor(&TINITCELL, "C")
    }

    pub fn popv(&mut self) -> Ty {
        self.pop_flavor(&TREF, "V")
    }

    pub fn popu(&mut self) -> Ty {
        self.pop_flavor(&TUNINIT, "U")
    }

    pub fn popcu(&mut self) -> Ty {
        self.pop_flavor(&ty::TCELL, "CU")
    }

    pub fn popt(&mut self) -> Ty {
        self.stack.pop().expect("popT on an empty operand stack").ty
    }

    pub fn discard(&mut self, n: usize) {
        assert!(n <= self.stack.len(), "discard past the stack bottom");
        self.stack.truncate(self.stack.len() - n);
    }

    /// Bounds-checked peek; depth 0 is the topmost slot.
    pub fn top(&self, depth: usize) -> &StkElem {
        assert!(depth < self.stack.len(), "peek past the stack bottom");
        &self.stack[self.stack.len() - 1 - depth]
    }

    pub fn top_ty(&self, depth: usize) -> Ty {
        self.top(depth).ty.clone()
    }

    pub fn top_equiv(&self, depth: usize) -> StkEquiv {
        self.top(depth).equiv
    }

    /// The local the slot at `depth` copies, if any.
    pub fn top_local(&self, depth: usize) -> Option<LocalId> {
        match self.top(depth).equiv {
            StkEquiv::Local(l) => Some(l),
            _ => None,
        }
    }

    pub fn set_top_ty(&mut self, depth: usize, ty: Ty) {
        assert!(depth < self.stack.len(), "peek past the stack bottom");
        let idx = self.stack.len() - 1 - depth;
        self.stack[idx].ty = ty;
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    // --- locals -------------------------------------------------------

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn loc_raw(&self, l: LocalId) -> Ty {
        self.locals[l.idx()].clone()
    }

    pub fn loc_as_cell(&self, l: LocalId) -> Ty {
        if self.loc_could_be_ref(l) {
            TINITCELL
        } else {
            to_cell(&self.locals[l.idx()])
        }
    }

    pub fn loc_could_be_uninit(&self, l: LocalId) -> bool {
        self.locals[l.idx()].could_be(&TUNINIT)
    }

    pub fn loc_could_be_ref(&self, l: LocalId) -> bool {
        self.could_be_ref[l.idx()]
    }

    pub fn set_loc_ref(&mut self, l: LocalId, could_be_ref: bool) {
        self.could_be_ref.set(l.idx(), could_be_ref);
    }

    /// Rebinds a local: drops every equivalence involving it, then stores
    /// the new type. The could-be-ref bit is left alone (a write through a
    /// bound reference does not unbind it).
    pub fn set_loc(&mut self, l: LocalId, ty: Ty) {
        self.kill_loc_equiv(l);
        self.kill_stk_equiv(l);
        self.locals[l.idx()] = ty;
    }

    /// `set_loc` without the equivalence-preserving caveats; used by
    /// refinement, where the value is unchanged and equivalences survive.
    pub fn refine_loc_raw(&mut self, l: LocalId, ty: Ty) {
        self.locals[l.idx()] = ty;
    }

    // --- local equivalence rings --------------------------------------

    pub fn find_loc_equiv(&self, l: LocalId) -> Option<LocalId> {
        self.equiv_locals[l.idx()]
    }

    pub fn locs_are_equiv(&self, a: LocalId, b: LocalId) -> bool {
        if a == b {
            return true;
        }
        let mut cur = a;
        while let Some(next) = self.equiv_locals[cur.idx()] {
            if next == b {
                return true;
            }
            if next == a {
                break;
            }
            cur = next;
        }
        false
    }

    /// Adds `from` to `to`'s ring. `from` must not already be in a ring.
    pub fn add_loc_equiv(&mut self, from: LocalId, to: LocalId) {
        assert!(!self.loc_could_be_ref(from), "equivalence through a reference");
        assert!(self.equiv_locals[from.idx()].is_none());
        assert_ne!(from, to);
        let next = self.equiv_locals[to.idx()].unwrap_or(to);
        self.equiv_locals[from.idx()] = Some(next);
        self.equiv_locals[to.idx()] = Some(from);
    }

    /// Removes `l` from its ring, leaving the remaining members linked.
    pub fn kill_loc_equiv(&mut self, l: LocalId) {
        let Some(next) = self.equiv_locals[l.idx()] else { return };

        // find the predecessor in the ring
        let mut pred = next;
        while self.equiv_locals[pred.idx()] != Some(l) {
            pred = self.equiv_locals[pred.idx()].expect("broken equivalence ring");
        }

        if pred == next {
            self.equiv_locals[pred.idx()] = None;
        } else {
            self.equiv_locals[pred.idx()] = Some(next);
        }
        self.equiv_locals[l.idx()] = None;
    }

    /// Clears stack slots marked equivalent to `l`.
    pub fn kill_stk_equiv(&mut self, l: LocalId) {
        for elem in &mut self.stack {
            if elem.equiv == StkEquiv::Local(l) {
                elem.equiv = StkEquiv::None;
            }
        }
    }

    /// Every member of `l`'s ring, including `l` itself.
    pub fn equiv_ring(&self, l: LocalId) -> Vec<LocalId> {
        let mut out = vec![l];
        let mut cur = l;
        while let Some(next) = self.equiv_locals[cur.idx()] {
            if next == l {
                break;
            }
            out.push(next);
            cur = next;
        }
        out
    }

    /// Invalidates every local that could be written through a reference
    /// by code outside this function (any call may do so).
    pub fn kill_ref_locals(&mut self) {
        for idx in self.could_be_ref.iter_ones().collect::<Vec<_>>() {
            let l = LocalId(idx as u32);
            self.kill_loc_equiv(l);
            self.kill_stk_equiv(l);
            self.locals[idx] = TINITCELL;
        }
    }

    // --- class-reference slots ----------------------------------------

    pub fn put_cls_ref(&mut self, slot: ClsRefSlot, ty: Ty) {
        assert!(ty.subtype_of(&TCLS), "class-ref slot written with {ty}");
        self.cls_ref_slots[slot.idx()] = ty;
    }

    pub fn peek_cls_ref(&self, slot: ClsRefSlot) -> &Ty {
        let ty = &self.cls_ref_slots[slot.idx()];
        assert!(!ty.is_bottom(), "class-ref slot read while vacant");
        ty
    }

    pub fn take_cls_ref(&mut self, slot: ClsRefSlot) -> Ty {
        let ty = std::mem::replace(&mut self.cls_ref_slots[slot.idx()], TBOTTOM);
        assert!(!ty.is_bottom(), "class-ref slot read while vacant");
        ty
    }

    // --- iterators ----------------------------------------------------

    pub fn iter(&self, id: IterId) -> &Iter {
        &self.iters[id.idx()]
    }

    pub fn set_iter(&mut self, id: IterId, info: IterInfo) {
        self.iters[id.idx()] = Iter::Tracked(info);
    }

    pub fn free_iter(&mut self, id: IterId) {
        self.iters[id.idx()] = Iter::Dead;
    }

    // --- call-preparation stack ---------------------------------------

    pub fn fpi_push(&mut self, ar: ActRec) {
        self.fpi_stack.push(ar);
    }

    pub fn fpi_pop(&mut self) -> ActRec {
        self.fpi_stack
            .pop()
            .expect("FCall without a matching call-push")
    }

    pub fn fpi_top(&self) -> &ActRec {
        self.fpi_stack
            .last()
            .expect("no call-preparation record in flight")
    }

    pub fn fpi_depth(&self) -> usize {
        self.fpi_stack.len()
    }

    // --- joining ------------------------------------------------------

    /// Joins `other` into `self`, returning whether anything widened. The
    /// external driver calls this when accumulating a block's incoming
    /// state from predecessor outputs; information only ever grows.
    pub fn join_into(&mut self, other: &State) -> bool {
        if other.unreachable {
            return false;
        }
        if self.unreachable {
            *self = other.clone();
            return true;
        }

        assert_eq!(self.stack.len(), other.stack.len(), "stack depth mismatch at join");
        assert_eq!(self.locals.len(), other.locals.len());
        assert_eq!(self.fpi_stack.len(), other.fpi_stack.len(), "call-prep depth mismatch at join");

        let mut changed = false;

        if self.this_available && !other.this_available {
            self.this_available = false;
            changed = true;
        }

        for (slot, oslot) in self.stack.iter_mut().zip(&other.stack) {
            let joined = union_of(&slot.ty, &oslot.ty);
            if joined != slot.ty {
                slot.ty = joined;
                changed = true;
            }
            if slot.equiv != oslot.equiv && slot.equiv != StkEquiv::None {
                slot.equiv = StkEquiv::None;
                changed = true;
            }
        }

        for (idx, oty) in other.locals.iter().enumerate() {
            let joined = union_of(&self.locals[idx], oty);
            if joined != self.locals[idx] {
                self.locals[idx] = joined;
                changed = true;
            }
        }

        // keep only equivalences that hold on both sides
        let stale: Vec<LocalId> = (0..self.equiv_locals.len())
            .filter_map(|idx| {
                let l = LocalId(idx as u32);
                let next = self.equiv_locals[idx]?;
                (!other.locs_are_equiv(l, next)).then_some(l)
            })
            .collect();
        for l in stale {
            self.kill_loc_equiv(l);
            changed = true;
        }

        for idx in other.could_be_ref.iter_ones() {
            if !self.could_be_ref[idx] {
                self.could_be_ref.set(idx, true);
                changed = true;
            }
        }

        for (slot, oslot) in self.cls_ref_slots.iter_mut().zip(&other.cls_ref_slots) {
            let joined = union_of(slot, oslot);
            if joined != *slot {
                *slot = joined;
                changed = true;
            }
        }

        for (iter, oiter) in self.iters.iter_mut().zip(&other.iters) {
            let joined = match (&*iter, oiter) {
                (Iter::Dead, Iter::Dead) => Iter::Dead,
                (Iter::Tracked(a), Iter::Tracked(b)) => Iter::Tracked(a.join(b)),
                _ => Iter::Tracked(IterInfo::any()),
            };
            if joined != *iter {
                *iter = joined;
                changed = true;
            }
        }

        for (ar, oar) in self.fpi_stack.iter_mut().zip(&other.fpi_stack) {
            if ar.kind != oar.kind {
                ar.kind = FpiKind::Unknown;
                changed = true;
            }
            let ctx = union_of(&ar.ctx, &oar.ctx);
            if ctx != ar.ctx {
                ar.ctx = ctx;
                changed = true;
            }
            if ar.func != oar.func && ar.func.is_some() {
                ar.func = None;
                changed = true;
            }
            if ar.fallback != oar.fallback && ar.fallback.is_some() {
                ar.fallback = None;
                changed = true;
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bc::FuncMeta;
    use crate::ty::{ival, TINT, TSTR};

    fn state(num_locals: u32) -> State {
        State::entry(&FuncMeta { num_locals, ..Default::default() })
    }

    #[test]
    fn test_equiv_rings() {
        let mut s = state(4);
        let (a, b, c) = (LocalId(0), LocalId(1), LocalId(2));

        s.add_loc_equiv(a, b);
        assert!(s.locs_are_equiv(a, b));
        assert!(s.locs_are_equiv(b, a));
        assert!(!s.locs_are_equiv(a, c));

        s.add_loc_equiv(c, b);
        assert!(s.locs_are_equiv(a, c));

        s.kill_loc_equiv(b);
        assert!(s.locs_are_equiv(a, c));
        assert!(!s.locs_are_equiv(a, b));

        s.kill_loc_equiv(a);
        assert!(!s.locs_are_equiv(a, c));
        assert_eq!(s.find_loc_equiv(c), None);
    }

    #[test]
    fn test_set_loc_kills_equiv_and_stack_marks() {
        let mut s = state(2);
        let (a, b) = (LocalId(0), LocalId(1));
        s.add_loc_equiv(a, b);
        s.push_equiv(TINT, StkEquiv::Local(a));

        s.set_loc(a, TSTR);
        assert!(!s.locs_are_equiv(a, b));
        assert_eq!(s.top_equiv(0), StkEquiv::None);
    }

    #[test]
    fn test_join_widens_monotonically() {
        let mut a = state(2);
        let mut b = state(2);
        a.set_loc(LocalId(0), ival(1));
        b.set_loc(LocalId(0), ival(2));

        let mut joined = a.clone();
        assert!(joined.join_into(&b));
        assert_eq!(joined.loc_raw(LocalId(0)), TINT);
        // joining again changes nothing
        assert!(!joined.join_into(&b));
        assert!(!joined.join_into(&a));
    }

    #[test]
    fn test_join_unreachable_identity() {
        let mut dead = state(1);
        dead.unreachable = true;
        let live = state(1);

        let mut acc = dead.clone();
        assert!(acc.join_into(&live));
        assert!(!acc.unreachable);
        assert!(!acc.join_into(&dead));
    }

    #[test]
    fn test_stack_flavors() {
        let mut s = state(0);
        s.push(TINT);
        assert_eq!(s.popc(), TINT);

        s.push(TREF);
        assert_eq!(s.popv(), TREF);
    }

    #[test]
    #[should_panic(expected = "empty operand stack")]
    fn test_pop_underflow_asserts() {
        let mut s = state(0);
        s.popc();
    }
}

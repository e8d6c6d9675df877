use std::cmp::Ordering;
use std::sync::Arc;

use log::{trace, warn};

use crate::bc::{
    BareThisOp, BlockId, ClsRefSlot, IncDecOp, IsTypeOp, IterId, LocalId, ObjMethodOp, Op,
    SetOpKind,
};
use crate::index::{obj_rel, CallCtx};
use crate::ty::{
    assert_emptiness, assert_nonemptiness, aval, bval, could_run_destructor, dict_of, emptiness,
    from_val, is_opt, ival, iter_types, list_of, obj_exact, obj_of, opt, sval, tuple, union_of,
    unopt, ArrTy, ClsSpec, Emptiness, IterCount, IterInfo, Ty, TARR, TARRKEY, TBOOL, TBOTTOM,
    TCELL, TCLS, TDBL, TDICT, TFALSE, TINITCELL, TINITNULL, TINT, TLIST, TNULL, TNUM, TOBJ,
    TOPTOBJ, TREF, TSTR, TTOP, TTRUE, TUNINIT,
};
use crate::value::{self, ArrKey, Val};

use super::state::{ActRec, FpiKind, Iter, State, StkEquiv};
use super::{Env, StepFlags};

/// A refinable location: a local, or a live stack slot by depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Loc {
    Local(LocalId),
    Stack(usize),
}

/// The bytecode that pushes exactly this constant.
pub(crate) fn gen_constant(v: &Val) -> Op {
    match v {
        Val::Null => Op::Null,
        Val::Bool(true) => Op::True,
        Val::Bool(false) => Op::False,
        Val::Int(i) => Op::Int(*i),
        Val::Dbl(d) => Op::Double(*d),
        Val::Str(s) => Op::Str(Arc::clone(s)),
        Val::List(_) | Val::Dict(_) => Op::Arr(v.clone()),
    }
}

fn const_outputs_scalar(state: &State, n: usize) -> bool {
    n > 0 && state.stack_depth() >= n && (0..n).all(|d| state.top_ty(d).is_scalar())
}

/// Interprets a replacement sequence, folding each step's flags into one
/// summary. With `reduce` set, the sequence is also reported as this
/// instruction's strength reduction.
pub(crate) fn impl_seq(env: &mut Env<'_>, bcs: Vec<Op>, reduce: bool) -> StepFlags {
    let mut acc = StepFlags {
        was_pei: false,
        effect_free: true,
        can_const_prop: true,
        ..Default::default()
    };
    let mut reduction: Vec<Op> = Vec::new();

    for op in bcs {
        assert!(
            acc.jmp_dest.is_none() && acc.returned.is_none(),
            "branching opcode before the last position of a sequence",
        );
        trace!("    (impl {op})");
        let mut flags = dispatch(env, &op);

        if let Some(sub) = flags.reduced.take() {
            if sub.last().map_or(false, Op::is_terminal) {
                env.state.unreachable = true;
            }
            if reduce {
                reduction.extend(sub);
            }
        } else {
            if op.is_terminal() {
                env.state.unreachable = true;
            }
            // a constant result proves the step harmless after the fact
            if flags.can_const_prop
                && !flags.effect_free
                && const_outputs_scalar(env.state, op.num_push())
            {
                flags.effect_free = true;
                flags.was_pei = false;
            }
            if reduce {
                reduction.push(op);
            }
        }

        acc.was_pei |= flags.was_pei;
        acc.effect_free &= flags.effect_free;
        acc.can_const_prop &= flags.can_const_prop;
        acc.jmp_dest = flags.jmp_dest;
        acc.returned = flags.returned;

        if env.state.unreachable {
            break;
        }
    }

    acc.reduced = reduce.then_some(reduction);
    acc
}

/// Replaces the current instruction with a cheaper equivalent sequence.
pub(crate) fn reduce(env: &mut Env<'_>, bcs: Vec<Op>) -> StepFlags {
    impl_seq(env, bcs, true)
}

/// Applies `f` to a location's type everywhere the value is known to live:
/// the local's equivalence ring and every stack slot copying a ring
/// member. A result of Bottom marks the path unreachable.
pub(crate) fn refine_loc(state: &mut State, loc: Loc, f: &dyn Fn(&Ty) -> Ty) {
    if let Loc::Local(l) = loc {
        if state.loc_could_be_ref(l) {
            return;
        }
    }

    let locals: Vec<LocalId> = match loc {
        Loc::Local(l) => state.equiv_ring(l),
        Loc::Stack(d) => state
            .top_local(d)
            .map(|l| state.equiv_ring(l))
            .unwrap_or_default(),
    };

    for &m in &locals {
        let r = f(&state.loc_raw(m));
        if r.is_bottom() {
            state.unreachable = true;
        }
        state.refine_loc_raw(m, r);
    }

    for depth in 0..state.stack_depth() {
        let hit = match loc {
            Loc::Stack(d) if d == depth => true,
            _ => state
                .top_local(depth)
                .map_or(false, |sl| locals.contains(&sl)),
        };
        if hit {
            let r = f(&state.top_ty(depth));
            if r.is_bottom() {
                state.unreachable = true;
            }
            state.set_top_ty(depth, r);
        }
    }
}

/// Branch-sensitive refinement: `pre` narrows the taken edge (propagated
/// to `target`), `post` narrows the fallthrough state.
pub(crate) fn refine_location(
    env: &mut Env<'_>,
    loc: Loc,
    pre: &dyn Fn(&Ty) -> Ty,
    target: BlockId,
    post: &dyn Fn(&Ty) -> Ty,
) {
    let save = env.state.clone();
    refine_loc(env.state, loc, pre);
    if !env.state.unreachable {
        (env.propagate)(target, env.state);
    }
    *env.state = save;
    refine_loc(env.state, loc, post);
}

fn push_loc_equiv(env: &mut Env<'_>, ty: Ty, l: LocalId) {
    let equiv = if env.state.loc_could_be_ref(l) {
        StkEquiv::None
    } else {
        StkEquiv::Local(l)
    };
    env.state.push_equiv(ty, equiv);
}

pub(crate) fn type_of_istype(op: IsTypeOp) -> Ty {
    match op {
        IsTypeOp::Null => TNULL,
        IsTypeOp::Bool => TBOOL,
        IsTypeOp::Int => TINT,
        IsTypeOp::Dbl => TDBL,
        IsTypeOp::Str => TSTR,
        IsTypeOp::Arr => TARR,
        IsTypeOp::Obj => TOBJ,
        IsTypeOp::Scalar => panic!("no single type corresponds to a scalar test"),
    }
}

// --- comparison helpers ---------------------------------------------------

/// Computes the result type of an identity comparison of the two topmost
/// slots without popping them. `nsame` flips the sense.
pub(crate) fn resolve_same(env: &Env<'_>, nsame: bool) -> Ty {
    let t1 = env.state.top_ty(0);
    let t2 = env.state.top_ty(1);
    let v1 = t1.as_const();
    let v2 = t2.as_const();

    let same_slot = env.state.top_equiv(0) == StkEquiv::Dup
        || match (env.state.top_local(0), env.state.top_local(1)) {
            (Some(a), Some(b)) => a == b || env.state.locs_are_equiv(a, b),
            _ => false,
        };

    if same_slot {
        // a value always equals itself, except a NaN double
        let not_nan = |v: &Option<Val>| {
            matches!(v, Some(v) if !matches!(v, Val::Dbl(d) if d.is_nan()))
        };
        if !t1.could_be(&TDBL) || !t2.could_be(&TDBL) || not_nan(&v1) || not_nan(&v2) {
            return bval(!nsame);
        }
    }

    if let (Some(v1), Some(v2)) = (&v1, &v2) {
        return bval(v2.same(v1) != nsame);
    }

    if !t1.could_be(&t2) {
        return bval(nsame);
    }

    TBOOL
}

fn same_impl(env: &mut Env<'_>, flags: &mut StepFlags, nsame: bool) {
    let r = resolve_same(env, nsame);
    env.state.discard(2);
    flags.nothrow();
    flags.constprop();
    env.state.push(r);
}

fn eq_impl(env: &mut Env<'_>, flags: &mut StepFlags, negate: bool) {
    // identical values are loosely equal as well
    if resolve_same(env, false) == TTRUE {
        flags.constprop();
        env.state.discard(2);
        env.state.push(bval(!negate));
        return;
    }

    let t1 = env.state.popc();
    let t2 = env.state.popc();
    if let (Some(v2), Some(v1)) = (t2.as_const(), t1.as_const()) {
        if let Some(r) = value::loose_eq(&v2, &v1) {
            flags.constprop();
            env.state.push(bval(r != negate));
            return;
        }
    }
    env.state.push(TBOOL);
}

fn cmp_bool(env: &mut Env<'_>, flags: &mut StepFlags, pick: fn(Ordering) -> bool) {
    let t1 = env.state.popc();
    let t2 = env.state.popc();
    if let (Some(v2), Some(v1)) = (t2.as_const(), t1.as_const()) {
        if let Some(ord) = value::loose_cmp(&v2, &v1) {
            flags.constprop();
            env.state.push(bval(pick(ord)));
            return;
        }
    }
    env.state.push(TBOOL);
}

fn cmp_int(env: &mut Env<'_>, flags: &mut StepFlags) {
    let t1 = env.state.popc();
    let t2 = env.state.popc();
    if let (Some(v2), Some(v1)) = (t2.as_const(), t1.as_const()) {
        if let Some(ord) = value::loose_cmp(&v2, &v1) {
            flags.constprop();
            env.state.push(ival(match ord {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }));
            return;
        }
    }
    env.state.push(TINT);
}

fn xor_impl(env: &mut Env<'_>, flags: &mut StepFlags) {
    let t1 = env.state.popc();
    let t2 = env.state.popc();
    if let (Some(v2), Some(v1)) = (t2.as_const(), t1.as_const()) {
        flags.constprop();
        env.state.push(bval(v2.to_bool() ^ v1.to_bool()));
        return;
    }
    env.state.push(TBOOL);
}

// --- arithmetic -----------------------------------------------------------

fn ty_arith_num(a: &Ty, b: &Ty) -> Ty {
    if a.subtype_of(&TDBL) && b.subtype_of(&TDBL) {
        TDBL
    } else if a.subtype_of(&TNUM) && b.subtype_of(&TNUM) {
        TNUM
    } else {
        TINITCELL
    }
}

fn ty_arith_div(a: &Ty, b: &Ty) -> Ty {
    if a.subtype_of(&TNUM) && b.subtype_of(&TNUM) {
        // division by zero yields false with a warning
        union_of(&TNUM, &TFALSE)
    } else {
        TINITCELL
    }
}

fn ty_arith_mod(a: &Ty, b: &Ty) -> Ty {
    if a.subtype_of(&TNUM) && b.subtype_of(&TNUM) {
        union_of(&TINT, &TFALSE)
    } else {
        TINITCELL
    }
}

fn ty_bitop(a: &Ty, b: &Ty) -> Ty {
    if a.subtype_of(&TSTR) && b.subtype_of(&TSTR) {
        TSTR
    } else if !a.could_be(&TSTR) || !b.could_be(&TSTR) {
        TINT
    } else {
        union_of(&TINT, &TSTR)
    }
}

fn ty_shift(_: &Ty, _: &Ty) -> Ty {
    TINT
}

fn arith(
    env: &mut Env<'_>,
    flags: &mut StepFlags,
    eval: fn(&Val, &Val) -> Option<Val>,
    category: fn(&Ty, &Ty) -> Ty,
) {
    let t1 = env.state.popc();
    let t2 = env.state.popc();

    if let (Some(v2), Some(v1)) = (t2.as_const(), t1.as_const()) {
        match eval(&v2, &v1) {
            Some(r) => {
                flags.constprop();
                env.state.push(from_val(&r));
            }
            // evaluation would raise at runtime: do not fold
            None => env.state.push(category(&t2, &t1)),
        }
        return;
    }

    flags.constprop();
    env.state.push(category(&t2, &t1));
}

fn bit_not(env: &mut Env<'_>, flags: &mut StepFlags) {
    let t = env.state.popc();
    if let Some(v) = t.as_const() {
        if let Some(r) = value::bit_not(&v) {
            flags.constprop();
            env.state.push(from_val(&r));
            return;
        }
        env.state.push(TINITCELL);
        return;
    }
    env.state.push(if t.subtype_of(&TINT) {
        TINT
    } else if t.subtype_of(&TSTR) {
        TSTR
    } else {
        TINITCELL
    });
}

fn concat_operands_cant_throw(tys: &[Ty]) -> bool {
    let safe = union_of(&union_of(&TINITNULL, &TBOOL), &union_of(&TNUM, &TSTR));
    tys.iter().all(|t| t.subtype_of(&safe))
}

fn concat_n(env: &mut Env<'_>, flags: &mut StepFlags, n: u32) {
    let tys: Vec<Ty> = (0..n).map(|_| env.state.popc()).collect();

    if concat_operands_cant_throw(&tys) {
        flags.nothrow();
    }

    let consts: Option<Vec<Val>> = tys.iter().map(Ty::as_const).collect();
    if let Some(vals) = consts {
        // operands were popped topmost-first; concatenation runs bottom-up
        let mut acc: Option<Val> = None;
        for v in vals.iter().rev() {
            acc = match acc {
                None => Some(v.clone()),
                Some(a) => match value::concat(&a, v) {
                    Some(r) => Some(r),
                    None => {
                        env.state.push(TSTR);
                        return;
                    }
                },
            };
        }
        if let Some(r) = acc {
            flags.constprop();
            env.state.push(from_val(&r));
            return;
        }
    }

    env.state.push(TSTR);
}

// --- truthiness and casts -------------------------------------------------

fn cast_bool_impl(env: &mut Env<'_>, flags: &mut StepFlags, t: &Ty, negate: bool) {
    flags.nothrow();
    flags.constprop();

    match emptiness(t) {
        Emptiness::Empty => env.state.push(bval(negate)),
        Emptiness::NonEmpty => env.state.push(bval(!negate)),
        Emptiness::Maybe => env.state.push(TBOOL),
    }
}

fn cast_int(env: &mut Env<'_>) -> StepFlags {
    let mut flags = StepFlags::default();
    flags.constprop();

    let t = env.state.top_ty(0);
    if t.subtype_of(&TINT) {
        return reduce(env, vec![Op::Nop]);
    }
    env.state.popc();
    // objects warn when converted to int
    if !t.could_be(&TOBJ) {
        flags.nothrow();
    }
    if let Some(v) = t.as_const() {
        if let Some(r) = value::cast_int(&v) {
            env.state.push(from_val(&r));
            return flags;
        }
    }
    env.state.push(TINT);
    flags
}

fn cast_impl(env: &mut Env<'_>, target: Ty, eval: Option<fn(&Val) -> Option<Val>>) -> StepFlags {
    let mut flags = StepFlags::default();

    let t = env.state.top_ty(0);
    if t.subtype_of(&target) {
        return reduce(env, vec![Op::Nop]);
    }
    env.state.popc();
    if let (Some(eval), Some(v)) = (eval, t.as_const()) {
        if let Some(r) = eval(&v) {
            flags.constprop();
            env.state.push(from_val(&r));
            return flags;
        }
    }
    env.state.push(target);
    flags
}

// --- type tests -----------------------------------------------------------

fn is_type_impl(env: &mut Env<'_>, flags: &mut StepFlags, t: &Ty, test: &Ty) {
    flags.constprop();
    if t.subtype_of(test) {
        env.state.push(TTRUE);
    } else if !t.could_be(test) {
        env.state.push(TFALSE);
    } else {
        env.state.push(TBOOL);
    }
}

fn is_type_l(env: &mut Env<'_>, flags: &mut StepFlags, l: LocalId, op: IsTypeOp) {
    if !env.state.loc_could_be_uninit(l) {
        flags.nothrow();
        flags.constprop();
    }
    let t = env.state.loc_as_cell(l);
    match op {
        IsTypeOp::Scalar => env.state.push(TBOOL),
        _ => is_type_impl(env, flags, &t, &type_of_istype(op)),
    }
}

fn is_type_c(env: &mut Env<'_>, flags: &mut StepFlags, op: IsTypeOp) {
    flags.nothrow();
    let t = env.state.popc();
    match op {
        IsTypeOp::Scalar => env.state.push(TBOOL),
        _ => is_type_impl(env, flags, &t, &type_of_istype(op)),
    }
}

fn is_uninit(env: &mut Env<'_>, flags: &mut StepFlags) {
    flags.nothrow();
    let t = env.state.popcu();
    env.state.push(t.clone());
    is_type_impl(env, flags, &t, &TUNINIT);
}

/// Index-aware instanceof decision: `Some(true)` when every value passes,
/// `Some(false)` when none can.
pub(crate) fn instanceof_decided(env: &Env<'_>, t: &Ty, spec: ClsSpec) -> Option<bool> {
    if t.subtype_of(&TOBJ) {
        if t.subtype_of(&obj_of(spec)) {
            return Some(true);
        }
        if let Some(r) = obj_rel(env.index, t, spec) {
            return Some(r);
        }
        return None;
    }
    if !t.could_be(&TOBJ) {
        return Some(false);
    }
    // a null-ish part always fails the test, so only a definite "no" on
    // the object part decides anything
    if obj_rel(env.index, t, spec) == Some(false) {
        return Some(false);
    }
    None
}

fn instance_of_d(env: &mut Env<'_>, name: &str) -> StepFlags {
    let mut flags = StepFlags::default();
    let t1 = env.state.top_ty(0);

    // resolution can autoload, so this is nothrow only once it resolves
    if let Some(rcls) = env.index.resolve_class(name) {
        let spec = ClsSpec { cls: rcls.id, exact: rcls.exact };

        let result = match instanceof_decided(env, &t1, spec) {
            Some(true) => Some(TTRUE),
            Some(false) => Some(TFALSE),
            None => None,
        };
        if let Some(r) = result {
            flags.nothrow();
            flags.constprop();
            env.state.popc();
            env.state.push(r);
            return flags;
        }

        if is_opt(&t1) {
            let inner = unopt(&t1);
            if instanceof_decided(env, &inner, spec) == Some(true) {
                // passes exactly when it isn't null
                return reduce(env, vec![Op::IsTypeC(IsTypeOp::Null), Op::Not]);
            }
        }

        flags.nothrow();
        env.state.popc();
        env.state.push(TBOOL);
        return flags;
    }

    env.state.popc();
    env.state.push(TBOOL);
    flags
}

fn instance_of(env: &mut Env<'_>) -> StepFlags {
    let t1 = env.state.top_ty(0);
    if let Some(Val::Str(name)) = t1.as_const() {
        return reduce(env, vec![Op::PopC, Op::InstanceOfD(name)]);
    }

    if let Some(spec) = t1.obj_spec() {
        if t1.subtype_of(&TOBJ) && spec.exact {
            if let Some(name) = env.index.class_name(spec.cls) {
                return reduce(env, vec![Op::PopC, Op::InstanceOfD(name)]);
            }
        }
    }

    let mut flags = StepFlags::default();
    env.state.popc();
    env.state.popc();
    env.state.push(TBOOL);
    flags
}

// --- control flow ---------------------------------------------------------

fn jmp_impl(env: &mut Env<'_>, flags: &mut StepFlags, target: BlockId, taken_on_truthy: bool) {
    flags.nothrow();
    let location = env.state.top_local(0);
    let t = env.state.popc();

    match emptiness(&t) {
        e @ (Emptiness::Empty | Emptiness::NonEmpty) => {
            // statically decided: the dead edge gets no propagation
            let taken = (e == Emptiness::NonEmpty) == taken_on_truthy;
            if taken {
                flags.jmp_dest = Some(target);
                (env.propagate)(target, env.state);
            } else {
                flags.jmp_dest = env.blk.fallthrough;
            }
        }

        Emptiness::Maybe => {
            let Some(l) = location else {
                (env.propagate)(target, env.state);
                return;
            };
            if taken_on_truthy {
                refine_location(env, Loc::Local(l), &assert_nonemptiness, target, &assert_emptiness);
            } else {
                refine_location(env, Loc::Local(l), &assert_emptiness, target, &assert_nonemptiness);
            }
        }
    }
}

fn switch(env: &mut Env<'_>, flags: &mut StepFlags, targets: &[BlockId]) {
    let t = env.state.popc();
    if t.subtype_of(&TINT) {
        flags.nothrow();
    }

    if let Some(Val::Int(v)) = t.as_const() {
        if v >= 0 && (v as usize) < targets.len() {
            let dest = targets[v as usize];
            flags.jmp_dest = Some(dest);
            (env.propagate)(dest, env.state);
            return;
        }
    }

    for &dest in targets {
        (env.propagate)(dest, env.state);
    }
}

fn sswitch(
    env: &mut Env<'_>,
    flags: &mut StepFlags,
    cases: &[(Arc<str>, BlockId)],
    default: BlockId,
) {
    let t = env.state.popc();
    if t.subtype_of(&TSTR) {
        flags.nothrow();
    }

    if let Some(Val::Str(s)) = t.as_const() {
        let dest = cases
            .iter()
            .find(|(case, _)| *case == s)
            .map(|&(_, dest)| dest)
            .unwrap_or(default);
        flags.jmp_dest = Some(dest);
        (env.propagate)(dest, env.state);
        return;
    }

    for &(_, dest) in cases {
        (env.propagate)(dest, env.state);
    }
    (env.propagate)(default, env.state);
}

// --- locals ---------------------------------------------------------------

fn cu_get_l(env: &mut Env<'_>, l: LocalId) -> StepFlags {
    let raw = env.state.loc_raw(l);
    if raw.subtype_of(&TUNINIT) && !env.state.loc_could_be_ref(l) {
        return reduce(env, vec![Op::NullUninit]);
    }

    let mut flags = StepFlags::default();
    flags.nothrow();
    if !raw.could_be(&TUNINIT) {
        flags.constprop();
    }
    let ty = if raw.subtype_of(&TCELL) && !env.state.loc_could_be_ref(l) {
        raw
    } else {
        TCELL
    };
    push_loc_equiv(env, ty, l);
    flags
}

fn cget_l2(env: &mut Env<'_>, flags: &mut StepFlags, l: LocalId) {
    if !env.state.loc_could_be_uninit(l) {
        flags.effect_free();
    }
    let loc = env.state.loc_as_cell(l);
    let top_equiv = env.state.top_local(0);
    let top = env.state.popt();
    push_loc_equiv(env, loc, l);
    env.state.push_equiv(
        top,
        top_equiv.map(StkEquiv::Local).unwrap_or(StkEquiv::None),
    );
}

fn push_l(env: &mut Env<'_>, l: LocalId) -> StepFlags {
    if !env.state.loc_could_be_ref(l) {
        let raw = env.state.loc_raw(l);
        if raw.subtype_of(&TUNINIT) {
            return reduce(env, vec![Op::NullUninit, Op::UnsetL(l)]);
        }
        if let Some(v) = raw.as_const() {
            return reduce(env, vec![gen_constant(&v), Op::UnsetL(l)]);
        }
    }
    impl_seq(env, vec![Op::CGetL(l), Op::UnsetL(l)], false)
}

/// Shared move-to-local logic for `SetL`/`PopL`. Returns `None`, leaving
/// all state untouched, when the local already provably holds the value.
fn move_to_loc(env: &mut Env<'_>, flags: &mut StepFlags, l: LocalId) -> Option<(Ty, Option<LocalId>)> {
    flags.nothrow();
    let mut equiv = env.state.top_local(0);

    if !env.state.loc_could_be_ref(l) {
        if let Some(eq) = equiv {
            if (eq == l || env.state.locs_are_equiv(eq, l))
                && env.state.loc_raw(l) == env.state.top_ty(0)
            {
                return None;
            }
        } else {
            equiv = Some(l);
        }
    }

    let val = env.state.popc();
    env.state.set_loc(l, val.clone());
    if !env.state.loc_could_be_ref(l) {
        if let Some(eq) = equiv {
            if eq != l {
                env.state.add_loc_equiv(l, eq);
            }
        }
    }
    Some((val, equiv))
}

fn set_l(env: &mut Env<'_>, l: LocalId) -> StepFlags {
    let mut flags = StepFlags::default();
    match move_to_loc(env, &mut flags, l) {
        Some((val, equiv)) => {
            let equiv = equiv.map(StkEquiv::Local).unwrap_or(StkEquiv::None);
            env.state.push_equiv(val, equiv);
            flags
        }
        // the value is already there; the stack is left as-is
        None => reduce(env, vec![Op::Nop]),
    }
}

fn pop_l(env: &mut Env<'_>, l: LocalId) -> StepFlags {
    let mut flags = StepFlags::default();
    match move_to_loc(env, &mut flags, l) {
        Some(_) => flags,
        None => reduce(env, vec![Op::PopC]),
    }
}

fn eval_set_op(kind: SetOpKind, lhs: &Val, rhs: &Val) -> Option<Val> {
    match kind {
        SetOpKind::PlusEq => value::add(lhs, rhs),
        SetOpKind::MinusEq => value::sub(lhs, rhs),
        SetOpKind::MulEq => value::mul(lhs, rhs),
        SetOpKind::DivEq => value::div(lhs, rhs),
        SetOpKind::ModEq => value::imod(lhs, rhs),
        SetOpKind::PowEq => value::pow(lhs, rhs),
        SetOpKind::ConcatEq => value::concat(lhs, rhs),
        SetOpKind::AndEq => value::bit_and(lhs, rhs),
        SetOpKind::OrEq => value::bit_or(lhs, rhs),
        SetOpKind::XorEq => value::bit_xor(lhs, rhs),
        SetOpKind::ShlEq => value::shl(lhs, rhs),
        SetOpKind::ShrEq => value::shr(lhs, rhs),
    }
}

fn ty_set_op(kind: SetOpKind, lhs: &Ty, rhs: &Ty) -> Ty {
    match kind {
        SetOpKind::PlusEq | SetOpKind::MinusEq | SetOpKind::MulEq | SetOpKind::PowEq => {
            ty_arith_num(lhs, rhs)
        }
        SetOpKind::DivEq => ty_arith_div(lhs, rhs),
        SetOpKind::ModEq => ty_arith_mod(lhs, rhs),
        SetOpKind::ConcatEq => TSTR,
        SetOpKind::AndEq | SetOpKind::OrEq | SetOpKind::XorEq => ty_bitop(lhs, rhs),
        SetOpKind::ShlEq | SetOpKind::ShrEq => TINT,
    }
}

fn set_op_l(env: &mut Env<'_>, l: LocalId, kind: SetOpKind) {
    let t1 = env.state.popc();
    let loc = env.state.loc_as_cell(l);

    let ty = match (loc.as_const(), t1.as_const()) {
        // no constprop: the fold also rebinds the local
        (Some(v2), Some(v1)) => match eval_set_op(kind, &v2, &v1) {
            Some(r) => from_val(&r),
            None => TINITCELL,
        },
        _ => ty_set_op(kind, &loc, &t1),
    };

    env.state.set_loc(l, ty.clone());
    env.state.push(ty);
}

fn eval_inc_dec(op: IncDecOp, v: &Val) -> Option<Val> {
    let one = Val::Int(1);
    match v {
        Val::Int(_) | Val::Dbl(_) => {
            if op.is_inc() {
                value::add(v, &one)
            } else {
                value::sub(v, &one)
            }
        }
        // incrementing null gives 1, decrementing leaves it alone
        Val::Null => Some(if op.is_inc() { Val::Int(1) } else { Val::Null }),
        _ => None,
    }
}

fn inc_dec_l(env: &mut Env<'_>, flags: &mut StepFlags, l: LocalId, op: IncDecOp) {
    let loc = env.state.loc_as_cell(l);

    let new_ty = match loc.as_const().and_then(|v| eval_inc_dec(op, &v)) {
        Some(v) => from_val(&v),
        None => {
            if loc.subtype_of(&TDBL) {
                TDBL
            } else if loc.subtype_of(&TNUM) {
                TNUM
            } else {
                TINITCELL
            }
        }
    };

    // a non-numeric string ++ can reallocate and fail
    if !env.state.loc_could_be_uninit(l) && !loc.could_be(&TSTR) {
        flags.nothrow();
    }

    if !op.is_pre() {
        env.state.push(loc);
    }
    env.state.set_loc(l, new_ty.clone());
    if op.is_pre() {
        env.state.push(new_ty);
    }
}

fn isset_l(env: &mut Env<'_>, flags: &mut StepFlags, l: LocalId) {
    flags.nothrow();
    flags.constprop();
    let loc = env.state.loc_as_cell(l);
    if loc.subtype_of(&TINITNULL) {
        env.state.push(TFALSE);
    } else if !loc.could_be(&TINITNULL) {
        env.state.push(TTRUE);
    } else {
        env.state.push(TBOOL);
    }
}

// --- this -----------------------------------------------------------------

fn this_ty(env: &Env<'_>) -> Ty {
    env.func.cls.map(crate::ty::obj_sub).unwrap_or(TOBJ)
}

fn this_op(env: &mut Env<'_>) -> StepFlags {
    if env.state.this_available {
        return reduce(env, vec![Op::BareThis(BareThisOp::NeverNull)]);
    }
    let flags = StepFlags::default();
    let ty = this_ty(env);
    env.state.push(ty);
    env.state.this_available = true;
    flags
}

fn bare_this(env: &mut Env<'_>, op: BareThisOp) -> StepFlags {
    if env.state.this_available && op != BareThisOp::NeverNull {
        return reduce(env, vec![Op::BareThis(BareThisOp::NeverNull)]);
    }

    let mut flags = StepFlags::default();
    let ty = this_ty(env);
    match op {
        BareThisOp::Notice => env.state.push(opt(&ty)),
        BareThisOp::NoNotice => {
            flags.nothrow();
            env.state.push(opt(&ty));
        }
        BareThisOp::NeverNull => {
            flags.nothrow();
            env.state.this_available = true;
            env.state.push(ty);
        }
    }
    flags
}

fn check_this(env: &mut Env<'_>) -> StepFlags {
    if env.state.this_available {
        return reduce(env, vec![Op::Nop]);
    }
    let flags = StepFlags::default();
    env.state.this_available = true;
    flags
}

// --- class references and statics -----------------------------------------

fn cls_of_spec(spec: ClsSpec) -> Ty {
    if spec.exact {
        crate::ty::cls_exact(spec.cls)
    } else {
        crate::ty::cls_sub(spec.cls)
    }
}

fn cls_ref_get(env: &mut Env<'_>, flags: &mut StepFlags, t: Ty, slot: ClsRefSlot) {
    let cls = if t.subtype_of(&TOBJ) {
        flags.nothrow();
        match t.obj_spec() {
            Some(spec) => cls_of_spec(spec),
            None => TCLS,
        }
    } else if let Some(Val::Str(name)) = t.as_const() {
        match env.index.resolve_class(&name) {
            Some(rcls) => cls_of_spec(ClsSpec { cls: rcls.id, exact: rcls.exact }),
            None => TCLS,
        }
    } else {
        TCLS
    };
    env.state.put_cls_ref(slot, cls);
}

fn cls_ref_name(env: &mut Env<'_>, flags: &mut StepFlags, slot: ClsRefSlot) {
    let cls = env.state.take_cls_ref(slot);
    flags.nothrow();
    if let Some(spec) = cls.cls_spec() {
        if spec.exact {
            if let Some(name) = env.index.class_name(spec.cls) {
                flags.constprop();
                env.state.push(sval(name));
                return;
            }
        }
    }
    env.state.push(TSTR);
}

fn cls_cns(env: &mut Env<'_>, slot: ClsRefSlot, name: &Arc<str>) -> StepFlags {
    if let Some(spec) = env.state.peek_cls_ref(slot).cls_spec() {
        if spec.exact {
            if let Some(cls_name) = env.index.class_name(spec.cls) {
                return reduce(
                    env,
                    vec![
                        Op::DiscardClsRef(slot),
                        Op::ClsCnsD(cls_name, Arc::clone(name)),
                    ],
                );
            }
        }
    }
    let flags = StepFlags::default();
    env.state.take_cls_ref(slot);
    env.state.push(TINITCELL);
    flags
}

fn cls_cns_d(env: &mut Env<'_>, flags: &mut StepFlags, cls: &str, name: &str) {
    let v = env
        .index
        .resolve_class(cls)
        .and_then(|r| env.index.lookup_class_constant(r.id, name));
    match v {
        Some(v) => {
            flags.constprop();
            env.state.push(from_val(&v));
        }
        None => env.state.push(TINITCELL),
    }
}

fn cns(env: &mut Env<'_>, flags: &mut StepFlags, name: &str) {
    match env.index.lookup_constant(name) {
        Some(v) => {
            flags.constprop();
            env.state.push(from_val(&v));
        }
        None => env.state.push(TINITCELL),
    }
}

fn cget_s(env: &mut Env<'_>, flags: &mut StepFlags, slot: ClsRefSlot) {
    let tcls = env.state.take_cls_ref(slot);
    let tname = env.state.popc();

    let ty = env.index.lookup_public_static(&tcls, &tname);
    if ty.subtype_of(&TINITCELL) {
        if ty != TINITCELL {
            flags.constprop();
        }
        env.state.push(ty);
    } else {
        env.state.push(TINITCELL);
    }
}

fn set_s(env: &mut Env<'_>, slot: ClsRefSlot) {
    let t1 = env.state.popc();
    env.state.take_cls_ref(slot);
    env.state.popc();
    env.state.push(t1);
}

// --- arrays ---------------------------------------------------------------

fn new_list(env: &mut Env<'_>, flags: &mut StepFlags, n: u32) {
    let mut elems: Vec<Ty> = (0..n).map(|_| env.state.popc()).collect();
    elems.reverse();

    flags.effect_free();
    if elems.iter().all(Ty::is_scalar) {
        flags.constprop();
    }
    env.state.push(tuple(elems));
}

fn new_dict(env: &mut Env<'_>, flags: &mut StepFlags, n: u32) {
    let mut pairs: Vec<(Ty, Ty)> = (0..n)
        .map(|_| {
            let v = env.state.popc();
            let k = env.state.popc();
            (k, v)
        })
        .collect();
    pairs.reverse();

    if pairs.iter().all(|(k, _)| k.subtype_of(&TARRKEY)) {
        flags.effect_free();
    }

    let consts: Option<Vec<(ArrKey, Val)>> = pairs
        .iter()
        .map(|(k, v)| {
            let k = match k.as_const()? {
                Val::Int(i) => ArrKey::Int(i),
                Val::Str(s) => ArrKey::Str(s),
                _ => return None,
            };
            Some((k, v.as_const()?))
        })
        .collect();

    if let Some(kvs) = consts {
        // a repeated key keeps its first position and the last value
        let mut out: Vec<(ArrKey, Val)> = Vec::with_capacity(kvs.len());
        for (k, v) in kvs {
            match out.iter_mut().find(|(ek, _)| *ek == k) {
                Some(slot) => slot.1 = v,
                None => out.push((k, v)),
            }
        }
        flags.constprop();
        env.state.push(aval(Val::Dict(out.into())));
        return;
    }

    let key = pairs.iter().fold(TBOTTOM, |acc, (k, _)| union_of(&acc, k));
    let val = pairs.iter().fold(TBOTTOM, |acc, (_, v)| union_of(&acc, v));
    env.state.push(dict_of(key, val));
}

fn add_elem(env: &mut Env<'_>, flags: &mut StepFlags) {
    let v = env.state.popc();
    let k = env.state.popc();
    let base = env.state.popc();

    if k.subtype_of(&TARRKEY) && base.subtype_of(&TARR) {
        flags.nothrow();
    }

    if let (Some(Val::Dict(kvs)), Some(kv), Some(vv)) = (base.as_const(), k.as_const(), v.as_const())
    {
        let key = match kv {
            Val::Int(i) => Some(ArrKey::Int(i)),
            Val::Str(s) => Some(ArrKey::Str(s)),
            _ => None,
        };
        if let Some(key) = key {
            let mut out = kvs.to_vec();
            match out.iter_mut().find(|(ek, _)| *ek == key) {
                Some(slot) => slot.1 = vv,
                None => out.push((key, vv)),
            }
            flags.constprop();
            env.state.push(aval(Val::Dict(out.into())));
            return;
        }
    }

    env.state.push(if base.subtype_of(&TARR) { TARR } else { TINITCELL });
}

fn add_new_elem(env: &mut Env<'_>, flags: &mut StepFlags) {
    let v = env.state.popc();
    let base = env.state.popc();

    if base.subtype_of(&TARR) {
        flags.nothrow();
    }

    if let (Some(Val::List(xs)), Some(vv)) = (base.as_const(), v.as_const()) {
        let mut out = xs.to_vec();
        out.push(vv);
        flags.constprop();
        env.state.push(aval(Val::List(out.into())));
        return;
    }

    if base.subtype_of(&TLIST) {
        let pushed = match base.arr_shape() {
            Some(ArrTy::Tuple(xs)) => {
                let mut elems = xs.to_vec();
                elems.push(v);
                tuple(elems)
            }
            Some(ArrTy::ListOf(elem)) => list_of(union_of(elem, &v)),
            _ => TLIST,
        };
        env.state.push(pushed);
        return;
    }

    env.state.push(if base.subtype_of(&TARR) { TARR } else { TINITCELL });
}

fn ak_exists(env: &mut Env<'_>, flags: &mut StepFlags) {
    let base = env.state.popc();
    let key = env.state.popc();

    let obj_or_arr = union_of(&TOBJ, &TARR);
    let key_nothrow = key.subtype_of(&union_of(&TSTR, &TINITNULL)) || key.subtype_of(&TINT);
    if base.subtype_of(&obj_or_arr) && key_nothrow {
        flags.nothrow();
    }

    if let (Some(b), Some(k)) = (base.as_const(), key.as_const()) {
        if let Some(r) = value::arr_has_key(&b, &k) {
            flags.constprop();
            env.state.push(bval(r));
            return;
        }
    }
    env.state.push(TBOOL);
}

// --- calls ----------------------------------------------------------------

fn fpush_func_d(env: &mut Env<'_>, name: &str) {
    let rfunc = env.index.resolve_func(name);
    env.state.fpi_push(ActRec {
        kind: FpiKind::Func,
        ctx: TBOTTOM,
        func: rfunc,
        fallback: None,
    });
}

fn fpush_func(env: &mut Env<'_>, argc: u32) -> StepFlags {
    let t1 = env.state.top_ty(0);
    if let Some(Val::Str(name)) = t1.as_const() {
        return reduce(env, vec![Op::PopC, Op::FPushFuncD(argc, name)]);
    }

    let flags = StepFlags::default();
    env.state.popc();
    let ar = if t1.subtype_of(&TOBJ) {
        // invokable object; resolution happens at runtime
        ActRec { kind: FpiKind::Unknown, ctx: t1, func: None, fallback: None }
    } else if t1.subtype_of(&TSTR) {
        ActRec { kind: FpiKind::Func, ctx: TTOP, func: None, fallback: None }
    } else {
        ActRec::unknown()
    };
    env.state.fpi_push(ar);
    flags
}

fn fpush_func_u(env: &mut Env<'_>, name: &str, fallback_name: &str) {
    let primary = env.index.resolve_func(name);
    let fallback = env.index.resolve_func(fallback_name);
    env.state.fpi_push(ActRec {
        kind: FpiKind::Func,
        ctx: TBOTTOM,
        func: primary,
        fallback,
    });
}

fn fpush_obj_method_d(env: &mut Env<'_>, name: &str, null_op: ObjMethodOp) {
    let mut t1 = env.state.top_ty(0);

    let dead = match null_op {
        ObjMethodOp::NullThrows => !t1.could_be(&TOBJ),
        ObjMethodOp::NullSafe => !t1.could_be(&TOPTOBJ),
    };
    if dead {
        env.state.fpi_push(ActRec {
            kind: FpiKind::Method,
            ctx: t1,
            func: None,
            fallback: None,
        });
        env.state.popc();
        env.state.unreachable = true;
        return;
    }

    if null_op == ObjMethodOp::NullThrows && is_opt(&t1) {
        t1 = unopt(&t1);
    }

    let rfunc = env.index.resolve_method(&t1, name);
    env.state.fpi_push(ActRec {
        kind: FpiKind::Method,
        ctx: t1,
        func: rfunc,
        fallback: None,
    });

    let location = env.state.top_local(0);
    env.state.popc();

    // the call proves the receiver is an object (or null, when nullsafe)
    if let Some(l) = location {
        if env.state.loc_raw(l).subtype_of(&TCELL) {
            refine_loc(env.state, Loc::Local(l), &|t| {
                if t.obj_spec().is_none() {
                    return if null_op == ObjMethodOp::NullThrows { TOBJ } else { TOPTOBJ };
                }
                if is_opt(t) && null_op == ObjMethodOp::NullThrows {
                    return unopt(t);
                }
                t.clone()
            });
        }
    }
}

fn fpush_cls_method_d(env: &mut Env<'_>, cls_name: &str, meth: &str) {
    let (ctx, rfunc) = match env.index.resolve_class(cls_name) {
        Some(rcls) => {
            let cls_ty = cls_of_spec(ClsSpec { cls: rcls.id, exact: rcls.exact });
            let rfunc = env.index.resolve_method(&cls_ty, meth);
            (cls_ty, rfunc)
        }
        None => (TCLS, None),
    };
    env.state.fpi_push(ActRec {
        kind: FpiKind::Method,
        ctx,
        func: rfunc,
        fallback: None,
    });
}

fn fpush_ctor_d(env: &mut Env<'_>, cls_name: &str) {
    match env.index.resolve_class(cls_name) {
        Some(rcls) => {
            let obj = obj_exact(rcls.id);
            env.state.push(obj.clone());
            let ctor = env.index.resolve_ctor(rcls);
            env.state.fpi_push(ActRec {
                kind: FpiKind::Ctor,
                ctx: obj,
                func: ctor,
                fallback: None,
            });
        }
        None => {
            env.state.push(TOBJ);
            env.state.fpi_push(ActRec {
                kind: FpiKind::Ctor,
                ctx: TOBJ,
                func: None,
                fallback: None,
            });
        }
    }
}

fn fpush_ctor(env: &mut Env<'_>, argc: u32, slot: ClsRefSlot) -> StepFlags {
    if let Some(spec) = env.state.peek_cls_ref(slot).cls_spec() {
        if spec.exact {
            if let Some(name) = env.index.class_name(spec.cls) {
                return reduce(
                    env,
                    vec![Op::DiscardClsRef(slot), Op::FPushCtorD(argc, name)],
                );
            }
        }
    }

    let flags = StepFlags::default();
    let cls = env.state.take_cls_ref(slot);
    let obj = match cls.cls_spec() {
        Some(spec) => obj_of(ClsSpec { cls: spec.cls, exact: spec.exact }),
        None => TOBJ,
    };
    env.state.push(obj.clone());
    env.state.fpi_push(ActRec {
        kind: FpiKind::Ctor,
        ctx: obj,
        func: None,
        fallback: None,
    });
    flags
}

fn fcall(env: &mut Env<'_>, argc: u32) -> StepFlags {
    let argc = argc as usize;
    let ar = env.state.fpi_top().clone();

    // fold pure calls on fully constant arguments
    if let (Some(func), None) = (ar.func, &ar.fallback) {
        if env.state.stack_depth() >= argc {
            let consts: Option<Vec<Val>> =
                (0..argc).map(|d| env.state.top_ty(d).as_const()).collect();
            if let Some(mut vals) = consts {
                vals.reverse();
                if let Some(v) = env.index.fold_call(func, &vals) {
                    env.state.fpi_pop();
                    let mut repl = vec![Op::PopC; argc];
                    repl.push(gen_constant(&v));
                    return reduce(env, repl);
                }
            }
        }
    }

    let flags = StepFlags::default();
    let mut args: Vec<Ty> = (0..argc).map(|_| env.state.popc()).collect();
    args.reverse();
    let ar = env.state.fpi_pop();

    // the callee may write back through any reference-bound local
    env.state.kill_ref_locals();

    let ret = match ar.func {
        Some(func) => {
            let call = CallCtx { args: &args, ctx: ar.ctx.clone() };
            let ty = env.index.lookup_return_type(func, &call);
            let ty = match ar.fallback {
                Some(fb) => union_of(&ty, &env.index.lookup_return_type(fb, &call)),
                None => ty,
            };
            if ty.subtype_of(&TINITCELL) { ty } else { TINITCELL }
        }
        None => TINITCELL,
    };
    env.state.push(ret);
    flags
}

// --- iterators ------------------------------------------------------------

fn set_iter_locals(env: &mut Env<'_>, info: &IterInfo, val: LocalId, key: Option<LocalId>) {
    env.state.set_loc(val, info.value.clone());
    if let Some(k) = key {
        env.state.set_loc(k, info.key.clone());
    }
}

fn iter_init(
    env: &mut Env<'_>,
    flags: &mut StepFlags,
    iter: IterId,
    target: BlockId,
    val: LocalId,
    key: Option<LocalId>,
) {
    let t1 = env.state.popc();
    let info = iter_types(&t1);
    if !info.may_throw_on_init {
        flags.nothrow();
    }

    match info.count {
        IterCount::Empty => {
            // branch taken before any local is written, after the pop
            env.state.free_iter(iter);
            (env.propagate)(target, env.state);
            flags.jmp_dest = Some(target);
        }
        IterCount::Single | IterCount::NonEmpty => {
            set_iter_locals(env, &info, val, key);
            env.state.set_iter(iter, info);
            flags.jmp_dest = env.blk.fallthrough;
        }
        IterCount::ZeroOrOne | IterCount::Any => {
            env.state.free_iter(iter);
            (env.propagate)(target, env.state);
            set_iter_locals(env, &info, val, key);
            env.state.set_iter(iter, info);
        }
    }
}

fn iter_next(
    env: &mut Env<'_>,
    flags: &mut StepFlags,
    iter: IterId,
    target: BlockId,
    val: LocalId,
    key: Option<LocalId>,
) {
    let cur_val = env.state.loc_raw(val);
    let cur_key = key.map(|k| env.state.loc_raw(k));

    let no_taken = match env.state.iter(iter).clone() {
        Iter::Dead => {
            // nothing is known about this iterator on this path
            warn!("advancing an untracked iterator; falling back to unknown types");
            env.state.set_loc(val, TINITCELL);
            if let Some(k) = key {
                env.state.set_loc(k, TINITCELL);
            }
            false
        }
        Iter::Tracked(info) => {
            if !info.may_throw_on_next {
                flags.nothrow();
            }
            match info.count {
                IterCount::Single | IterCount::ZeroOrOne => true,
                IterCount::NonEmpty | IterCount::Any => {
                    set_iter_locals(env, &info, val, key);
                    false
                }
                IterCount::Empty => unreachable!("advancing an iterator known to be empty"),
            }
        }
    };

    if no_taken {
        flags.jmp_dest = env.blk.fallthrough;
        env.state.free_iter(iter);
        return;
    }

    (env.propagate)(target, env.state);

    env.state.free_iter(iter);
    env.state.set_loc(val, cur_val);
    if let (Some(k), Some(ck)) = (key, cur_key) {
        env.state.set_loc(k, ck);
    }
}

// --- dispatch -------------------------------------------------------------

/// The single-instruction transfer function: pops the declared operands,
/// pushes results, and returns the step's effect flags (pessimistic unless
/// asserted otherwise).
pub(crate) fn dispatch(env: &mut Env<'_>, op: &Op) -> StepFlags {
    let mut flags = StepFlags::default();

    match op {
        Op::Nop => flags.effect_free(),

        Op::Dup => {
            flags.effect_free();
            let equiv = env.state.top_equiv(0);
            let ty = env.state.popc();
            env.state.push_equiv(ty.clone(), equiv);
            env.state.push_equiv(ty, StkEquiv::Dup);
        }

        Op::PopC => {
            flags.nothrow();
            if !could_run_destructor(&env.state.popc()) {
                flags.effect_free();
            }
        }
        Op::PopV => {
            flags.nothrow();
            env.state.popv();
        }
        Op::PopU => {
            flags.effect_free();
            env.state.popu();
        }

        Op::Null => {
            flags.effect_free();
            flags.constprop();
            env.state.push(TINITNULL);
        }
        Op::NullUninit => {
            flags.effect_free();
            env.state.push(TUNINIT);
        }
        Op::True => {
            flags.effect_free();
            flags.constprop();
            env.state.push(TTRUE);
        }
        Op::False => {
            flags.effect_free();
            flags.constprop();
            env.state.push(TFALSE);
        }
        Op::Int(v) => {
            flags.effect_free();
            flags.constprop();
            env.state.push(ival(*v));
        }
        Op::Double(v) => {
            flags.effect_free();
            flags.constprop();
            env.state.push(from_val(&Val::Dbl(*v)));
        }
        Op::Str(s) => {
            flags.effect_free();
            flags.constprop();
            env.state.push(sval(Arc::clone(s)));
        }
        Op::Arr(v) => {
            flags.effect_free();
            flags.constprop();
            env.state.push(aval(v.clone()));
        }

        Op::NewList(n) => new_list(env, &mut flags, *n),
        Op::NewDict(n) => new_dict(env, &mut flags, *n),
        Op::AddElemC => add_elem(env, &mut flags),
        Op::AddNewElemC => add_new_elem(env, &mut flags),

        Op::Cns(name) => cns(env, &mut flags, name),
        Op::ClsCns(slot, name) => return cls_cns(env, *slot, name),
        Op::ClsCnsD(cls, name) => cls_cns_d(env, &mut flags, cls, name),

        Op::Concat => concat_n(env, &mut flags, 2),
        Op::ConcatN(n) => {
            if *n == 2 {
                return reduce(env, vec![Op::Concat]);
            }
            concat_n(env, &mut flags, *n);
        }

        Op::Add => arith(env, &mut flags, value::add, ty_arith_num),
        Op::Sub => arith(env, &mut flags, value::sub, ty_arith_num),
        Op::Mul => arith(env, &mut flags, value::mul, ty_arith_num),
        Op::Div => arith(env, &mut flags, value::div, ty_arith_div),
        Op::Mod => arith(env, &mut flags, value::imod, ty_arith_mod),
        Op::Pow => arith(env, &mut flags, value::pow, ty_arith_num),
        Op::BitAnd => arith(env, &mut flags, value::bit_and, ty_bitop),
        Op::BitOr => arith(env, &mut flags, value::bit_or, ty_bitop),
        Op::BitXor => arith(env, &mut flags, value::bit_xor, ty_bitop),
        Op::Shl => arith(env, &mut flags, value::shl, ty_shift),
        Op::Shr => arith(env, &mut flags, value::shr, ty_shift),
        Op::BitNot => bit_not(env, &mut flags),

        Op::Not => {
            let t = env.state.popc();
            cast_bool_impl(env, &mut flags, &t, true);
        }
        Op::Xor => xor_impl(env, &mut flags),

        Op::Same => same_impl(env, &mut flags, false),
        Op::NSame => same_impl(env, &mut flags, true),
        Op::Eq => eq_impl(env, &mut flags, false),
        Op::Neq => eq_impl(env, &mut flags, true),
        Op::Lt => cmp_bool(env, &mut flags, |o| o == Ordering::Less),
        Op::Lte => cmp_bool(env, &mut flags, |o| o != Ordering::Greater),
        Op::Gt => cmp_bool(env, &mut flags, |o| o == Ordering::Greater),
        Op::Gte => cmp_bool(env, &mut flags, |o| o != Ordering::Less),
        Op::Cmp => cmp_int(env, &mut flags),

        Op::CastBool => {
            if env.state.top_ty(0).subtype_of(&TBOOL) {
                return reduce(env, vec![Op::Nop]);
            }
            let t = env.state.popc();
            cast_bool_impl(env, &mut flags, &t, false);
        }
        Op::CastInt => return cast_int(env),
        Op::CastDouble => return cast_impl(env, TDBL, Some(value::cast_double)),
        Op::CastString => return cast_impl(env, TSTR, Some(value::cast_string)),
        Op::CastList => return cast_impl(env, TLIST, None),
        Op::CastDict => return cast_impl(env, TDICT, None),

        Op::InstanceOf => return instance_of(env),
        Op::InstanceOfD(name) => return instance_of_d(env, name),
        Op::IsTypeC(op) => is_type_c(env, &mut flags, *op),
        Op::IsTypeL(l, op) => is_type_l(env, &mut flags, *l, *op),
        Op::IsUninit => is_uninit(env, &mut flags),

        Op::Print => {
            env.state.popc();
            env.state.push(ival(1));
        }
        Op::Exit => {
            env.state.popc();
            env.state.push(TINITNULL);
        }
        Op::Fatal(_) => {
            env.state.popc();
        }

        Op::JmpZ(target) => jmp_impl(env, &mut flags, *target, false),
        Op::JmpNZ(target) => jmp_impl(env, &mut flags, *target, true),
        Op::Switch(targets) => switch(env, &mut flags, targets),
        Op::SSwitch { cases, default } => sswitch(env, &mut flags, cases, *default),

        Op::RetC => {
            let ty = env.state.popc();
            assert_eq!(env.state.stack_depth(), 0, "return with a non-empty stack");
            flags.effect_free();
            flags.returned = Some(ty);
        }
        Op::Throw => {
            env.state.popc();
        }
        Op::Catch => {
            flags.nothrow();
            let ty = env
                .index
                .throwable_class()
                .map(|r| obj_of(ClsSpec { cls: r.id, exact: r.exact }))
                .unwrap_or(TOBJ);
            env.state.push(ty);
        }

        Op::CGetL(l) => {
            if !env.state.loc_could_be_uninit(*l) {
                flags.nothrow();
                flags.constprop();
            }
            let ty = env.state.loc_as_cell(*l);
            push_loc_equiv(env, ty, *l);
        }
        Op::CGetQuietL(l) => {
            flags.nothrow();
            flags.constprop();
            let ty = env.state.loc_as_cell(*l);
            push_loc_equiv(env, ty, *l);
        }
        Op::CUGetL(l) => return cu_get_l(env, *l),
        Op::CGetL2(l) => cget_l2(env, &mut flags, *l),
        Op::PushL(l) => return push_l(env, *l),
        Op::SetL(l) => return set_l(env, *l),
        Op::PopL(l) => return pop_l(env, *l),
        Op::SetOpL(l, kind) => set_op_l(env, *l, *kind),
        Op::IncDecL(l, op) => inc_dec_l(env, &mut flags, *l, *op),
        Op::UnsetL(l) => {
            flags.nothrow();
            env.state.set_loc(*l, TUNINIT);
            env.state.set_loc_ref(*l, false);
        }
        Op::IssetL(l) => isset_l(env, &mut flags, *l),
        Op::EmptyL(l) => {
            let t = env.state.loc_as_cell(*l);
            cast_bool_impl(env, &mut flags, &t, true);
        }
        Op::VGetL(l) => {
            flags.nothrow();
            env.state.set_loc(*l, TINITCELL);
            env.state.set_loc_ref(*l, true);
            env.state.push(TREF);
        }
        Op::BindL(l) => {
            flags.nothrow();
            let t = env.state.popv();
            env.state.set_loc(*l, TINITCELL);
            env.state.set_loc_ref(*l, true);
            env.state.push(t);
        }
        Op::Box => {
            flags.effect_free();
            env.state.popc();
            env.state.push(TREF);
        }
        Op::Unbox => {
            flags.effect_free();
            env.state.popv();
            env.state.push(TINITCELL);
        }

        Op::This => return this_op(env),
        Op::BareThis(sub) => return bare_this(env, *sub),
        Op::CheckThis => return check_this(env),

        Op::StaticLocCheck(l, _) => {
            env.state.set_loc(*l, TINITCELL);
            env.state.set_loc_ref(*l, true);
            env.state.push(TBOOL);
        }
        Op::StaticLocDef(l, _) | Op::StaticLocInit(l, _) => {
            let init = env.state.popc();
            env.state.set_loc(*l, init);
            env.state.set_loc_ref(*l, true);
        }

        Op::ClsRefGetC(slot) => {
            let t = env.state.popc();
            cls_ref_get(env, &mut flags, t, *slot);
        }
        Op::ClsRefGetL(l, slot) => {
            let t = env.state.loc_as_cell(*l);
            cls_ref_get(env, &mut flags, t, *slot);
        }
        Op::DiscardClsRef(slot) => {
            flags.nothrow();
            env.state.take_cls_ref(*slot);
        }
        Op::ClsRefName(slot) => cls_ref_name(env, &mut flags, *slot),
        Op::CGetS(slot) => cget_s(env, &mut flags, *slot),
        Op::SetS(slot) => set_s(env, *slot),

        Op::CGetG => {
            env.state.popc();
            env.state.push(TINITCELL);
        }
        Op::SetG => {
            let t1 = env.state.popc();
            env.state.popc();
            env.state.push(t1);
        }
        Op::IssetG => {
            env.state.popc();
            env.state.push(TBOOL);
        }

        Op::AKExists => ak_exists(env, &mut flags),
        Op::Idx => {
            env.state.popc();
            env.state.popc();
            env.state.popc();
            env.state.push(TINITCELL);
        }

        Op::FPushFunc(argc) => return fpush_func(env, *argc),
        Op::FPushFuncD(_, name) => fpush_func_d(env, name),
        Op::FPushFuncU(_, name, fallback) => fpush_func_u(env, name, fallback),
        Op::FPushObjMethodD(_, name, null_op) => fpush_obj_method_d(env, name, *null_op),
        Op::FPushClsMethodD(_, cls, meth) => fpush_cls_method_d(env, cls, meth),
        Op::FPushCtor(argc, slot) => return fpush_ctor(env, *argc, *slot),
        Op::FPushCtorD(_, cls) => fpush_ctor_d(env, cls),
        Op::FCall(argc) => return fcall(env, *argc),

        Op::IterInit { iter, target, val } => {
            iter_init(env, &mut flags, *iter, *target, *val, None);
        }
        Op::IterInitK { iter, target, val, key } => {
            iter_init(env, &mut flags, *iter, *target, *val, Some(*key));
        }
        Op::IterNext { iter, target, val } => {
            iter_next(env, &mut flags, *iter, *target, *val, None);
        }
        Op::IterNextK { iter, target, val, key } => {
            iter_next(env, &mut flags, *iter, *target, *val, Some(*key));
        }
        Op::IterFree(iter) => {
            flags.nothrow();
            env.state.free_iter(*iter);
        }
        Op::IterBreak { target, iters } => {
            for &iter in iters.iter() {
                env.state.free_iter(iter);
            }
            (env.propagate)(*target, env.state);
            flags.jmp_dest = Some(*target);
        }
    }

    flags
}

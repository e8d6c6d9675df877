//! Lookahead grouping of conditional-branch idioms. Interpreting a type
//! test and the branch that consumes it as one combined rule lets the
//! taken and fallthrough edges carry different refinements of the tested
//! value; interpreted independently, both edges would see the same type.

use std::sync::Arc;

use log::trace;

use crate::bc::{BlockId, IsTypeOp, LocalId, Op, OpTag};
use crate::ty::{
    could_run_destructor, intersection_of, is_opt, obj_of, remove_uninit, unopt, ClsSpec, Ty,
    TBOOL, TCELL, TFALSE, TINITCELL, TINITNULL, TNULL, TOPTOBJ, TTRUE, TUNINIT,
};

use super::ops::{
    impl_seq, instanceof_decided, refine_loc, refine_location, resolve_same, type_of_istype, Loc,
};
use super::state::StkEquiv;
use super::{Env, StepFlags};

type GroupFn = fn(&mut Env<'_>, &[Op]) -> StepFlags;

struct Pattern {
    tags: &'static [OpTag],
    run: GroupFn,
}

/// The grouped idioms, consulted in order before single-instruction
/// dispatch. Every entry is a test (possibly negated) feeding a
/// conditional jump.
static GROUPS: &[Pattern] = &[
    Pattern { tags: &[OpTag::IsTypeL, OpTag::Not, OpTag::JmpZ], run: group_is_type_l },
    Pattern { tags: &[OpTag::IsTypeL, OpTag::Not, OpTag::JmpNZ], run: group_is_type_l },
    Pattern { tags: &[OpTag::IsTypeL, OpTag::JmpZ], run: group_is_type_l },
    Pattern { tags: &[OpTag::IsTypeL, OpTag::JmpNZ], run: group_is_type_l },
    Pattern { tags: &[OpTag::IsTypeC, OpTag::Not, OpTag::JmpZ], run: group_is_type_c },
    Pattern { tags: &[OpTag::IsTypeC, OpTag::Not, OpTag::JmpNZ], run: group_is_type_c },
    Pattern { tags: &[OpTag::IsTypeC, OpTag::JmpZ], run: group_is_type_c },
    Pattern { tags: &[OpTag::IsTypeC, OpTag::JmpNZ], run: group_is_type_c },
    Pattern { tags: &[OpTag::IsUninit, OpTag::Not, OpTag::JmpZ], run: group_is_uninit },
    Pattern { tags: &[OpTag::IsUninit, OpTag::Not, OpTag::JmpNZ], run: group_is_uninit },
    Pattern { tags: &[OpTag::IsUninit, OpTag::JmpZ], run: group_is_uninit },
    Pattern { tags: &[OpTag::IsUninit, OpTag::JmpNZ], run: group_is_uninit },
    Pattern { tags: &[OpTag::InstanceOfD, OpTag::Not, OpTag::JmpZ], run: group_instance_of_d },
    Pattern { tags: &[OpTag::InstanceOfD, OpTag::Not, OpTag::JmpNZ], run: group_instance_of_d },
    Pattern { tags: &[OpTag::InstanceOfD, OpTag::JmpZ], run: group_instance_of_d },
    Pattern { tags: &[OpTag::InstanceOfD, OpTag::JmpNZ], run: group_instance_of_d },
    Pattern { tags: &[OpTag::Same, OpTag::Not, OpTag::JmpZ], run: group_same },
    Pattern { tags: &[OpTag::Same, OpTag::Not, OpTag::JmpNZ], run: group_same },
    Pattern { tags: &[OpTag::Same, OpTag::JmpZ], run: group_same },
    Pattern { tags: &[OpTag::Same, OpTag::JmpNZ], run: group_same },
    Pattern { tags: &[OpTag::NSame, OpTag::Not, OpTag::JmpZ], run: group_nsame },
    Pattern { tags: &[OpTag::NSame, OpTag::Not, OpTag::JmpNZ], run: group_nsame },
    Pattern { tags: &[OpTag::NSame, OpTag::JmpZ], run: group_nsame },
    Pattern { tags: &[OpTag::NSame, OpTag::JmpNZ], run: group_nsame },
    Pattern { tags: &[OpTag::StaticLocCheck, OpTag::Not, OpTag::JmpZ], run: group_static_loc_check },
    Pattern { tags: &[OpTag::StaticLocCheck, OpTag::Not, OpTag::JmpNZ], run: group_static_loc_check },
    Pattern { tags: &[OpTag::StaticLocCheck, OpTag::JmpZ], run: group_static_loc_check },
    Pattern { tags: &[OpTag::StaticLocCheck, OpTag::JmpNZ], run: group_static_loc_check },
];

/// Matches the upcoming instruction window against the group patterns.
/// Returns the number of instructions consumed and the combined flags.
pub(crate) fn try_group(env: &mut Env<'_>, window: &[Op]) -> Option<(usize, StepFlags)> {
    'patterns: for pat in GROUPS {
        if pat.tags.len() > window.len() {
            continue;
        }
        for (tag, op) in pat.tags.iter().zip(window) {
            if OpTag::from(op) != *tag {
                continue 'patterns;
            }
        }
        let prefix = &window[..pat.tags.len()];
        trace!("  (group of {}: {})", prefix.len(), prefix[0]);
        return Some((prefix.len(), (pat.run)(env, prefix)));
    }
    None
}

/// The branch at the end of a group, with any interposed `Not` folded in:
/// `taken_on_true` says whether a successful test takes the jump.
#[derive(Debug, Clone, Copy)]
struct JmpInfo {
    target: BlockId,
    taken_on_true: bool,
}

fn jmp_info(window: &[Op]) -> JmpInfo {
    let negated = matches!(window.get(1), Some(Op::Not));
    match window.last() {
        Some(Op::JmpNZ(target)) => JmpInfo { target: *target, taken_on_true: !negated },
        Some(Op::JmpZ(target)) => JmpInfo { target: *target, taken_on_true: negated },
        _ => unreachable!("group without a trailing jump"),
    }
}

/// Interprets the window as independent instructions; used whenever a
/// combined rule has nothing to add.
fn bail(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    impl_seq(env, window.to_vec(), false)
}

fn top_loc(env: &Env<'_>, depth: usize) -> Option<Loc> {
    match env.state.top_equiv(depth) {
        StkEquiv::Local(l) => Some(Loc::Local(l)),
        StkEquiv::Dup => Some(Loc::Stack(depth + 1)),
        StkEquiv::None => None,
    }
}

fn loc_ty(env: &Env<'_>, loc: Loc) -> Ty {
    match loc {
        Loc::Local(l) => env.state.loc_raw(l),
        Loc::Stack(d) => env.state.top_ty(d),
    }
}

// --- type-test groups -----------------------------------------------------

enum IsTypeSrc {
    Local(LocalId),
    /// The tested value is the stack top; `Loc` is where the same value
    /// also lives.
    StackTop(Loc),
}

fn group_is_type_l(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    let (l, type_op) = match &window[0] {
        Op::IsTypeL(l, op) => (*l, *op),
        _ => unreachable!(),
    };
    is_type_branch(env, window, IsTypeSrc::Local(l), type_op)
}

fn group_is_type_c(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    let type_op = match &window[0] {
        Op::IsTypeC(op) => *op,
        _ => unreachable!(),
    };
    let Some(loc) = top_loc(env, 0) else {
        return bail(env, window);
    };
    is_type_branch(env, window, IsTypeSrc::StackTop(loc), type_op)
}

fn is_type_branch(
    env: &mut Env<'_>,
    window: &[Op],
    src: IsTypeSrc,
    type_op: IsTypeOp,
) -> StepFlags {
    if type_op == IsTypeOp::Scalar {
        return bail(env, window);
    }

    let val = match &src {
        IsTypeSrc::Local(l) => {
            if env.state.loc_could_be_ref(*l) {
                return bail(env, window);
            }
            env.state.loc_raw(*l)
        }
        IsTypeSrc::StackTop(_) => env.state.top_ty(0),
    };
    let test = type_of_istype(type_op);
    if !val.subtype_of(&TCELL) || val.subtype_of(&test) || !val.could_be(&test) {
        return bail(env, window);
    }

    let jmp = jmp_info(window);
    let mut flags = StepFlags::default();

    let loc = match src {
        IsTypeSrc::Local(l) => {
            if !env.state.loc_could_be_uninit(l) {
                flags.nothrow();
            }
            Loc::Local(l)
        }
        IsTypeSrc::StackTop(loc) => {
            flags.nothrow();
            env.state.popt();
            match loc {
                Loc::Stack(d) => Loc::Stack(d - 1),
                other => other,
            }
        }
    };

    let was_true = |t: &Ty| -> Ty {
        if test.subtype_of(&TNULL) {
            return if t.could_be(&TUNINIT) {
                if t.could_be(&TINITNULL) { TNULL } else { TUNINIT }
            } else {
                TINITNULL
            };
        }
        if is_opt(t) {
            let inner = unopt(t);
            if inner.subtype_of(&test) {
                return inner;
            }
        }
        test.clone()
    };
    let was_false = |t: &Ty| -> Ty {
        if test.subtype_of(&TNULL) {
            let t = remove_uninit(t);
            return if is_opt(&t) { unopt(&t) } else { t };
        }
        if is_opt(t) && unopt(t).subtype_of(&test) {
            return TINITNULL;
        }
        t.clone()
    };

    if jmp.taken_on_true {
        refine_location(env, loc, &was_true, jmp.target, &was_false);
    } else {
        refine_location(env, loc, &was_false, jmp.target, &was_true);
    }
    flags
}

fn group_is_uninit(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    let jmp = jmp_info(window);
    let val = env.state.popcu();
    let fail = remove_uninit(&val);
    type_test_propagate(env, val, TUNINIT, fail, jmp)
}

/// Propagates `test` to the edge where the test succeeded and `fail` to
/// the other, with dead-edge elimination when statically decided. The
/// tested value (already popped by the caller) is re-pushed with the
/// appropriate refinement on each edge.
fn type_test_propagate(
    env: &mut Env<'_>,
    val: Ty,
    test: Ty,
    fail: Ty,
    jmp: JmpInfo,
) -> StepFlags {
    let mut flags = StepFlags::default();
    flags.nothrow();

    if val.subtype_of(&test) || fail.is_bottom() {
        env.state.push(val);
        if jmp.taken_on_true {
            flags.jmp_dest = Some(jmp.target);
            (env.propagate)(jmp.target, env.state);
        } else {
            flags.jmp_dest = env.blk.fallthrough;
        }
        return flags;
    }

    if !val.could_be(&test) {
        env.state.push(fail);
        if jmp.taken_on_true {
            flags.jmp_dest = env.blk.fallthrough;
        } else {
            flags.jmp_dest = Some(jmp.target);
            (env.propagate)(jmp.target, env.state);
        }
        return flags;
    }

    env.state.push(if jmp.taken_on_true { test.clone() } else { fail.clone() });
    (env.propagate)(jmp.target, env.state);
    env.state.discard(1);
    env.state.push(if jmp.taken_on_true { fail } else { test });
    flags
}

// --- instanceof group -----------------------------------------------------

fn group_instance_of_d(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    let name = match &window[0] {
        Op::InstanceOfD(name) => Arc::clone(name),
        _ => unreachable!(),
    };

    let Some(loc) = top_loc(env, 0) else {
        return bail(env, window);
    };
    let Some(rcls) = env.index.resolve_class(&name) else {
        return bail(env, window);
    };
    let spec = ClsSpec { cls: rcls.id, exact: rcls.exact };

    let val = loc_ty(env, loc);
    if instanceof_decided(env, &val, spec).is_some() {
        return bail(env, window);
    }

    // when the non-null part always passes, a failed test implies null
    let fail_implies_null =
        is_opt(&val) && instanceof_decided(env, &unopt(&val), spec) == Some(true);

    let jmp = jmp_info(window);
    let mut flags = StepFlags::default();
    flags.nothrow();

    env.state.popc();
    let loc = match loc {
        Loc::Stack(d) => Loc::Stack(d - 1),
        other => other,
    };

    let inst_ty = obj_of(spec);
    let result = |t: &Ty, pass: bool| -> Ty {
        if pass {
            inst_ty.clone()
        } else if fail_implies_null {
            if t.could_be(&TUNINIT) { TNULL } else { TINITNULL }
        } else {
            t.clone()
        }
    };
    let pre = |t: &Ty| result(t, jmp.taken_on_true);
    let post = |t: &Ty| result(t, !jmp.taken_on_true);
    refine_location(env, loc, &pre, jmp.target, &post);
    flags
}

// --- identity-compare groups ----------------------------------------------

fn group_same(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    same_branch(env, window, false)
}

fn group_nsame(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    same_branch(env, window, true)
}

fn same_branch(env: &mut Env<'_>, window: &[Op], nsame: bool) -> StepFlags {
    if resolve_same(env, nsame) != TBOOL {
        return bail(env, window);
    }

    let loc0 = env.state.top_local(0);
    let loc1 = env.state.top_local(1);
    if loc0.is_none() && loc1.is_none() {
        return bail(env, window);
    }

    let ty0 = env.state.top_ty(0);
    let ty1 = env.state.top_ty(1);
    let val0 = ty0.as_const();
    let val1 = ty1.as_const();

    if (val0.is_some() && val1.is_some())
        || (loc0.is_none() && val0.is_none() && ty1.subtype_of(&ty0))
        || (loc1.is_none() && val1.is_none() && ty0.subtype_of(&ty1))
    {
        return bail(env, window);
    }

    let jmp = jmp_info(window);
    let isect = intersection_of(&ty0, &ty1);
    env.state.discard(2);

    let mut flags = StepFlags::default();
    flags.nothrow();

    let handle_same = |env: &mut Env<'_>| {
        // identity lets the locals share a ring: exact for objects, and
        // safe for values that cannot hide a destructor
        if let (Some(l0), Some(l1)) = (loc0, loc1) {
            let obj_like = |t: &Ty| t.subtype_of(&TOPTOBJ);
            let allowed = obj_like(&ty0)
                || obj_like(&ty1)
                || (!could_run_destructor(&ty0) && !could_run_destructor(&ty1));
            if allowed && l0 != l1 && !env.state.locs_are_equiv(l0, l1) {
                let mut cur = l0;
                loop {
                    match env.state.find_loc_equiv(cur) {
                        Some(next) => {
                            env.state.kill_loc_equiv(cur);
                            env.state.add_loc_equiv(cur, l1);
                            cur = next;
                        }
                        None => break,
                    }
                }
                if cur != l1 && !env.state.locs_are_equiv(cur, l1) {
                    env.state.add_loc_equiv(cur, l1);
                }
            }
        }

        let target = loc1.or(loc0).expect("a location was required above");
        let isect = isect.clone();
        refine_loc(env.state, Loc::Local(target), &move |t: &Ty| {
            if !t.could_be(&TUNINIT) || !isect.could_be(&TINITNULL) {
                return intersection_of(t, &isect);
            }
            if isect.subtype_of(&TINITNULL) {
                return if t.could_be(&TINITNULL) { TNULL } else { TUNINIT };
            }
            t.clone()
        });
    };

    let handle_differ_side = |env: &mut Env<'_>, l: LocalId, other: &Ty| {
        if other.subtype_of(&TINITNULL) {
            refine_loc(env.state, Loc::Local(l), &|t: &Ty| {
                let t = remove_uninit(t);
                if is_opt(&t) { unopt(&t) } else { t }
            });
        } else if *other == TFALSE || *other == TTRUE {
            let flipped = if *other == TFALSE { TTRUE } else { TFALSE };
            refine_loc(env.state, Loc::Local(l), &move |t: &Ty| {
                if t.subtype_of(&TBOOL) { flipped.clone() } else { t.clone() }
            });
        }
    };
    let handle_differ = |env: &mut Env<'_>| {
        if let Some(l0) = loc0 {
            handle_differ_side(env, l0, &ty1);
        }
        if let Some(l1) = loc1 {
            handle_differ_side(env, l1, &ty0);
        }
    };

    let same_is_taken = nsame != jmp.taken_on_true;

    let save = env.state.clone();
    if same_is_taken {
        handle_same(env);
    } else {
        handle_differ(env);
    }
    if !env.state.unreachable {
        (env.propagate)(jmp.target, env.state);
    }
    *env.state = save;
    if same_is_taken {
        handle_differ(env);
    } else {
        handle_same(env);
    }
    flags
}

// --- static-local existence group -----------------------------------------

fn group_static_loc_check(env: &mut Env<'_>, window: &[Op]) -> StepFlags {
    let l = match &window[0] {
        Op::StaticLocCheck(l, _) => *l,
        _ => unreachable!(),
    };
    let jmp = jmp_info(window);
    let flags = StepFlags::default();

    let save = env.state.clone();
    // the check binds the local to its static cell
    env.state.set_loc(l, TINITCELL);
    env.state.set_loc_ref(l, true);

    if jmp.taken_on_true {
        // bound and initialized on the taken edge; untouched otherwise
        (env.propagate)(jmp.target, env.state);
        *env.state = save;
    } else {
        (env.propagate)(jmp.target, &save);
    }
    flags
}

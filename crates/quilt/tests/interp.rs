use slotmap::SlotMap;

use quilt::bc::{Block, BlockId, FuncMeta, IsTypeOp, IterId, LocalId, ObjMethodOp, Op};
use quilt::index::{Index, TestIndex, UnknownIndex};
use quilt::interp::state::{Iter, State};
use quilt::interp::{run, BlockExit, Interp, RunFlags};
use quilt::ty::{self, aval, ival, sval, union_of, TARRKEY, TINITNULL, TINT, TOBJ, TSTR};
use quilt::value::Val;

fn block_ids(n: usize) -> Vec<BlockId> {
    let mut ids: SlotMap<BlockId, ()> = SlotMap::with_key();
    (0..n).map(|_| ids.insert(())).collect()
}

fn func(num_locals: u32, num_iters: u32) -> FuncMeta {
    FuncMeta {
        num_locals,
        num_iters,
        num_cls_ref_slots: 1,
        cls: None,
    }
}

fn run_block(
    index: &dyn Index,
    func: &FuncMeta,
    blk: &Block,
    state: State,
) -> (RunFlags, Vec<(BlockId, State)>) {
    let mut interp = Interp { index, func, blk, state };
    let mut props = Vec::new();
    let flags = run(&mut interp, &mut |target, state: &State| {
        props.push((target, state.clone()))
    });
    (flags, props)
}

fn find<'p>(props: &'p [(BlockId, State)], target: BlockId) -> &'p State {
    &props
        .iter()
        .find(|(b, _)| *b == target)
        .unwrap_or_else(|| panic!("no propagation to {target:?}"))
        .1
}

#[test]
fn constant_folding_add() {
    let ids = block_ids(1);
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![Op::Int(2), Op::Int(3), Op::Add],
        fallthrough: Some(ids[0]),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::FellThrough);
    assert!(!flags.was_pei);
    assert!(flags.effect_free);
    assert!(flags.can_const_prop);
    assert_eq!(find(&props, ids[0]).top_ty(0), ival(5));
}

#[test]
fn division_by_zero_does_not_fold() {
    let ids = block_ids(1);
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![Op::Int(1), Op::Int(0), Op::Div],
        fallthrough: Some(ids[0]),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::FellThrough);
    assert!(flags.was_pei);
    assert!(!flags.effect_free);
    let out = find(&props, ids[0]);
    assert_eq!(out.top_ty(0).as_const(), None);
}

#[test]
fn pop_of_object_is_not_effect_free() {
    let ids = block_ids(1);
    let meta = func(1, 0);
    let l = LocalId(0);

    let mut state = State::entry(&meta);
    state.set_loc(l, TOBJ);
    let blk = Block {
        instrs: vec![Op::CGetL(l), Op::PopC],
        fallthrough: Some(ids[0]),
        throw_exits: Vec::new(),
    };
    let (flags, _) = run_block(&UnknownIndex, &meta, &blk, state);
    assert!(!flags.effect_free);

    let blk = Block {
        instrs: vec![Op::Int(1), Op::PopC],
        fallthrough: Some(ids[0]),
        throw_exits: Vec::new(),
    };
    let (flags, _) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert!(flags.effect_free);
    assert!(!flags.was_pei);
}

#[test]
fn type_test_branch_refines_both_edges() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(1, 0);
    let l = LocalId(0);

    // nullable int: the test decides between the two halves
    let mut state = State::entry(&meta);
    state.set_loc(l, union_of(&TINT, &TINITNULL));
    let blk = Block {
        instrs: vec![Op::IsTypeL(l, IsTypeOp::Int), Op::JmpNZ(taken)],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, state);
    assert_eq!(flags.exit, BlockExit::FellThrough);
    assert_eq!(find(&props, taken).loc_raw(l), TINT);
    assert_eq!(find(&props, ft).loc_raw(l), TINITNULL);
}

#[test]
fn type_test_branch_defaults_to_unrefined_fallthrough() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(1, 0);
    let l = LocalId(0);

    let mut state = State::entry(&meta);
    state.set_loc(l, TARRKEY);
    let blk = Block {
        instrs: vec![Op::IsTypeL(l, IsTypeOp::Int), Op::JmpNZ(taken)],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (_, props) = run_block(&UnknownIndex, &meta, &blk, state);
    // taken: narrowed to the tested type; fallthrough: int cannot be
    // excluded from an int|str without more information
    assert_eq!(find(&props, taken).loc_raw(l), TINT);
    assert_eq!(find(&props, ft).loc_raw(l), TARRKEY);
}

#[test]
fn statically_decided_test_kills_the_dead_edge() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(1, 0);
    let l = LocalId(0);

    let mut state = State::entry(&meta);
    state.set_loc(l, ival(5));
    let blk = Block {
        instrs: vec![Op::IsTypeL(l, IsTypeOp::Int), Op::JmpNZ(taken)],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, state);
    assert_eq!(flags.exit, BlockExit::Branched(taken));
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].0, taken);
}

#[test]
fn refinement_never_invents_information() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let l = LocalId(0);

    let val_tys = [
        TINT,
        TSTR,
        TARRKEY,
        union_of(&TINT, &TINITNULL),
        union_of(&TOBJ, &TINITNULL),
        ty::TINITCELL,
        ty::TBOOL,
        ival(0),
        sval("x"),
    ];
    let tests = [
        IsTypeOp::Null,
        IsTypeOp::Bool,
        IsTypeOp::Int,
        IsTypeOp::Dbl,
        IsTypeOp::Str,
        IsTypeOp::Arr,
        IsTypeOp::Obj,
    ];

    for val_ty in &val_tys {
        for test in tests {
            let meta = func(1, 0);
            let mut state = State::entry(&meta);
            state.set_loc(l, val_ty.clone());
            let blk = Block {
                instrs: vec![Op::IsTypeL(l, test), Op::JmpNZ(taken)],
                fallthrough: Some(ft),
                throw_exits: Vec::new(),
            };
            let (_, props) = run_block(&UnknownIndex, &meta, &blk, state);

            let taken_state = props.iter().find(|(b, _)| *b == taken);
            let ft_state = props.iter().find(|(b, _)| *b == ft);
            if let (Some((_, t)), Some((_, f))) = (taken_state, ft_state) {
                let joined = union_of(&t.loc_raw(l), &f.loc_raw(l));
                assert!(
                    val_ty.subtype_of(&joined),
                    "{val_ty} refined under {test:?} lost values: {joined}",
                );
            }
        }
    }
}

#[test]
fn identity_compare_group_narrows_to_the_constant() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(2, 0);
    let (l0, l1) = (LocalId(0), LocalId(1));

    let mut state = State::entry(&meta);
    state.set_loc(l0, union_of(&ival(5), &TINITNULL));
    state.set_loc(l1, ival(5));
    let blk = Block {
        instrs: vec![Op::CGetL(l0), Op::CGetL(l1), Op::Same, Op::JmpNZ(taken)],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, state);
    assert_eq!(flags.exit, BlockExit::FellThrough);
    assert_eq!(find(&props, taken).loc_raw(l0), ival(5));
    assert_eq!(
        find(&props, ft).loc_raw(l0),
        union_of(&ival(5), &TINITNULL),
    );
}

#[test]
fn same_against_null_removes_null_on_the_differ_edge() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(1, 0);
    let l = LocalId(0);

    let mut state = State::entry(&meta);
    state.set_loc(l, union_of(&TSTR, &TINITNULL));
    let blk = Block {
        instrs: vec![Op::CGetL(l), Op::Null, Op::Same, Op::JmpNZ(taken)],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (_, props) = run_block(&UnknownIndex, &meta, &blk, state);
    // taken: the local is null there; fallthrough: null is ruled out
    assert_eq!(find(&props, taken).loc_raw(l), TINITNULL);
    assert_eq!(find(&props, ft).loc_raw(l), TSTR);
}

#[test]
fn iterator_over_literal_array() {
    let ids = block_ids(2);
    let (done, ft) = (ids[0], ids[1]);
    let meta = func(1, 1);
    let l = LocalId(0);
    let iter = IterId(0);

    let lit = Val::List(vec![Val::Int(1), Val::Int(2)].into());
    let blk = Block {
        instrs: vec![
            Op::Arr(lit),
            Op::IterInit { iter, target: done, val: l },
        ],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    // a non-empty literal never takes the done edge
    assert_eq!(flags.exit, BlockExit::FellThrough);
    assert_eq!(props.len(), 1);
    let out = find(&props, ft);
    assert!(out.loc_raw(l).subtype_of(&TINT));
    assert!(matches!(out.iter(iter), Iter::Tracked(_)));
    assert!(!flags.was_pei);
}

#[test]
fn iterator_over_empty_literal_takes_the_exit_edge() {
    let ids = block_ids(2);
    let (done, ft) = (ids[0], ids[1]);
    let meta = func(1, 1);

    let blk = Block {
        instrs: vec![
            Op::Arr(Val::List(Vec::new().into())),
            Op::IterInit { iter: IterId(0), target: done, val: LocalId(0) },
        ],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Branched(done));
    assert_eq!(props.len(), 1);
    assert!(matches!(find(&props, done).iter(IterId(0)), Iter::Dead));
}

#[test]
fn call_returns_the_indexed_type_and_balances() {
    let mut index = TestIndex::new();
    index.add_func("f", TINT);

    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![
            Op::FPushFuncD(2, "f".into()),
            Op::Int(1),
            Op::Int(2),
            Op::FCall(2),
            Op::RetC,
        ],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, _) = run_block(&index, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Returned(TINT));

    // every call-push is consumed by its invoke
    let ids = block_ids(1);
    let blk = Block {
        instrs: vec![Op::FPushFuncD(0, "f".into()), Op::FCall(0)],
        fallthrough: Some(ids[0]),
        throw_exits: Vec::new(),
    };
    let (_, props) = run_block(&index, &meta, &blk, State::entry(&meta));
    let out = find(&props, ids[0]);
    assert_eq!(out.fpi_depth(), 0);
    assert_eq!(out.top_ty(0), TINT);
}

#[test]
fn foldable_call_strength_reduces_to_a_constant() {
    let mut index = TestIndex::new();
    index.add_foldable_func("length", TINT, |args| match args {
        [Val::Str(s)] => Some(Val::Int(s.len() as i64)),
        _ => None,
    });

    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![
            Op::FPushFuncD(1, "length".into()),
            Op::Str("abc".into()),
            Op::FCall(1),
            Op::RetC,
        ],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, _) = run_block(&index, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Returned(ival(3)));
    let rewritten = flags.rewritten.expect("the call should strength-reduce");
    assert!(rewritten.contains(&Op::Int(3)));
}

#[test]
fn push_of_a_constant_local_reduces_to_the_literal() {
    let meta = func(1, 0);
    let l = LocalId(0);
    let mut state = State::entry(&meta);
    state.set_loc(l, ival(7));

    let blk = Block {
        instrs: vec![Op::PushL(l), Op::RetC],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, _) = run_block(&UnknownIndex, &meta, &blk, state);
    assert_eq!(flags.exit, BlockExit::Returned(ival(7)));
    let rewritten = flags.rewritten.expect("PushL of a constant should reduce");
    assert_eq!(rewritten[..2], [Op::Int(7), Op::UnsetL(l)]);
}

#[test]
fn two_operand_concat_n_reduces_to_concat() {
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![Op::Str("a".into()), Op::Str("b".into()), Op::ConcatN(2), Op::RetC],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, _) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Returned(sval("ab")));
    assert!(flags.rewritten.unwrap().contains(&Op::Concat));
}

#[test]
fn no_op_cast_reduces_away() {
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![Op::Int(5), Op::CastInt, Op::RetC],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, _) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Returned(ival(5)));
    let rewritten = flags.rewritten.unwrap();
    assert_eq!(rewritten, vec![Op::Int(5), Op::Nop, Op::RetC]);
}

#[test]
fn switch_on_a_constant_branches_directly() {
    let ids = block_ids(3);
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![Op::Int(1), Op::Switch(ids.clone().into())],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Branched(ids[1]));
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].0, ids[1]);
}

#[test]
fn method_push_on_a_non_object_is_unreachable() {
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![
            Op::Int(1),
            Op::FPushObjMethodD(0, "m".into(), ObjMethodOp::NullThrows),
            Op::FCall(0),
        ],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert_eq!(flags.exit, BlockExit::Unreachable);
    assert!(props.is_empty());
}

#[test]
fn pei_propagates_the_truncated_state_to_throw_exits() {
    let ids = block_ids(2);
    let (exit, ft) = (ids[0], ids[1]);
    let meta = func(1, 0);
    let l = LocalId(0);

    // reading a possibly-uninit local can raise
    let blk = Block {
        instrs: vec![Op::CGetL(l)],
        fallthrough: Some(ft),
        throw_exits: vec![exit],
    };

    let (flags, props) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    assert!(flags.was_pei);
    let exn = find(&props, exit);
    assert_eq!(exn.stack_depth(), 0);
    assert_eq!(find(&props, ft).stack_depth(), 1);
}

#[test]
fn instanceof_group_refines_with_the_class_hierarchy() {
    let mut index = TestIndex::new();
    let base = index.add_class("Base", None);
    let _derived = index.add_class("Derived", Some(base));

    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(1, 0);
    let l = LocalId(0);

    let mut state = State::entry(&meta);
    state.set_loc(l, union_of(&ty::obj_sub(base), &TINITNULL));
    let blk = Block {
        instrs: vec![Op::CGetL(l), Op::InstanceOfD("Base".into()), Op::JmpNZ(taken)],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (_, props) = run_block(&index, &meta, &blk, state);
    // the non-null part always passes, so failing the test implies null
    assert!(find(&props, taken).loc_raw(l).subtype_of(&TOBJ));
    assert_eq!(find(&props, ft).loc_raw(l), TINITNULL);
}

#[test]
fn interpretation_is_deterministic() {
    let ids = block_ids(2);
    let (taken, ft) = (ids[0], ids[1]);
    let meta = func(2, 0);

    let mut state = State::entry(&meta);
    state.set_loc(LocalId(0), union_of(&TINT, &TINITNULL));
    state.set_loc(LocalId(1), TARRKEY);

    let blk = Block {
        instrs: vec![
            Op::CGetL(LocalId(0)),
            Op::IsTypeC(IsTypeOp::Null),
            Op::JmpNZ(taken),
            Op::Int(40),
            Op::Int(2),
            Op::Add,
            Op::PopC,
        ],
        fallthrough: Some(ft),
        throw_exits: Vec::new(),
    };

    let (flags_a, props_a) = run_block(&UnknownIndex, &meta, &blk, state.clone());
    let (flags_b, props_b) = run_block(&UnknownIndex, &meta, &blk, state);
    assert_eq!(flags_a.exit, flags_b.exit);
    assert_eq!(flags_a.was_pei, flags_b.was_pei);
    assert_eq!(flags_a.effect_free, flags_b.effect_free);
    assert_eq!(props_a, props_b);
}

#[test]
fn literal_array_construction_folds() {
    let meta = func(0, 0);
    let blk = Block {
        instrs: vec![Op::Int(1), Op::Int(2), Op::NewList(2), Op::RetC],
        fallthrough: None,
        throw_exits: Vec::new(),
    };

    let (flags, _) = run_block(&UnknownIndex, &meta, &blk, State::entry(&meta));
    let expected = aval(Val::List(vec![Val::Int(1), Val::Int(2)].into()));
    assert_eq!(flags.exit, BlockExit::Returned(expected));
    assert!(flags.effect_free);
}

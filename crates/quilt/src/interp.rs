mod groups;
mod ops;
pub mod state;

use log::{debug, trace};

use crate::bc::{Block, BlockId, FuncMeta, Op};
use crate::index::Index;
use crate::ty::{from_val, Ty};

use self::state::State;

/// Per-instruction facts, produced by one transfer function (or one
/// matched group). Defaults are the pessimistic classification; handlers
/// assert the stronger facts they can prove.
#[derive(Debug, Clone)]
pub struct StepFlags {
    /// The instruction may raise; drives propagation to exceptional
    /// successors.
    pub was_pei: bool,
    /// No externally observable effect beyond the stack/local result.
    pub effect_free: bool,
    /// A constant-propagation pass could replace this instruction with its
    /// literal outputs.
    pub can_const_prop: bool,
    /// Where control goes next, when the instruction jumped (or was proven
    /// to fall through: the block's own fallthrough).
    pub jmp_dest: Option<BlockId>,
    /// Set by the return family: the returned type.
    pub returned: Option<Ty>,
    /// A cheaper, semantically equivalent replacement sequence.
    pub reduced: Option<Vec<Op>>,
}

impl Default for StepFlags {
    fn default() -> Self {
        Self {
            was_pei: true,
            effect_free: false,
            can_const_prop: false,
            jmp_dest: None,
            returned: None,
            reduced: None,
        }
    }
}

impl StepFlags {
    pub fn nothrow(&mut self) {
        self.was_pei = false;
    }

    pub fn effect_free(&mut self) {
        self.was_pei = false;
        self.effect_free = true;
    }

    pub fn constprop(&mut self) {
        self.can_const_prop = true;
    }
}

/// How interpretation of the block ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockExit {
    /// Ran off the end; the final state went to the fallthrough successor,
    /// if the block has one.
    FellThrough,
    /// An instruction jumped somewhere other than the fallthrough.
    Branched(BlockId),
    Returned(Ty),
    /// The state collapsed; the rest of the block cannot execute.
    Unreachable,
}

/// Block-level summary: the exit kind plus effect facts folded over every
/// interpreted instruction.
#[derive(Debug, Clone)]
pub struct RunFlags {
    pub exit: BlockExit,
    pub was_pei: bool,
    pub effect_free: bool,
    pub can_const_prop: bool,
    /// Present when some instruction strength-reduced: the replacement
    /// instruction list for the interpreted prefix of the block.
    pub rewritten: Option<Vec<Op>>,
}

/// One block interpretation in progress: the inputs (index, function
/// metadata, block) and the evolving abstract state.
pub struct Interp<'a> {
    pub index: &'a dyn Index,
    pub func: &'a FuncMeta,
    pub blk: &'a Block,
    pub state: State,
}

pub(crate) struct Env<'e> {
    pub index: &'e dyn Index,
    pub func: &'e FuncMeta,
    pub blk: &'e Block,
    pub state: &'e mut State,
    pub propagate: &'e mut dyn FnMut(BlockId, &State),
}

/// Interprets the block against its current state, invoking `propagate`
/// once per reachable successor edge (including exceptional edges).
pub fn run(interp: &mut Interp<'_>, propagate: &mut dyn FnMut(BlockId, &State)) -> RunFlags {
    let mut ret = RunFlags {
        exit: BlockExit::FellThrough,
        was_pei: false,
        effect_free: true,
        can_const_prop: true,
        rewritten: None,
    };

    let instrs = &interp.blk.instrs;
    let mut rewritten: Vec<Op> = Vec::new();
    let mut any_reduced = false;
    let mut idx = 0;

    while idx < instrs.len() {
        let start = idx;
        let flags = interp_ops(interp, &mut idx, propagate);

        match &flags.reduced {
            Some(seq) => {
                any_reduced = true;
                rewritten.extend(seq.iter().cloned());
            }
            None => rewritten.extend(instrs[start..idx].iter().cloned()),
        }

        ret.was_pei |= flags.was_pei;
        ret.effect_free &= flags.effect_free;
        ret.can_const_prop &= flags.can_const_prop;

        if interp.state.unreachable {
            trace!("  <fallthrough is unreachable>");
            ret.exit = BlockExit::Unreachable;
            ret.rewritten = any_reduced.then_some(rewritten);
            return ret;
        }

        if let Some(dest) = flags.jmp_dest {
            if Some(dest) != interp.blk.fallthrough {
                trace!("  <took branch; no fallthrough>");
                ret.exit = BlockExit::Branched(dest);
                ret.rewritten = any_reduced.then_some(rewritten);
                return ret;
            }
        }

        if let Some(ty) = flags.returned {
            trace!("  returned {ty}");
            assert_eq!(idx, instrs.len(), "return mid-block");
            assert!(interp.blk.fallthrough.is_none(), "return in a block with a fallthrough");
            ret.exit = BlockExit::Returned(ty);
            ret.rewritten = any_reduced.then_some(rewritten);
            return ret;
        }
    }

    trace!("  <end block>");
    if let Some(fallthrough) = interp.blk.fallthrough {
        propagate(fallthrough, &interp.state);
    }
    ret.rewritten = any_reduced.then_some(rewritten);
    debug!(
        "block done: {:?} pei={} effect_free={}",
        ret.exit, ret.was_pei, ret.effect_free,
    );
    ret
}

/// Interprets a single instruction with no successor propagation. Used by
/// callers that only want the instruction's own flags.
pub fn step(interp: &mut Interp<'_>, op: &Op) -> StepFlags {
    let mut noop = |_: BlockId, _: &State| {};
    let mut env = Env {
        index: interp.index,
        func: interp.func,
        blk: interp.blk,
        state: &mut interp.state,
        propagate: &mut noop,
    };
    ops::dispatch(&mut env, op)
}

/// Dispatches the next instruction or matched group, then applies the
/// block-level constant-output pass and exceptional-edge propagation.
fn interp_ops(
    interp: &mut Interp<'_>,
    idx: &mut usize,
    propagate: &mut dyn FnMut(BlockId, &State),
) -> StepFlags {
    let instrs = &interp.blk.instrs;

    // exceptional successors see the pre-instruction state (with stacks
    // truncated: a raise can happen before any push lands)
    let state_before = (!interp.blk.throw_exits.is_empty())
        .then(|| interp.state.without_stacks());

    let num_pushed = instrs[*idx].num_push();

    let mut env = Env {
        index: interp.index,
        func: interp.func,
        blk: interp.blk,
        state: &mut interp.state,
        propagate: &mut *propagate,
    };

    let window_end = (*idx + 3).min(instrs.len());
    let mut flags = match groups::try_group(&mut env, &instrs[*idx..window_end]) {
        Some((consumed, flags)) => {
            *idx += consumed;
            flags
        }
        None => {
            trace!("  {}", instrs[*idx]);
            let flags = ops::dispatch(&mut env, &instrs[*idx]);
            *idx += 1;
            flags
        }
    };

    if flags.can_const_prop && fix_const_outputs(&mut interp.state, num_pushed) {
        if flags.was_pei {
            trace!("   nothrow (due to constprop)");
            flags.was_pei = false;
        }
        if !flags.effect_free {
            trace!("   effect_free (due to constprop)");
            flags.effect_free = true;
        }
    }

    assert!(!flags.effect_free || !flags.was_pei);

    if flags.was_pei {
        trace!("   PEI");
        if let Some(state_before) = &state_before {
            for &exit in &interp.blk.throw_exits {
                propagate(exit, state_before);
            }
        }
    }

    flags
}

/// After a constant-propagatable step, verify every pushed value is a
/// literal; if so canonicalize the pushed types. A constant result cannot
/// have had an effect its handler didn't already account for.
fn fix_const_outputs(state: &mut State, num_pushed: usize) -> bool {
    if num_pushed == 0 || state.unreachable || state.stack_depth() < num_pushed {
        return false;
    }

    let mut vals = Vec::with_capacity(num_pushed);
    for depth in 0..num_pushed {
        match state.top_ty(depth).as_const() {
            Some(v) => vals.push(v),
            None => return false,
        }
    }

    for (depth, v) in vals.into_iter().enumerate() {
        state.set_top_ty(depth, from_val(&v));
    }
    true
}

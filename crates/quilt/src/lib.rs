//! quilt is the abstract-interpretation core of a whole-program bytecode
//! optimizer. Given one basic block and an incoming abstract state, it
//! computes sound per-instruction type and effect facts (may-throw,
//! effect-free, constant-foldable), refines types across conditional
//! branches, and reports successor states through a propagation callback.
//! The surrounding fixpoint driver, the bytecode producer, and the
//! program-wide symbol index are external; the index is consumed through
//! the read-only [`index::Index`] trait.

pub mod bc;
pub mod index;
pub mod interp;
pub mod ty;
pub mod util;
pub mod value;

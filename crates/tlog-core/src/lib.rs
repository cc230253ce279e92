//! # tlog-core
//!
//! State-based CRDT building blocks for the derived views of a Tamperlog
//! ledger. The block DAG itself is grow-only; everything computed from it
//! (certified identities, witness sets) is expressed as a join-semilattice
//! so that folding blocks in any order yields the same state.

pub mod gset;
pub mod lattice;
pub mod two_phase_set;

pub use gset::GSet;
pub use lattice::Lattice;
pub use two_phase_set::TwoPhaseSet;

//! States that merge by least upper bound.
//!
//! `join` must be commutative, associative and idempotent, with `bottom()`
//! as its identity. `tests/properties.rs` checks this for every set here.

/// A join-semilattice.
pub trait Lattice: Clone + PartialEq {
    fn bottom() -> Self;

    /// Least upper bound of `self` and `other`.
    fn join(&self, other: &Self) -> Self;

    /// Merge `other` into `self` in place.
    fn join_assign(&mut self, other: &Self) {
        *self = self.join(other);
    }
}

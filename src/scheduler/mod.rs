//! Work-stealing scheduler internals.
//!
//! Each worker owns a bounded [`ring`] queue; tasks submitted from outside
//! the pool, spilled from full rings, or promoted from the delay heap flow
//! through the [`injector`]. The [`worker`] loop pops locally, steals via
//! [`stealing`], drains the injector, and parks when the pool is quiet.

pub(crate) mod injector;
pub(crate) mod ring;
pub(crate) mod stealing;
pub(crate) mod timer;
pub(crate) mod worker;

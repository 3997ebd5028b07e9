//! Ancestry and suspendability registry.
//!
//! Tracks, per code unit, its parent and the set of routines known to
//! suspend. Suspendability is resolved transitively up the inheritance
//! chain; units outside the working set are fetched through an injected
//! [`AncestryResolver`] and cached. Resolution failures always degrade to
//! a conservative default — they never abort a batch.

mod database;
mod resolver;

pub use database::{Options, UnitDatabase};
pub use resolver::{AncestryResolver, MapResolver, NoResolver, UnitRecord};

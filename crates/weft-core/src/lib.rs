//! weft-core: a replicated causal tree with an entity/tag document on top.
//!
//! Layers, leaf to root:
//!
//! - [`atom`]: atom ids and the per-site Lamport clock.
//! - [`weave`]: the deterministic ordering of all atoms.
//! - [`tree`]: the generic replica (weave + clock + reducer + memo).
//! - [`model`]: the domain ops, reducer, text sequences, garbage collection
//!   and the editing façade.
//!
//! # Conventions
//!
//! - **Errors**: expected negatives are `Option`/empty results; boundary
//!   failures are [`TreeError`] with a stable [`ErrorCode`]. Config loading
//!   uses `anyhow::Result`.
//! - **Logging**: `tracing` macros only; the binary installs the subscriber.

pub mod atom;
pub mod config;
pub mod error;
pub mod model;
pub mod tree;
pub mod weave;

pub use atom::{Atom, AtomFactory, AtomId, SiteInfo};
pub use config::{TreeOptions, WeftConfig};
pub use error::{ErrorCode, TreeError};
pub use model::{AuxCausalTree, AuxOp, AuxState, EntityEvent, NewEntity};
pub use tree::{CausalTree, Reducer, StoredCausalTree, TreeEvent};
pub use weave::{Weave, WeaveError, WeaveVersion};

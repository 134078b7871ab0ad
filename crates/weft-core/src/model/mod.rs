//! The entity/tag/value document built on the generic causal tree.

pub mod facade;
pub mod gc;
pub mod op;
pub mod reducer;
pub mod sequence;
pub mod state;

pub use facade::{AuxCausalTree, EDIT_PRIORITY, EntityEvent, NewEntity};
pub use op::{AuxOp, OpError, OpKind};
pub use reducer::AuxReducer;
pub use sequence::{SequenceRef, SequenceSpan, calculate_sequence_ref, calculate_sequence_refs};
pub use state::{AuxState, EntityMetadata, EntityState, SequenceMeta, TagMetadata, ValueMetadata};

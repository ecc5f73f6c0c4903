//! Slice derivation (FULL and INCREMENTAL)

pub mod changeset;
pub mod engine;

pub use changeset::ChangeSet;
pub use engine::{
    SliceExecutor, SlicingEngine, SlicingMode, SlicingResult, UpstreamChange, EMPTY_RULE_REASON,
};

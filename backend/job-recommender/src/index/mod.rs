//! In-memory similarity index over job embeddings

pub mod flat;
pub mod job_index;
pub mod persistence;
pub mod position_map;

pub use flat::FlatIpIndex;
pub use job_index::{JobIndex, SharedJobIndex};
pub use persistence::{
    append_if_changed, bootstrap_index, build_from_store, BootstrapOptions, IndexLoad,
    IndexPersistence,
};
pub use position_map::PositionMap;

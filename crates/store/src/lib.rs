pub mod contract;
pub mod memory;
pub mod pipeline;

pub use contract::{AssignmentStore, EventStore, ExperimentStore};
pub use memory::MemoryStore;
pub use pipeline::{EventPipeline, Ingestor};

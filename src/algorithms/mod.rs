//! Core algorithms of the temporal memory library.
//!
//! - **Connections**: the synaptic connectivity graph
//! - **Temporal Memory**: sequence learning over the graph

mod connections;
mod temporal_memory;

pub use connections::{
    CellData, Connections, ConnectionsEventHandler, ConnectionsParams, SegmentData, SynapseData,
};
pub use temporal_memory::{TemporalMemory, TemporalMemoryParams};

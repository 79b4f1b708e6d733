//! # Veles - Temporal memory core for HTM
//!
//! Veles is an idiomatic Rust implementation of the core of Hierarchical
//! Temporal Memory (HTM) sequence learning, ported from the htm.core C++
//! library:
//!
//! - **Connections**: a mutable bipartite graph recording distal dendritic
//!   connectivity between cells, with capacity-bounded eviction, change
//!   notifications, and durable serialization across versioned formats
//! - **Temporal Memory**: the per-timestep learning algorithm that drives the
//!   graph, producing active, winner, and predictive cells
//!
//! ## Quick Start
//!
//! ```rust
//! use veles::prelude::*;
//!
//! let mut tm = TemporalMemory::new(TemporalMemoryParams {
//!     column_dimensions: vec![2048],
//!     cells_per_column: 32,
//!     ..Default::default()
//! }).unwrap();
//!
//! // One timestep: activate sorted columns, learn, and predict.
//! tm.compute(&[7, 42, 99, 512], true).unwrap();
//!
//! let active = tm.active_cells();
//! let predicted = tm.predictive_cells();
//! ```
//!
//! Runs are deterministic for a given seed: all tie-breaks draw from a single
//! seeded generator whose state serializes with the rest of the model.
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization support via serde, bincode, and JSON

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_possible_truncation)]

pub mod types;
pub mod algorithms;
pub mod utils;

#[cfg(feature = "serde")]
pub mod serialization;

/// Re-export of commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::algorithms::{
        Connections, ConnectionsEventHandler, ConnectionsParams, TemporalMemory,
        TemporalMemoryParams,
    };
    pub use crate::types::{
        CellIdx, Iteration, Permanence, Real, Real32, Real64, Segment, SegmentIdx, Synapse,
        SynapseIdx, UInt, UInt16, UInt32, UInt64,
    };
    pub use crate::utils::Random;

    #[cfg(feature = "serde")]
    pub use crate::serialization::{Serializable, SerializableFormat};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library.
pub mod error {
    use thiserror::Error;

    /// Main error type for veles operations.
    #[derive(Error, Debug)]
    pub enum VelesError {
        /// A parameter, index, or referenced entity violated a precondition.
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        /// The operation cannot be applied to the current state, e.g. a
        /// serialized stream written by a newer version.
        #[error("Invalid state: {0}")]
        InvalidState(String),

        /// A serialized stream is missing markers or malformed.
        #[error("Format error: {0}")]
        FormatError(String),

        /// I/O failure while reading or writing a stream.
        #[error("I/O error: {message}")]
        IoError {
            /// Description of the I/O error.
            message: String,
        },
    }

    impl From<std::io::Error> for VelesError {
        fn from(err: std::io::Error) -> Self {
            Self::IoError {
                message: err.to_string(),
            }
        }
    }

    /// Result type alias using VelesError.
    pub type Result<T> = std::result::Result<T, VelesError>;
}

pub use error::{Result, VelesError};

//! Primitive type definitions for the temporal memory core.
//!
//! This module provides type aliases that match the semantics of the original C++ implementation
//! while leveraging Rust's type system for safety.

/// 16-bit unsigned integer.
pub type UInt16 = u16;

/// 32-bit unsigned integer.
pub type UInt32 = u32;

/// 64-bit unsigned integer.
pub type UInt64 = u64;

/// 32-bit signed integer.
pub type Int32 = i32;

/// 64-bit signed integer.
pub type Int64 = i64;

/// 32-bit floating point number.
pub type Real32 = f32;

/// 64-bit floating point number.
pub type Real64 = f64;

/// Default unsigned integer type.
pub type UInt = UInt32;

/// Default signed integer type.
pub type Int = Int32;

/// Default floating point type.
pub type Real = Real32;

/// Index type for cells in the connections graph.
pub type CellIdx = UInt32;

/// Position of a segment within its cell's segment list.
pub type SegmentIdx = UInt16;

/// Position of a synapse within its segment's synapse list.
pub type SynapseIdx = UInt16;

/// Unique identifier for a segment in the connections flat list.
pub type Segment = UInt32;

/// Unique identifier for a synapse in the connections flat list.
pub type Synapse = UInt32;

/// Synapse permanence value (0.0 to 1.0).
pub type Permanence = Real32;

/// Iteration counter type.
pub type Iteration = UInt64;

/// Minimum permanence value.
pub const MIN_PERMANENCE: Permanence = 0.0;

/// Maximum permanence value.
pub const MAX_PERMANENCE: Permanence = 1.0;

/// Tolerance applied to all permanence comparisons.
///
/// Threshold tests and minimum-permanence searches must produce the same
/// winners across floating-point environments, so every comparison is made
/// with this slack rather than exactly.
pub const EPSILON: Permanence = 1e-5;

//! Core types for the temporal memory library.
//!
//! This module contains the fundamental type definitions shared by the
//! connections graph and the temporal memory algorithm.

mod primitives;

pub use primitives::*;

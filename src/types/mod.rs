//! Common helper modules shared across the crate.
//!
//! This module remains dependency-light to avoid cyclic build edges.
pub mod fp;

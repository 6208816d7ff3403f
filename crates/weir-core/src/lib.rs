//! # weir-core
//! Foundation types, constants and collaborator traits for the Weir sync engine.

pub mod constants;
pub mod error;
pub mod memory;
pub mod traits;
pub mod types;
pub mod validation;

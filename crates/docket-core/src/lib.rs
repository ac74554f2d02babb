//! # Docket Core
//!
//! Core types and error definitions shared by every Docket crate.
//! This crate provides the document identifier, the clock abstraction used
//! for all scheduling arithmetic, and the unified error type surfaced by the
//! storage, configuration, and job layers.

pub mod clock;
pub mod error;
pub mod id;
pub mod result;

pub use clock::*;
pub use error::*;
pub use id::*;
pub use result::*;

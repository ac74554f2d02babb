//! Result type aliases for Docket.

use crate::DocketError;

/// A specialized `Result` type for Docket operations.
pub type DocketResult<T> = Result<T, DocketError>;

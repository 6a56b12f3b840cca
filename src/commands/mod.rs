//! Operation facade over the analysis worker. Every operation returns a
//! serializable value or an `AppError`.

pub mod diagnostics;
pub mod segments;
pub mod stats;

//! imagemod shared code
//!
//! Error taxonomy and constants used by the image modification engine and
//! its test fixtures.

pub mod constants;
pub mod errors;

pub use errors::{ImageModError, ImageModResult};

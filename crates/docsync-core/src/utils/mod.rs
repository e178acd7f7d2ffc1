//! Small shared helpers.

pub mod locks;

pub use locks::{lock, read, write};

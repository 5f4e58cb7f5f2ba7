//! Common test utilities for the upload client.

pub mod backend;
pub mod wrappers;

#[allow(unused_imports)]
pub use backend::*;
#[allow(unused_imports)]
pub use wrappers::*;

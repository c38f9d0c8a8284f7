//! Request handlers.

mod resources;

pub use resources::*;

//! In-memory persistence for posts.

mod records;

pub use records::*;

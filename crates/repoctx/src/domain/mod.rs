//! Domain types: repository entries, fetched content, and the error taxonomy.

pub mod errors;
pub mod model;

//! Application layer orchestrating domain logic, providers and infrastructure.

pub mod export;
pub mod fetcher;
pub mod gitignore;
pub mod selection;
pub mod session;
pub mod tokens;

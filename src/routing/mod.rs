//! Request routing: which configured mapping serves a path, and which
//! upstream repository it names.
//!
//! Mappings are compiled once at startup so that a bad route pattern or URL
//! template is a startup error, never a per-request one.

pub mod mapping;
pub mod upstream;

pub use mapping::RouteTable;
pub use upstream::{redact_credentials, resolve};

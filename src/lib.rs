//! Real-time collaborative plain-text editing server.
//!
//! Multiple clients open a persistent session against a named document,
//! send insert/delete/replace operations, and observe a stream of other
//! participants' edits, presence, and cursor positions. The server
//! guarantees that all participants converge on the same content even
//! under concurrent, arbitrarily-ordered edits.

pub mod api;
pub mod config;
pub mod document;
pub mod engine;
pub mod hub;
pub mod ot;
pub mod store;
pub mod transport;

pub use config::Configuration;
pub use document::Document;
pub use hub::Hub;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

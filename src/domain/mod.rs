//! Domain models for the attest provider
//!
//! Configuration, image references and verification outcomes.

mod config;
mod outcome;
mod reference;

pub use config::*;
pub use outcome::*;
pub use reference::*;

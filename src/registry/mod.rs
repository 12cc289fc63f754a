//! Connection registry module
//!
//! Tracks live chat connections and the username each one last announced.

mod connections;
mod record;

pub use connections::*;
pub use record::*;

//! CHORDGATE Core - Data Model
//!
//! Types shared by every chordgate crate: cache keys and their derivation,
//! the closed options record, the analysis result model, the collaborator
//! traits for the decoder and the analysis engine, the error taxonomy,
//! configuration and health types. No I/O happens here.

mod analysis;
mod clock;
mod config;
mod error;
mod health;
mod identity;
mod key;
mod options;
mod response;

pub use analysis::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use identity::*;
pub use key::{derive, AudioContent, CacheKey};
pub use options::*;
pub use response::*;

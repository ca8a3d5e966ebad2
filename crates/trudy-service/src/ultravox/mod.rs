//! Ultravox integration.
//!
//! Ultravox hosts the voice agents. This service creates calls, agents,
//! corpora, tools, voices and scheduled batches there, and learns about their
//! progress through signed webhooks (see [`crate::webhooks`]).

pub mod client;
pub mod types;

pub use client::{UltravoxClient, UltravoxError};
pub use types::*;

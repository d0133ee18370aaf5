//! Wire types for the Chrome DevTools Protocol.
//!
//! This crate contains the serde-serializable types exchanged with a Chromium
//! instance over its remote debugging WebSocket. Only the domains the capture
//! pipeline touches are modelled: `Target`, `Page`, `Runtime`, `Emulation`
//! and `Inspector`.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * 1:1 with protocol: Field names follow the CDP JSON schema
//! * Partial: Unknown fields are ignored, optional fields are `Option`
//!
//! Connection handling and request correlation live in `pixelcast-runtime`.

pub mod message;
pub mod types;

pub use message::*;
pub use types::*;

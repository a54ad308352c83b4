//! Core library for the chamber_guard proxy.
//!
//! This library contains the wire codec, device link, wear model, safety
//! policy engine, and the proxy actor that serializes access to a single
//! fragile thermal-chamber instrument. It is used by the `chamber_guard`
//! binary and by external transport bindings.

pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod messages;
pub mod policy;
pub mod proxy;
pub mod wear;

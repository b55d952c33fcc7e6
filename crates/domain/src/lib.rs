//! Shared domain types for the voxgate gateway: the common error type,
//! the typed configuration tree, conversation messages, streaming
//! events, and audio negotiation parameters.

pub mod audio;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;

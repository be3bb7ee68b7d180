//! spool-core: the `Chunk` wire format and shared configuration.
//! Every other Spool crate depends on this one.

pub mod config;
pub mod wire;

pub use config::SpoolConfig;
pub use wire::{Chunk, ChunkType, DecodeError, Method, Status};

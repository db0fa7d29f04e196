//! # liquid_frame
//!
//! A distributed, in-memory store of compressed, chunked columns, and a
//! fork-join map-reduce engine to process them.
//!
//! - [`chunk`]: a `Chunk` is a fixed-length slice of one column, stored in
//!   the narrowest [`codec`] that holds its values exactly. Chunks are built
//!   by appending to a `NewChunk`.
//! - [`column`] and [`frame`]: a `Column` is the metadata of a distributed
//!   column split into chunks along a `Layout`; a `Frame` is a set of named
//!   columns sharing one layout.
//! - [`kv`]: the `KVStore` every chunk, column and frame lives in. Every key
//!   has one home node, computed from the key and the cluster membership.
//! - [`mrtask`]: the `MRTask` trait and the engine that runs tasks on the
//!   nodes owning the data.
//! - [`node`]: a `Node` ties one member's store, network and task engine
//!   together; a `LocalCluster` runs a whole cluster in one process.
//! - [`network`]: the in-process and TCP transports between nodes.
pub mod chunk;
pub mod codec;
pub mod column;
pub mod config;
pub mod error;
pub mod frame;
pub mod kv;
pub mod logging;
pub mod mrtask;
pub mod network;
pub mod node;

pub use chunk::{Chunk, Data, NewChunk};
pub use column::{Column, ColumnType, Layout, RollupStats};
pub use config::Settings;
pub use error::LiquidError;
pub use frame::{Frame, FrameBuilder};
pub use kv::{KVStore, Key, KeyKind, Scope, Value};
pub use mrtask::{ChunkSet, MRTask, OutputColumn, TaskError, TaskHandle};
pub use node::{LocalCluster, Node};

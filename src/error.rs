//! The possible error types when using `liquid_frame`.
use crate::kv::Key;
use thiserror::Error;

/// An enumeration of `liquid_frame` errors.
#[derive(Debug, Error)]
pub enum LiquidError {
    /// A row index was outside the rows of a `Chunk`, `Column` or `Frame`
    #[error("Row index out of bounds")]
    RowIndexOutOfBounds,
    /// A column index was outside the columns of a `Frame` or task input
    #[error("Col index out of bounds")]
    ColIndexOutOfBounds,
    /// Two columns (or frames) that must share a `Layout` do not
    #[error("Columns do not share identical row partitioning")]
    IncompatiblePartitioning,
    /// A column name is already used in a `Frame`
    #[error("Name already in use")]
    NameAlreadyExists,
    /// The requested operation doesn't match the column or value type
    #[error("The requested operation doesn't match the data type")]
    TypeMismatch,
    /// An integer read hit a missing value
    #[error("Missing value at row {0}")]
    MissingValue(usize),
    /// The `Key` is absent from the store of its home node
    #[error("Key not found: {0}")]
    NotFound(Key),
    /// A `map` invocation failed; the message is the task's own error
    #[error("Task failed on node {node}: {message}")]
    TaskFailed { node: usize, message: String },
    /// The task was cancelled before it completed
    #[error("Task was cancelled")]
    Cancelled,
    /// The home node of a key could not carry out a request
    #[error("Request to node {node} failed: {message}")]
    Remote { node: usize, message: String },
    /// The node that owns a key or a piece of work left the cluster
    #[error("Node {0} is not a member of the cluster")]
    NodeLost(usize),
    /// No connection exists to the node with the given id
    #[error("Unknown node id")]
    UnknownId,
    /// A message arrived that was not expected by the protocol
    #[error("Unexpected message")]
    UnexpectedMessage,
    /// A connection was closed while a message was expected
    #[error("The stream was closed")]
    StreamClosed,
    /// A task name was not found in the `TaskRegistry`
    #[error("Task {0} is not registered on this node")]
    NotRegistered(String),
    /// Serialization or deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    /// An I/O error from the network or a persistence backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

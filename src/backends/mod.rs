//! Transport implementations bridging the engine to the cluster.

mod base;
mod local;

pub use base::{
    check_call, CommandOutput, CommandTransport, FileTransport, TransportError, TransportResult,
};
pub use local::LocalTransport;

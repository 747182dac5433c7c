//! Core library for tablerpc: a columnar, Arrow-IPC-based RPC runtime
//! served over either a single duplex pipe or stateless HTTP.
//!
//! [`ipc`] and [`codec`] define the wire format; [`registry`] holds the
//! method table and per-call handler contract; [`dispatch`] turns one
//! request into a response for each transport's shape; [`server`] and
//! [`client`] wire those pieces to an actual connection.

pub mod client;
pub mod codec;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod registry;
pub mod server;
pub mod token;

pub use error::{Result, RpcError};
pub use ipc::{Batch, DataKind, Field, Schema, Value};
pub use registry::{HandlerContext, Method, Protocol, Row, StreamHandler, UnaryHandler};

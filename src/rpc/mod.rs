//! JSON-RPC front end

pub mod message;
pub mod transport;

pub use message::{codes, error_code, Request, RequestId, Response, RpcError};
pub use transport::{serve_connection, serve_stdio, serve_tcp, tool_list};

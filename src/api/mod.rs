//! Non-proxy front-ends: the RPC endpoint and the optional dashboard.

pub mod rpc;
pub mod web;

pub use rpc::RpcServer;
pub use web::WebServer;

//! The forward-proxy front-end: the listener, CONNECT interception and the
//! translation of wire requests into gateway submissions.

pub mod mitm;
pub mod server;

pub use mitm::CertificateAuthority;
pub use server::ProxyServer;

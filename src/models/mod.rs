pub mod host;
pub mod request;

pub use host::HostInfo;
pub use request::{ActiveRequest, GatewayResponse, RequestStatus, ResponseStatus};

//! Request and response model for the gateway core.

use std::cmp::Reverse;
use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::host::HostInfo;

/// Lifecycle of a logical request inside the scheduler.
///
/// Transitions only `Pending -> Active -> (Pending | Finished)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Active,
    Finished,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Active => "active",
            RequestStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal classification delivered to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Timeout,
    HostUnreachable,
    ProxyUnreachable,
    RequestCancelled,
    UnknownError,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Timeout => "timeout",
            ResponseStatus::HostUnreachable => "host unreachable",
            ResponseStatus::ProxyUnreachable => "proxy unreachable",
            ResponseStatus::RequestCancelled => "request cancelled",
            ResponseStatus::UnknownError => "unknown error",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome of a logical request.
///
/// `code`, `body` and `headers` only carry meaning when `status` is `Ok`.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: ResponseStatus,
    pub code: u16,
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl GatewayResponse {
    /// A bodyless response carrying only a terminal classification.
    pub fn of(status: ResponseStatus) -> Self {
        Self {
            status,
            code: 0,
            body: Bytes::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn ok(code: u16, body: Bytes, headers: HeaderMap) -> Self {
        Self {
            status: ResponseStatus::Ok,
            code,
            body,
            headers,
        }
    }
}

#[derive(Debug)]
struct RequestState {
    status: RequestStatus,
    retries: u32,
}

/// One logical client request, shared between the submitter (holding the
/// reply receiver), the scheduler (while queued) and at most one executor
/// (while dispatched).
pub struct ActiveRequest {
    pub id: u64,
    pub url: Url,
    pub method: Method,
    pub priority: i64,
    pub host: HostInfo,
    pub retry_on_codes: Vec<u16>,
    pub cancel: CancellationToken,
    state: Mutex<RequestState>,
    reply: Mutex<Option<oneshot::Sender<GatewayResponse>>>,
}

impl ActiveRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        url: Url,
        priority: i64,
        host: HostInfo,
        retry_on_codes: Vec<u16>,
        cancel: CancellationToken,
        reply: oneshot::Sender<GatewayResponse>,
    ) -> Self {
        Self {
            id,
            url,
            method: Method::GET,
            priority,
            host,
            retry_on_codes,
            cancel,
            state: Mutex::new(RequestState {
                status: RequestStatus::Pending,
                retries: 0,
            }),
            reply: Mutex::new(Some(reply)),
        }
    }

    /// Queue ordering key: highest priority first, FIFO within a priority.
    pub fn queue_key(&self) -> (Reverse<i64>, u64) {
        (Reverse(self.priority), self.id)
    }

    pub fn host_name(&self) -> &str {
        &self.host.host
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: RequestStatus) {
        self.state.lock().status = status;
    }

    pub fn retries(&self) -> u32 {
        self.state.lock().retries
    }

    /// Consume one unit of the retry budget.
    pub fn record_retry(&self) -> u32 {
        let mut state = self.state.lock();
        state.retries += 1;
        state.retries
    }

    /// Deliver the terminal response. Returns false if a terminal value was
    /// already delivered or the submitter stopped listening; the reply
    /// channel is single-shot, so delivery can never happen twice and never
    /// blocks the caller.
    pub fn deliver(&self, response: GatewayResponse) -> bool {
        match self.reply.lock().take() {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for ActiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRequest")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("retries", &self.retries())
            .finish()
    }
}

//! Per-dispatch execution and the retry state machine.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::fleet::{FetchOutcome, ProxyClient};
use crate::gateway::Gateway;
use crate::models::{ActiveRequest, GatewayResponse, RequestStatus, ResponseStatus};

/// Cost charged against a (proxy, host) pairing when the target answers 429.
pub(crate) const RATE_LIMIT_PENALTY: u32 = 100;

/// What the state machine decided to do with one attempt's outcome.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// Deliver this response and finish.
    Terminal(GatewayResponse),
    /// Retry if budget remains, else deliver `terminal`.
    RetryTrigger {
        penalize: bool,
        terminal: GatewayResponse,
    },
    /// The proxy failed, not the request: requeue without spending budget.
    ProxyFailure,
}

/// Classify one attempt's outcome. Pure so the retry semantics are testable
/// in isolation.
pub(crate) fn judge(outcome: FetchOutcome, retry_on_codes: &[u16]) -> Verdict {
    match outcome {
        FetchOutcome::Cancelled => {
            Verdict::Terminal(GatewayResponse::of(ResponseStatus::RequestCancelled))
        }
        FetchOutcome::ProxyUnreachable => Verdict::ProxyFailure,
        FetchOutcome::Timeout => Verdict::RetryTrigger {
            penalize: false,
            terminal: GatewayResponse::of(ResponseStatus::Timeout),
        },
        FetchOutcome::Truncated => Verdict::RetryTrigger {
            penalize: false,
            terminal: GatewayResponse::of(ResponseStatus::UnknownError),
        },
        FetchOutcome::Failed => Verdict::Terminal(GatewayResponse::of(ResponseStatus::UnknownError)),
        FetchOutcome::Response(response) => {
            let code = response.code;
            let retry = code == 502 || code == 429 || retry_on_codes.contains(&code);

            if retry {
                Verdict::RetryTrigger {
                    penalize: code == 429,
                    terminal: response,
                }
            } else {
                Verdict::Terminal(response)
            }
        }
    }
}

/// Execute one dispatched attempt of `request` on `proxy` and apply the
/// retry state machine to the outcome.
pub async fn execute_at(
    request: Arc<ActiveRequest>,
    proxy: Arc<ProxyClient>,
    gateway: Arc<Gateway>,
) {
    request.set_status(RequestStatus::Active);

    let config = gateway.config();
    let deadline = if request.retries() == 0 {
        config.request_timeout
    } else {
        config.retry_timeout
    };

    let outcome = proxy.fetch(&request, deadline).await;

    match judge(outcome, &request.retry_on_codes) {
        Verdict::ProxyFailure => {
            // The failure was the proxy's, not the request's; a dead exit
            // must not drain the retry budget.
            proxy.mark_unreachable();
            requeue(&request, &gateway);
        }
        Verdict::Terminal(response) => {
            finish(&request, &gateway, response);
        }
        Verdict::RetryTrigger { penalize, terminal } => {
            if penalize {
                proxy.penalize(request.host_name(), RATE_LIMIT_PENALTY);
            }

            if request.retries() < config.retries {
                request.record_retry();
                requeue(&request, &gateway);
            } else {
                finish(&request, &gateway, terminal);
            }
        }
    }
}

fn requeue(request: &Arc<ActiveRequest>, gateway: &Arc<Gateway>) {
    debug!("Requeueing request {} (retries {})", request.id, request.retries());
    request.set_status(RequestStatus::Pending);
    gateway.publish_new_request(request.clone());
}

fn finish(request: &Arc<ActiveRequest>, gateway: &Arc<Gateway>, response: GatewayResponse) {
    request.set_status(RequestStatus::Finished);

    if !request.deliver(response) && !request.is_cancelled() {
        warn!("Request {} had no listener for its terminal response", request.id);
    }

    gateway.publish_request_finished(request.clone());
}

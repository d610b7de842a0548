//! The request scheduler: a single task owning the priority queue, matching
//! pending requests against the current proxy snapshot.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::executor;
use crate::fleet::ProxyClient;
use crate::gateway::Gateway;
use crate::models::ActiveRequest;

/// Queue ordering: highest priority first, FIFO within equal priorities.
pub type QueueKey = (Reverse<i64>, u64);

/// Backstop wake interval when nothing else fires.
const IDLE_RETRY: Duration = Duration::from_secs(1);

/// Run the scheduler loop until shutdown. Wakes on new requests, proxy-set
/// changes and the retry timer; each wake attempts one dispatch pass over
/// the queue.
pub async fn run(gateway: Arc<Gateway>, mut shutdown: watch::Receiver<bool>) {
    let mut new_requests = gateway.subscribe_new_requests();
    let mut proxy_changes = gateway.subscribe_proxy_set();

    let mut queue: BTreeMap<QueueKey, Arc<ActiveRequest>> = BTreeMap::new();
    let mut proxies: Vec<Arc<ProxyClient>> = Vec::new();
    let mut retry_after = Duration::ZERO;

    info!("Request scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Request scheduler shutting down");
                    return;
                }
            }
            received = new_requests.recv() => match received {
                Ok(request) => {
                    queue.insert(request.queue_key(), request);
                    retry_after = Duration::ZERO;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Scheduler lagged {} new-request events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            received = proxy_changes.recv() => match received {
                Ok(snapshot) => {
                    debug!("Proxy snapshot replaced: {} clients", snapshot.len());
                    proxies = snapshot;
                    retry_after = Duration::ZERO;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Snapshots are cumulative; pick up the freshest on the
                    // next publication.
                    proxies = gateway.ready_proxies();
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = tokio::time::sleep(retry_after) => {}
        }

        retry_after = IDLE_RETRY;

        if queue.is_empty() {
            continue;
        }

        if let Some((request, proxy)) = schedule_pass(&mut queue, &proxies, &mut retry_after) {
            debug!(
                "Dispatching request {} (priority {}) to proxy {}",
                request.id,
                request.priority,
                proxy.id()
            );
            tokio::spawn(executor::execute_at(request, proxy, gateway.clone()));
            retry_after = Duration::ZERO;
        }
    }
}

/// One dispatch pass: walk the queue in priority order, garbage-collect
/// cancelled requests, and hand the first admissible (request, proxy)
/// pairing back to the caller. Proxies are tried in shuffled order so load
/// spreads evenly across equal-weight exits. When every proxy is limited for
/// a request, the smallest observed retry-after is folded into the wake
/// timer and the pass moves on to the next request.
pub(crate) fn schedule_pass(
    queue: &mut BTreeMap<QueueKey, Arc<ActiveRequest>>,
    proxies: &[Arc<ProxyClient>],
    retry_after: &mut Duration,
) -> Option<(Arc<ActiveRequest>, Arc<ProxyClient>)> {
    let mut rng = rand::thread_rng();
    let keys: Vec<QueueKey> = queue.keys().copied().collect();

    for key in keys {
        let Some(request) = queue.get(&key).cloned() else {
            continue;
        };

        if request.is_cancelled() {
            // Terminal delivery is the executor's concern; a cancelled entry
            // in the queue is just garbage.
            queue.remove(&key);
            continue;
        }

        let mut order: Vec<usize> = (0..proxies.len()).collect();
        order.shuffle(&mut rng);

        for index in order {
            let proxy = &proxies[index];
            let outcome = proxy.admit(request.host_name());

            if outcome.limited {
                if outcome.retry_after < *retry_after {
                    *retry_after = outcome.retry_after;
                }
                continue;
            }

            queue.remove(&key);
            return Some((request, proxy.clone()));
        }
    }

    None
}

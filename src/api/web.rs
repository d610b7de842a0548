//! The optional read-only dashboard.
//!
//! A tracker task mirrors the request broadcasts into a live map; the two
//! routes render it as HTML.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::models::ActiveRequest;

/// The pending view caps out at this many rows.
const PENDING_LIMIT: usize = 100;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>scrapegate</title>
<style>
body { font-family: monospace; margin: 2em; }
table { border-collapse: collapse; }
td, th { padding: 0.2em 0.8em; text-align: left; }
</style>
</head>
<body>
<h1>scrapegate</h1>
<div id="pending">loading&hellip;</div>
<script>
async function refresh() {
  const res = await fetch('/pending');
  document.getElementById('pending').innerHTML = await res.text();
}
refresh();
setInterval(refresh, 1000);
</script>
</body>
</html>
"#;

/// Live requests keyed by id, fed from the broadcasts.
#[derive(Default)]
pub struct RequestTracker {
    live: Mutex<HashMap<u64, Arc<ActiveRequest>>>,
}

impl RequestTracker {
    pub fn insert(&self, request: Arc<ActiveRequest>) {
        self.live.lock().insert(request.id, request);
    }

    pub fn remove(&self, request: &ActiveRequest) {
        self.live.lock().remove(&request.id);
    }

    /// Snapshot of live requests, highest priority first.
    pub fn snapshot(&self) -> Vec<Arc<ActiveRequest>> {
        let mut items: Vec<Arc<ActiveRequest>> = self.live.lock().values().cloned().collect();
        items.sort_by_key(|request| (Reverse(request.priority), request.id));
        items
    }
}

#[derive(Clone)]
struct WebState {
    tracker: Arc<RequestTracker>,
}

/// Dashboard server
pub struct WebServer {
    config: Config,
    gateway: Arc<Gateway>,
    tracker: Arc<RequestTracker>,
}

impl WebServer {
    pub fn new(config: Config, gateway: Arc<Gateway>) -> Self {
        Self {
            config,
            gateway,
            tracker: Arc::new(RequestTracker::default()),
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let tracker = self.tracker.clone();
        let gateway = self.gateway.clone();
        let tracker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            track_requests(gateway, tracker, tracker_shutdown).await;
        });

        let state = WebState {
            tracker: self.tracker.clone(),
        };

        let app = Router::new()
            .route("/", get(index))
            .route("/pending", get(pending))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.config.web_addr()).await?;
        info!("Dashboard listening on {}", self.config.web_addr());

        let mut shutdown = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;

        info!("Dashboard shutting down");
        Ok(())
    }
}

/// Mirror the request lifecycle broadcasts into the tracker.
async fn track_requests(
    gateway: Arc<Gateway>,
    tracker: Arc<RequestTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut new_requests = gateway.subscribe_new_requests();
    let mut finished = gateway.subscribe_request_finished();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            received = new_requests.recv() => match received {
                Ok(request) => tracker.insert(request),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            received = finished.recv() => match received {
                Ok(request) => tracker.remove(&request),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn pending(State(state): State<WebState>) -> Html<String> {
    Html(render_pending(&state.tracker.snapshot()))
}

fn render_pending(items: &[Arc<ActiveRequest>]) -> String {
    let total = items.len();

    let mut html = format!(
        "<p>{} live request{}</p>\n<table>\n<tr><th>id</th><th>priority</th><th>status</th><th>retries</th><th>url</th></tr>\n",
        total,
        if total == 1 { "" } else { "s" }
    );

    for request in items.iter().take(PENDING_LIMIT) {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            request.id,
            request.priority,
            request.status(),
            request.retries(),
            escape_html(request.url.as_str()),
        ));
    }

    html.push_str("</table>\n");
    html
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

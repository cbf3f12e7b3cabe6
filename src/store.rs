use std::sync::Arc;

use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::config::Config;
use crate::session::SessionManager;
use crate::share::ShareStore;
use crate::webhook::store::WebhookStore;

/// Streaming HTTP client the reverse proxy forwards through.
pub type UpstreamClient = Client<HttpConnector, axum::body::Body>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub webhooks: Arc<dyn WebhookStore>,
    pub shares: Arc<dyn ShareStore>,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionManager>,
        webhooks: Arc<dyn WebhookStore>,
        shares: Arc<dyn ShareStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            webhooks,
            shares,
            upstream: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }
}

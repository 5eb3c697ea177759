//! Fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use pagesmith::catalog::{BackendDescriptor, CatalogSnapshot, Tier};
use pagesmith::gateway::{
    CatalogSource, ErrorContext, GenerationClient, ListingPricing, ModelListing, PromptPayload,
    ProviderError, SendOptions,
};

// =============================================================================
// Catalog
// =============================================================================

pub fn free_listing(id: &str, context: u32) -> ModelListing {
    ModelListing {
        id: id.to_string(),
        name: None,
        context_length: Some(context),
        pricing: ListingPricing {
            prompt: Some("0".into()),
            completion: Some("0".into()),
            request: None,
            image: None,
        },
    }
}

/// Serves a fixed listing until told to fail.
pub struct FakeSource {
    listings: Vec<ModelListing>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(listings: Vec<ModelListing>) -> Arc<Self> {
        Arc::new(Self {
            listings,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for FakeSource {
    async fn list_backends(&self) -> Result<Vec<ModelListing>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::provider("fake", "listing down", true));
        }
        Ok(self.listings.clone())
    }
}

pub fn backend(id: &str, quality: f64, tier: Tier) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        display_name: id.to_string(),
        context_limit: 32_000,
        quality_score: quality,
        tier,
    }
}

pub fn snapshot(backends: Vec<BackendDescriptor>) -> Arc<CatalogSnapshot> {
    Arc::new(CatalogSnapshot {
        fetched_at: Utc::now(),
        task_class: "site".into(),
        backends,
    })
}

// =============================================================================
// Generation client
// =============================================================================

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    RateLimited(Duration),
    Transport,
    Auth,
    Empty,
}

impl Reply {
    fn into_result(self) -> Result<String, ProviderError> {
        match self {
            Reply::Text(t) => Ok(t),
            Reply::RateLimited(d) => Err(ProviderError::rate_limited(
                d,
                ErrorContext::new().with_status(429),
            )),
            Reply::Transport => Err(ProviderError::provider("fake", "connection reset", true)),
            Reply::Auth => Err(ProviderError::auth(
                "bad key",
                ErrorContext::new().with_status(401),
            )),
            Reply::Empty => Err(ProviderError::empty("nothing")),
        }
    }
}

/// Per-backend reply queues. When a queue runs dry the backend's fallback
/// reply (or the client default) is used.
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallbacks: Mutex<HashMap<String, Reply>>,
    default_reply: Reply,
    latency: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(default_reply: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallbacks: Mutex::new(HashMap::new()),
            default_reply,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn script(self, backend_id: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(backend_id.to_string(), replies.into());
        self
    }

    pub fn always(self, backend_id: &str, reply: Reply) -> Self {
        self.fallbacks
            .lock()
            .unwrap()
            .insert(backend_id.to_string(), reply);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, backend_id: &str) -> usize {
        self.calls().iter().filter(|c| *c == backend_id).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, backend_id: &str) -> Reply {
        if let Some(reply) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(backend_id)
            .and_then(|q| q.pop_front())
        {
            return reply;
        }
        self.fallbacks
            .lock()
            .unwrap()
            .get(backend_id)
            .cloned()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn send(
        &self,
        backend_id: &str,
        _payload: &PromptPayload,
        _options: &SendOptions,
    ) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(backend_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = self.next_reply(backend_id);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply.into_result()
    }
}

// =============================================================================
// Documents
// =============================================================================

pub fn page_json(path: &str) -> String {
    let body = format!(
        "<main><h1>{path}</h1><p>{}</p></main>",
        "A paragraph of real page content that easily clears the thin body check. ".repeat(3)
    );
    serde_json::json!({ "files": { path: body }, "entry": path }).to_string()
}

pub fn foundation_json() -> String {
    let index = "<!doctype html><html><head><link rel=\"stylesheet\" href=\"styles.css\"></head>\
                 <body><header>Site</header><main>Welcome to the site. This is the landing page \
                 with enough words to be a real page.</main><footer>Footer</footer></body></html>";
    let css = ":root { --ink: #222222; }\nbody { color: var(--ink); }\n";
    serde_json::json!({
        "files": { "index.html": index, "styles.css": css },
        "entry": "index.html"
    })
    .to_string()
}

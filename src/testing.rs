//! Scripted stand-ins for the network, browser and geocoder boundaries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::geocode::{Coordinates, DisabledGeocoder, GeocodeError, GeocodeLookup};
use crate::http::{FetchClient, HttpResponse, RetryPolicy, Transport, TransportError};
use crate::render::{RenderError, Renderer};
use crate::scraping::crawl::{CrawlSettings, HarvestContext};
use tokio_util::sync::CancellationToken;

pub fn ok(body: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: 200,
        body: body.to_string(),
    })
}

/// Per-URL queues of responses. Once a URL's queue is drained the sticky
/// response set with [`ScriptedTransport::always`] is served, otherwise 404.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Result<HttpResponse, TransportError>>>>,
    sticky: Mutex<HashMap<String, String>>,
    stalls: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    pub fn push(&self, url: &Url, response: Result<HttpResponse, TransportError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn always(&self, url: &Url, body: &str) {
        self.sticky
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }

    /// Every request for `url` hangs for `delay` before answering.
    pub fn stall(&self, url: &Url, delay: Duration) {
        self.stalls.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn calls(&self, url: &Url) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(url.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &Url, _query: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let stall = self.stalls.lock().unwrap().get(url.as_str()).copied();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if let Some(next) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(url.as_str())
            .and_then(VecDeque::pop_front)
        {
            return next;
        }
        match self.sticky.lock().unwrap().get(url.as_str()) {
            Some(body) => ok(body),
            None => Ok(HttpResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

/// Serves canned DOMs by URL; unknown URLs fail to navigate.
#[derive(Default)]
pub struct FakeRenderer {
    pages: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl FakeRenderer {
    pub fn page(&self, url: &Url, dom: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), dom.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, url: &Url, _wait_for: Option<&str>) -> Result<String, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| RenderError::Navigation {
                status: "exit status: 1".into(),
                stderr: format!("no page scripted for {url}"),
            })
    }
}

/// Answers every query the same way and records what was asked.
pub struct CountingLookup {
    answer: Result<Option<Coordinates>, ()>,
    queries: Mutex<Vec<String>>,
    stall_first: Mutex<Option<Duration>>,
}

impl CountingLookup {
    pub fn answering(answer: Option<Coordinates>) -> Self {
        Self {
            answer: Ok(answer),
            queries: Mutex::new(Vec::new()),
            stall_first: Mutex::new(None),
        }
    }

    /// Answers like `answering`, but the first lookup hangs for `stall`.
    pub fn stalling_once(answer: Option<Coordinates>, stall: Duration) -> Self {
        Self {
            stall_first: Mutex::new(Some(stall)),
            ..Self::answering(answer)
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Err(()),
            queries: Mutex::new(Vec::new()),
            stall_first: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl GeocodeLookup for CountingLookup {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.queries.lock().unwrap().push(query.to_string());
        let stall = self.stall_first.lock().unwrap().take();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        self.answer
            .map_err(|_| GeocodeError::Http("503 Service Unavailable".into()))
    }
}

/// Context wired to the given fakes, geocoding off, generous limits.
pub fn context(transport: Arc<ScriptedTransport>, renderer: Arc<FakeRenderer>) -> HarvestContext {
    HarvestContext {
        client: Arc::new(FetchClient::new(
            transport,
            RetryPolicy {
                attempts: 3,
                backoff_base: Duration::from_millis(10),
                backoff_cap: Duration::from_millis(40),
                throttle_pause: Duration::from_millis(10),
            },
        )),
        renderer,
        geocoder: Arc::new(DisabledGeocoder),
        settings: CrawlSettings {
            limit: 50,
            max_list_pages: 5,
            detail_concurrency: 2,
        },
        cancel: CancellationToken::new(),
    }
}

pub fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

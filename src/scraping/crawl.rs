use std::collections::HashSet;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use scraper::Html;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::base::next_page_link;
use super::SourceAdapter;
use crate::config::HarvestConfig;
use crate::geocode::Geocoder;
use crate::http::FetchClient;
use crate::models::{Event, EventDraft};
use crate::render::Renderer;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Most events one source may emit.
    pub limit: usize,
    pub max_list_pages: usize,
    pub detail_concurrency: usize,
}

impl CrawlSettings {
    pub fn from_config(config: &HarvestConfig, limit: usize) -> Self {
        Self {
            limit,
            max_list_pages: config.max_list_pages.max(1),
            detail_concurrency: config.detail_concurrency.max(1),
        }
    }
}

/// Everything a source needs for one run. Cheap to clone.
#[derive(Clone)]
pub struct HarvestContext {
    pub client: Arc<FetchClient>,
    pub renderer: Arc<dyn Renderer>,
    pub geocoder: Arc<dyn Geocoder>,
    pub settings: CrawlSettings,
    pub cancel: CancellationToken,
}

impl HarvestContext {
    pub fn limit_reached(&self, found: usize) -> bool {
        found >= self.settings.limit || self.cancel.is_cancelled()
    }

    /// Drives `work` to completion unless the run is cancelled first, in
    /// which case `None` is returned and `work` is dropped.
    pub async fn unless_cancelled<F: Future>(&self, work: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            output = work => Some(output),
        }
    }
}

/// Builds the event and attaches coordinates. Drafts missing a title or
/// start date produce nothing.
pub async fn finish(
    draft: EventDraft,
    source: &str,
    link: Url,
    geocoder: &dyn Geocoder,
) -> Option<Event> {
    let (place, city) = draft.geocode_query();
    let mut event = match draft.build(source, link) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(source, error = %err, "discarding incomplete event");
            return None;
        }
    };
    let coords = geocoder.geocode(place.as_deref(), city.as_deref()).await;
    event.venue.set_coordinates(coords);
    Some(event)
}

async fn load_event<A>(adapter: &A, ctx: &HarvestContext, url: &Url) -> anyhow::Result<Option<Event>>
where
    A: SourceAdapter + ?Sized,
{
    let html = adapter.fetch_detail(ctx, url).await?;
    Ok(adapter.extract_detail(url, &html, ctx.geocoder.as_ref()).await)
}

/// Fetches and extracts detail pages with bounded concurrency, keeping list
/// order, until `remaining` events are collected. A failing page is logged
/// and skipped.
pub async fn collect_details<A>(
    adapter: &A,
    ctx: &HarvestContext,
    urls: Vec<Url>,
    remaining: usize,
) -> Vec<Event>
where
    A: SourceAdapter + ?Sized,
{
    let mut events = Vec::new();
    if remaining == 0 || urls.is_empty() {
        return events;
    }
    let source = adapter.source_id();

    let outcomes = stream::iter(urls)
        .map(move |url| async move {
            let outcome = load_event(adapter, ctx, &url).await;
            (url, outcome)
        })
        .buffered(ctx.settings.detail_concurrency.max(1));
    let mut outcomes = pin!(outcomes);

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                tracing::info!(source, "harvest cancelled");
                break;
            }
            next = outcomes.next() => next,
        };
        let Some((url, outcome)) = next else {
            break;
        };
        match outcome {
            Ok(Some(event)) => {
                events.push(event);
                if events.len() >= remaining {
                    break;
                }
            }
            Ok(None) => tracing::debug!(source, %url, "no event on page"),
            Err(err) => tracing::warn!(source, %url, error = %format!("{err:#}"), "skipping detail page"),
        }
    }
    events
}

fn next_page(list_url: &Url, html: &str) -> Option<Url> {
    next_page_link(&Html::parse_document(html), list_url)
}

/// Walks list pages from `start` following next-page links, up to the page
/// bound and the event limit. `prefetched` is used as the first page's body
/// when the caller already has it.
///
/// Failing to load the first page is an error; a later page failing just ends
/// the walk with what was collected.
pub async fn crawl_paginated<A>(
    adapter: &A,
    ctx: &HarvestContext,
    start: Url,
    mut prefetched: Option<String>,
) -> anyhow::Result<Vec<Event>>
where
    A: SourceAdapter + ?Sized,
{
    let source = adapter.source_id();
    let mut events = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(start);
    let mut pages = 0;

    while let Some(list_url) = next.take() {
        if pages >= ctx.settings.max_list_pages || ctx.limit_reached(events.len()) {
            break;
        }
        let Some(loaded) = ctx
            .unless_cancelled(adapter.load_list(ctx, &list_url, prefetched.take()))
            .await
        else {
            tracing::info!(source, url = %list_url, "harvest cancelled");
            break;
        };
        let html = match loaded {
            Ok(html) => html,
            Err(err) if pages == 0 => return Err(err),
            Err(err) => {
                tracing::warn!(source, url = %list_url, error = %format!("{err:#}"), "list page failed, stopping pagination");
                break;
            }
        };
        pages += 1;

        let mut links = adapter.discover_links(&list_url, &html);
        links.retain(|link| seen.insert(link.to_string()) && *link != list_url);
        tracing::debug!(source, url = %list_url, links = links.len(), "list page parsed");

        let remaining = ctx.settings.limit.saturating_sub(events.len());
        events.extend(collect_details(adapter, ctx, links, remaining).await);
        next = next_page(&list_url, &html);
    }
    Ok(events)
}

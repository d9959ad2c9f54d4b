pub mod base;
pub mod crawl;
pub mod minsk_tourism;
pub mod relax;
pub mod structured;
pub mod ticketpro;

use async_trait::async_trait;
use futures::future::join_all;
use url::Url;

use crate::dedupe::dedupe;
use crate::geocode::Geocoder;
use crate::models::{Event, EventDraft};
use crawl::{finish, HarvestContext};

/// One event website.
///
/// `discover_links` and `parse_detail` are pure functions of page text; the
/// async methods add fetching on top and may be overridden where a site needs
/// a different loading strategy.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn source_name(&self) -> &'static str;
    fn base_url(&self) -> &'static str;

    /// Detail-page links on a list page, absolute and deduplicated in page order.
    fn discover_links(&self, list_url: &Url, html: &str) -> Vec<Url>;

    /// Whatever fields the page yields. Completeness is checked later.
    fn parse_detail(&self, url: &Url, html: &str) -> Option<EventDraft>;

    async fn load_list(
        &self,
        ctx: &HarvestContext,
        url: &Url,
        prefetched: Option<String>,
    ) -> anyhow::Result<String> {
        match prefetched {
            Some(html) => Ok(html),
            None => Ok(ctx.client.get_text(url).await?),
        }
    }

    async fn fetch_detail(&self, ctx: &HarvestContext, url: &Url) -> anyhow::Result<String> {
        Ok(ctx.client.get_text(url).await?)
    }

    async fn extract_detail(
        &self,
        url: &Url,
        html: &str,
        geocoder: &dyn Geocoder,
    ) -> Option<Event> {
        let draft = self.parse_detail(url, html)?;
        finish(draft, self.source_id(), url.clone(), geocoder).await
    }

    async fn harvest(&self, ctx: &HarvestContext) -> anyhow::Result<Vec<Event>>;
}

#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceReport {
    pub source: String,
    pub events: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct HarvestOutcome {
    /// Deduplicated, in source order then page order.
    pub events: Vec<Event>,
    pub reports: Vec<SourceReport>,
    pub unknown: Vec<String>,
}

fn active_adapters() -> Vec<Box<dyn SourceAdapter>> {
    vec![
        Box::new(relax::Relax),
        Box::new(ticketpro::Ticketpro),
        Box::new(minsk_tourism::MinskTourism),
    ]
}

pub fn list_sources() -> Vec<SourceInfo> {
    active_adapters()
        .into_iter()
        .map(|adapter| SourceInfo {
            id: adapter.source_id().to_string(),
            name: adapter.source_name().to_string(),
            url: adapter.base_url().to_string(),
        })
        .collect()
}

pub fn find_adapter(id: &str) -> Option<Box<dyn SourceAdapter>> {
    active_adapters()
        .into_iter()
        .find(|adapter| adapter.source_id() == id)
}

/// Runs the named sources concurrently and merges their events in the order
/// the names were given. Unknown names and failing sources are reported, not
/// fatal.
pub async fn run_sources(names: &[String], ctx: &HarvestContext) -> HarvestOutcome {
    let mut outcome = HarvestOutcome::default();
    let mut selected = Vec::new();
    for name in names {
        match find_adapter(name) {
            Some(adapter) => selected.push(adapter),
            None => {
                tracing::warn!(source = %name, "unknown source");
                outcome.unknown.push(name.clone());
            }
        }
    }

    let runs = selected.iter().map(|adapter| async move {
        tracing::info!(source = adapter.source_id(), "harvest started");
        (adapter.source_id(), adapter.harvest(ctx).await)
    });

    let mut events = Vec::new();
    for (source, result) in join_all(runs).await {
        match result {
            Ok(mut found) => {
                tracing::info!(source, events = found.len(), "harvest finished");
                outcome.reports.push(SourceReport {
                    source: source.to_string(),
                    events: found.len(),
                    error: None,
                });
                events.append(&mut found);
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(source, error = %message, "source failed");
                outcome.reports.push(SourceReport {
                    source: source.to_string(),
                    events: 0,
                    error: Some(message),
                });
            }
        }
    }

    let total = events.len();
    outcome.events = dedupe(events);
    tracing::info!(
        total,
        unique = outcome.events.len(),
        "merged harvested events"
    );
    outcome
}

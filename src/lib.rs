pub mod config;
pub mod dedupe;
pub mod geocode;
pub mod http;
pub mod logging;
pub mod models;
pub mod output;
pub mod render;
pub mod scraping;
pub mod utils;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config::HarvestConfig;
use geocode::{CachedGeocoder, DisabledGeocoder, Geocoder};
use http::FetchClient;
use render::{ChromeRenderer, Renderer};
use scraping::crawl::{CrawlSettings, HarvestContext};
use scraping::SourceReport;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub sources: Vec<String>,
    /// Per source.
    pub limit: usize,
    pub out: PathBuf,
    pub geocode: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub written: usize,
    pub out: PathBuf,
    pub reports: Vec<SourceReport>,
    pub unknown: Vec<String>,
}

/// Splits `relax, ticketpro,,` into trimmed, non-empty names.
pub fn parse_source_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

pub fn build_context(
    config: &HarvestConfig,
    options: &RunOptions,
    cancel: CancellationToken,
) -> anyhow::Result<HarvestContext> {
    let geocoder: Arc<dyn Geocoder> = if options.geocode {
        Arc::new(CachedGeocoder::from_config(config)?)
    } else {
        Arc::new(DisabledGeocoder)
    };
    let renderer: Arc<dyn Renderer> = Arc::new(ChromeRenderer::from_config(config));
    Ok(HarvestContext {
        client: Arc::new(FetchClient::from_config(config)?),
        renderer,
        geocoder,
        settings: CrawlSettings::from_config(config, options.limit),
        cancel,
    })
}

/// Harvests the selected sources and writes the merged events. Only a
/// failure to write the output is an error.
pub async fn harvest(ctx: &HarvestContext, options: &RunOptions) -> anyhow::Result<RunSummary> {
    let outcome = scraping::run_sources(&options.sources, ctx).await;
    output::write_jsonl(&options.out, &outcome.events)?;
    Ok(RunSummary {
        written: outcome.events.len(),
        out: options.out.clone(),
        reports: outcome.reports,
        unknown: outcome.unknown,
    })
}

pub async fn run(
    config: &HarvestConfig,
    options: &RunOptions,
    cancel: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let ctx = build_context(config, options, cancel)?;
    harvest(&ctx, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, url, FakeRenderer, ScriptedTransport};

    #[test]
    fn source_list_is_trimmed() {
        assert_eq!(parse_source_list(" relax, ticketpro,,"), ["relax", "ticketpro"]);
        assert!(parse_source_list("").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn harvest_writes_surviving_events() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.always(
            &url("https://minsktourism.by/afisha/"),
            r#"<a href="/afisha/a/">A</a><a href="/afisha/b/">B</a>"#,
        );
        let page = r#"<script type="application/ld+json">
            {"@type": "Event", "name": "Ночь музеев", "startDate": "2025-05-17T18:00:00+03:00", "identifier": "nm-2025"}
            </script>"#;
        // Two URLs, one event: the shared identifier collapses them.
        transport.always(&url("https://minsktourism.by/afisha/a/"), page);
        transport.always(&url("https://minsktourism.by/afisha/b/"), page);
        let ctx = context(transport, Arc::new(FakeRenderer::default()));

        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            sources: parse_source_list("minsktourism,belarus.by"),
            limit: 50,
            out: dir.path().join("events.jsonl"),
            geocode: false,
        };
        let summary = harvest(&ctx, &options).await.unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.unknown, ["belarus.by"]);
        assert_eq!(summary.reports[0].events, 2);
        let written = std::fs::read_to_string(&options.out).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("\"source_uid\":\"nm-2025\""));
    }
}

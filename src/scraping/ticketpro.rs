use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::base::{self, parse_datetime};
use super::crawl::{self, HarvestContext};
use super::structured::{self, LD_JSON_MARKER};
use super::SourceAdapter;
use crate::models::{Event, EventDraft};

const BASE_URL: &str = "https://www.ticketpro.by/";
const SOURCE_ID: &str = "ticketpro";
const SOURCE_NAME: &str = "Ticketpro";
const CANDIDATE_LISTS: [&str; 6] = [
    "ru/Events/",
    "ru/Concerts/",
    "ru/Theatre/",
    "ru/Sport/",
    "ru/AllEvents/",
    "ru/All/",
];
const CITIES: [&str; 2] = ["minsk", "vitebsk"];
const TIME_MARKER: &str = "<time";
const LIST_WAIT: &str = "a";
const DETAIL_WAIT: &str = "h1";

static EVENT_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/(event|ru/Events|ru/Concerts|ru/Theatre|ru/Sport)/").expect("ticketpro path regex")
});

static TITLE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| base::selectors(&["h1"]));
static DATE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("time, .date, .event-date").expect("ticketpro date selector"));
static VENUE_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".venue", ".place", ".location a", ".location"]));
static ADDRESS_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".address", ".place-address", ".venue-address"]));
static CATEGORY_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".category", ".breadcrumbs a:last-child", ".tags a"]));
static PRICE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".price, .prices, .cost").expect("ticketpro price selector"));
static AGE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| base::selectors(&[".age-limit"]));
static DESCRIPTION_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    base::selectors(&[".description", ".event-description", "article", ".content"])
});

pub struct Ticketpro;

fn is_event_link(url: &Url) -> bool {
    let full = url.as_str();
    let lower = full.to_lowercase();
    EVENT_PATH_RE.is_match(full) && CITIES.iter().any(|city| lower.contains(city))
}

fn is_sitemap_event(loc: &str) -> bool {
    loc.contains("/event/") || loc.contains("/Events/")
}

/// Static markup carries neither structured data nor any `<time>` element.
fn needs_render(html: &str) -> bool {
    !html.contains(LD_JSON_MARKER) && !html.contains(TIME_MARKER)
}

impl Ticketpro {
    /// First candidate list page that loads, with its body.
    async fn probe_lists(&self, ctx: &HarvestContext, root: &Url) -> Result<Option<(Url, String)>> {
        for path in CANDIDATE_LISTS {
            let candidate = root.join(path)?;
            let Some(fetched) = ctx.unless_cancelled(ctx.client.get_text(&candidate)).await else {
                return Ok(None);
            };
            match fetched {
                Ok(html) => return Ok(Some((candidate, html))),
                Err(err) => {
                    tracing::debug!(source = SOURCE_ID, url = %candidate, error = %err, "list candidate unavailable")
                }
            }
        }
        Ok(None)
    }

    /// Detail URLs from `sitemap.xml`, used when no list page responds.
    async fn sitemap_links(&self, ctx: &HarvestContext, root: &Url) -> Result<Vec<Url>> {
        let sitemap = root.join("sitemap.xml")?;
        let xml = ctx
            .client
            .get_text(&sitemap)
            .await
            .context("no list page responded and the sitemap is unavailable")?;
        let links = base::sitemap_locations(&xml)
            .into_iter()
            .filter(|loc| is_sitemap_event(loc))
            .filter_map(|loc| Url::parse(&loc).ok());
        Ok(base::unique_links(links))
    }
}

#[async_trait]
impl SourceAdapter for Ticketpro {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn base_url(&self) -> &'static str {
        BASE_URL
    }

    fn discover_links(&self, list_url: &Url, html: &str) -> Vec<Url> {
        let document = Html::parse_document(html);
        base::collect_links(&document, list_url, is_event_link)
    }

    fn parse_detail(&self, url: &Url, html: &str) -> Option<EventDraft> {
        let document = Html::parse_document(html);
        let ld = structured::event_ld(&document).unwrap_or_default();

        let title = ld
            .name
            .clone()
            .or_else(|| base::select_first_text(&document, &TITLE_SELECTORS));
        let (start_dt, end_dt) = base::date_window(
            ld.start_date.as_deref().and_then(parse_datetime),
            ld.end_date.as_deref().and_then(parse_datetime),
            base::parsed_dates(&document, &DATE_SELECTOR),
        );

        let price_text = base::all_texts(&document.root_element(), &PRICE_SELECTOR).join(" ");
        let price = base::parse_price_byn(&price_text);
        let (og_cover, images) = base::extract_meta(&document, url);

        Some(EventDraft {
            title,
            start_dt,
            end_dt,
            venue_name: ld
                .location_name
                .clone()
                .or_else(|| base::select_first_text(&document, &VENUE_SELECTORS)),
            venue_address: ld
                .street_address
                .clone()
                .or_else(|| base::select_first_text(&document, &ADDRESS_SELECTORS)),
            city: ld.locality.clone(),
            category: base::select_first_text(&document, &CATEGORY_SELECTORS),
            price_min_byn: price.min,
            price_max_byn: price.max,
            is_free: price.is_free,
            age: base::select_first_text(&document, &AGE_SELECTORS)
                .and_then(|text| base::parse_age(&text)),
            source_uid: ld.identifier.clone(),
            cover_url: ld
                .image
                .as_deref()
                .and_then(|image| base::absolute_url(url, image))
                .or(og_cover),
            description: ld
                .description
                .clone()
                .or_else(|| base::select_first_text(&document, &DESCRIPTION_SELECTORS)),
            images,
        })
    }

    /// Renders the list page when its static markup has no event links.
    async fn load_list(
        &self,
        ctx: &HarvestContext,
        url: &Url,
        prefetched: Option<String>,
    ) -> Result<String> {
        let html = match prefetched {
            Some(html) => html,
            None => ctx.client.get_text(url).await?,
        };
        if !self.discover_links(url, &html).is_empty() {
            return Ok(html);
        }
        tracing::debug!(source = SOURCE_ID, %url, "no links in static list page, rendering");
        Ok(ctx.renderer.render(url, Some(LIST_WAIT)).await?)
    }

    async fn fetch_detail(&self, ctx: &HarvestContext, url: &Url) -> Result<String> {
        let html = ctx.client.get_text(url).await?;
        if !needs_render(&html) {
            return Ok(html);
        }
        tracing::debug!(source = SOURCE_ID, %url, "detail page lacks event markup, rendering");
        Ok(ctx.renderer.render(url, Some(DETAIL_WAIT)).await?)
    }

    async fn harvest(&self, ctx: &HarvestContext) -> Result<Vec<Event>> {
        let root = Url::parse(BASE_URL)?;
        if let Some((list_url, html)) = self.probe_lists(ctx, &root).await? {
            return crawl::crawl_paginated(self, ctx, list_url, Some(html)).await;
        }
        if ctx.cancel.is_cancelled() {
            tracing::info!(source = SOURCE_ID, "harvest cancelled while probing list pages");
            return Ok(Vec::new());
        }

        tracing::info!(source = SOURCE_ID, "no list page responded, falling back to sitemap");
        let links = self.sitemap_links(ctx, &root).await?;
        Ok(crawl::collect_details(self, ctx, links, ctx.settings.limit).await)
    }
}

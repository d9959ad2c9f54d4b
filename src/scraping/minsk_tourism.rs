use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

use super::base::{self, parse_datetime};
use super::crawl::{self, HarvestContext};
use super::structured;
use super::SourceAdapter;
use crate::models::{Event, EventDraft};

const BASE_URL: &str = "https://minsktourism.by/";
const SOURCE_ID: &str = "minsktourism";
const SOURCE_NAME: &str = "Minsk Tourism";
const CITY: &str = "Минск";
const LINK_MARKERS: [&str; 3] = ["/afisha/", "/event/", "/calendar/"];

static TITLE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| base::selectors(&["h1"]));
static DATE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("time, .date, .event-date").expect("minsktourism date selector"));
static VENUE_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".place", ".location"]));
static ADDRESS_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| base::selectors(&[".address"]));
static CATEGORY_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".category", ".tags a"]));
static DESCRIPTION_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".description", "article", ".content"]));

pub struct MinskTourism;

#[async_trait]
impl SourceAdapter for MinskTourism {
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
        base::collect_links(&document, list_url, |url| {
            url != list_url && LINK_MARKERS.iter().any(|marker| url.as_str().contains(marker))
        })
    }

    /// No prices or age limits are published here.
    fn parse_detail(&self, url: &Url, html: &str) -> Option<EventDraft> {
        let document = Html::parse_document(html);
        let ld = structured::event_ld(&document).unwrap_or_default();

        let (start_dt, end_dt) = base::date_window(
            ld.start_date.as_deref().and_then(parse_datetime),
            ld.end_date.as_deref().and_then(parse_datetime),
            base::parsed_dates(&document, &DATE_SELECTOR),
        );
        let (og_cover, images) = base::extract_meta(&document, url);

        Some(EventDraft {
            title: ld
                .name
                .clone()
                .or_else(|| base::select_first_text(&document, &TITLE_SELECTORS)),
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
            city: ld.locality.clone().or_else(|| Some(CITY.to_string())),
            category: base::select_first_text(&document, &CATEGORY_SELECTORS),
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
            ..Default::default()
        })
    }

    async fn harvest(&self, ctx: &HarvestContext) -> Result<Vec<Event>> {
        let start = Url::parse(BASE_URL)?.join("afisha/")?;
        crawl::crawl_paginated(self, ctx, start, None).await
    }
}

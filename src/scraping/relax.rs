use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

use super::base::{self, parse_datetime};
use super::crawl::{self, HarvestContext};
use super::structured;
use super::SourceAdapter;
use crate::models::{Event, EventDraft};

const BASE_URL: &str = "https://afisha.relax.by/";
const SOURCE_ID: &str = "relax";
const SOURCE_NAME: &str = "Relax.by Афиша";
const SECTIONS: [&str; 4] = ["concert", "theatre", "exhibition", "festival"];
const NOT_A_CITY: [&str; 2] = ["афиша", "календарь"];

static TITLE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| base::selectors(&["h1"]));
static OG_TITLE_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[r#"meta[property="og:title"]"#]));
static DATE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("time, .event-date, .date, .schedule").expect("relax date selector")
});
static META_TIME_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    base::selectors(&[
        r#"meta[property="event:start_time"]"#,
        r#"meta[property="og:updated_time"]"#,
    ])
});
static VENUE_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".place", ".venue", ".location a", ".location"]));
static VENUE_META_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    base::selectors(&[r#"meta[property="business:contact_data:street_address"]"#])
});
static ADDRESS_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".address", ".place-address", ".venue-address"]));
static CRUMB_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".breadcrumbs a, .crumbs a").expect("relax crumb selector"));
static CATEGORY_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".category", ".rubric", ".tags a"]));
static PRICE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(".price, .prices, .ticket-price, .cost").expect("relax price selector")
});
static AGE_SELECTORS: Lazy<Vec<Selector>> =
    Lazy::new(|| base::selectors(&[".age-limit", ".age"]));
static DESCRIPTION_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    base::selectors(&[".description", ".event-description", "article", ".content"])
});

pub struct Relax;

fn list_urls() -> Result<Vec<Url>> {
    let root = Url::parse(BASE_URL)?;
    let mut urls = vec![root.clone(), root.join("minsk/")?];
    for section in SECTIONS {
        urls.push(root.join(&format!("minsk/{section}/"))?);
    }
    Ok(urls)
}

/// First breadcrumb that reads like a place name.
fn city_from_crumbs(document: &Html) -> Option<String> {
    document
        .select(&CRUMB_SELECTOR)
        .map(base::inner_text)
        .find(|text| {
            text.chars().count() > 2
                && text.chars().next().is_some_and(char::is_uppercase)
                && !NOT_A_CITY.contains(&text.to_lowercase().as_str())
        })
}

#[async_trait]
impl SourceAdapter for Relax {
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
        base::collect_links(&document, list_url, |url| url.as_str().contains("/event/"))
    }

    fn parse_detail(&self, url: &Url, html: &str) -> Option<EventDraft> {
        let document = Html::parse_document(html);
        let ld = structured::event_ld(&document).unwrap_or_default();

        let title = ld
            .name
            .clone()
            .or_else(|| base::select_first_text(&document, &TITLE_SELECTORS))
            .or_else(|| base::select_first_attr(&document, &OG_TITLE_SELECTORS, "content"));

        let (start_dt, end_dt) = base::date_window(
            ld.start_date.as_deref().and_then(parse_datetime),
            ld.end_date.as_deref().and_then(parse_datetime),
            base::parsed_dates(&document, &DATE_SELECTOR),
        );
        let start_dt = start_dt.or_else(|| {
            base::select_first_attr(&document, &META_TIME_SELECTORS, "content")
                .and_then(|value| parse_datetime(&value))
        });

        let venue_name = ld
            .location_name
            .clone()
            .or_else(|| base::select_first_text(&document, &VENUE_SELECTORS))
            .or_else(|| base::select_first_attr(&document, &VENUE_META_SELECTORS, "content"));
        let venue_address = ld
            .street_address
            .clone()
            .or_else(|| base::select_first_text(&document, &ADDRESS_SELECTORS));
        let city = ld.locality.clone().or_else(|| city_from_crumbs(&document));

        let price_text = base::all_texts(&document.root_element(), &PRICE_SELECTOR).join(" ");
        let price = base::parse_price_byn(&price_text);
        let age = base::select_first_text(&document, &AGE_SELECTORS)
            .and_then(|text| base::parse_age(&text));

        let (og_cover, images) = base::extract_meta(&document, url);
        let cover_url = ld
            .image
            .as_deref()
            .and_then(|image| base::absolute_url(url, image))
            .or(og_cover);
        let description = ld
            .description
            .clone()
            .or_else(|| base::select_first_text(&document, &DESCRIPTION_SELECTORS));

        Some(EventDraft {
            title,
            start_dt,
            end_dt,
            venue_name,
            venue_address,
            city,
            category: base::select_first_text(&document, &CATEGORY_SELECTORS),
            price_min_byn: price.min,
            price_max_byn: price.max,
            is_free: price.is_free,
            age,
            source_uid: ld.identifier,
            cover_url,
            description,
            images,
        })
    }

    /// Walks the fixed section feeds; there is no pagination. A feed that
    /// fails to load is skipped.
    async fn harvest(&self, ctx: &HarvestContext) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();
        let (mut attempted, mut loaded) = (0, 0);

        for list_url in list_urls()? {
            if ctx.limit_reached(events.len()) {
                break;
            }
            attempted += 1;
            let Some(fetched) = ctx.unless_cancelled(ctx.client.get_text(&list_url)).await else {
                tracing::info!(source = SOURCE_ID, "harvest cancelled");
                return Ok(events);
            };
            let html = match fetched {
                Ok(html) => {
                    loaded += 1;
                    html
                }
                Err(err) => {
                    tracing::warn!(source = SOURCE_ID, url = %list_url, error = %err, "skipping list page");
                    continue;
                }
            };
            let mut links = self.discover_links(&list_url, &html);
            links.retain(|link| seen.insert(link.to_string()));
            let remaining = ctx.settings.limit.saturating_sub(events.len());
            events.extend(crawl::collect_details(self, ctx, links, remaining).await);
        }

        if attempted > 0 && loaded == 0 && !ctx.cancel.is_cancelled() {
            bail!("none of the {attempted} relax list pages could be loaded");
        }
        Ok(events)
    }
}

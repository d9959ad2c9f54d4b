use chrono::{
    DateTime, Datelike, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Zone assumed for timestamps that carry no explicit offset.
pub const TIMEZONE: Tz = chrono_tz::Europe::Minsk;

const FREE_MARKERS_RE: &str = r"(?i)(бесплатно|\bfree\b|(?:^|[^\d.,])0\s*(?:byn|руб))";
const SKIPPED_IMAGE_PATTERNS: [&str; 5] = ["ajax-loader", "mc.yandex.ru", "counter", "pixel", "1x1"];

static ISO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2})(?::(\d{2}))?(?:\.\d+)?)?\s*(Z|[+-]\d{2}:?\d{2})?$",
    )
    .expect("valid iso regex")
});
static ISO_DATE_IN_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("valid iso date regex"));
static NUMERIC_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})[./-](\d{1,2})[./-](\d{4}|\d{2})\b").expect("valid numeric date regex")
});
static DAY_MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})\s+(\p{L}{3,})\.?,?(?:\s+(\d{4}))?").expect("valid named date regex")
});
static MONTH_DAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\p{L}{3,})\.?\s+(\d{1,2}),?\s+(\d{4})\b").expect("valid month-first regex")
});
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2}):(\d{2})(?::(\d{2}))?\b").expect("valid time regex"));
static FREE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(FREE_MARKERS_RE).expect("valid free regex"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+[.,]?\d*").expect("valid number regex"));
static AGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\+)").expect("valid age regex"));

static OG_IMAGE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:image"]"#).expect("og:image selector"));
static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("img selector"));
static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("anchor selector"));
static NEXT_PAGE_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"a[rel="next"], .pagination a.next, a[aria-label="Next"]"#)
        .expect("next page selector")
});

pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Like [`clean_text`] but maps blank input to `None`.
pub fn clean_opt(input: Option<&str>) -> Option<String> {
    let cleaned = clean_text(input?);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn inner_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

pub fn all_texts(element: &ElementRef<'_>, selector: &Selector) -> Vec<String> {
    element.select(selector).map(inner_text).collect()
}

/// Parses an ordered list of candidate selectors, skipping any that fail.
pub fn selectors(raw: &[&str]) -> Vec<Selector> {
    raw.iter()
        .filter_map(|css| match Selector::parse(css) {
            Ok(selector) => Some(selector),
            Err(err) => {
                tracing::error!(css, error = ?err, "invalid selector");
                None
            }
        })
        .collect()
}

/// Text of the first element matched by the earliest candidate that matches
/// anything non-blank. Candidate order wins over document order.
pub fn select_first_text(document: &Html, candidates: &[Selector]) -> Option<String> {
    candidates.iter().find_map(|selector| {
        document
            .select(selector)
            .map(inner_text)
            .find(|text| !text.is_empty())
    })
}

pub fn select_first_attr(document: &Html, candidates: &[Selector], attr: &str) -> Option<String> {
    candidates.iter().find_map(|selector| {
        document
            .select(selector)
            .filter_map(|el| el.value().attr(attr))
            .find_map(|value| clean_opt(Some(value)))
    })
}

pub fn absolute_url(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Resolves every `a[href]` in the document against `base`, keeping those
/// `keep` accepts, deduplicated in first-seen order.
pub fn collect_links<F>(document: &Html, base: &Url, keep: F) -> Vec<Url>
where
    F: Fn(&Url) -> bool,
{
    unique_links(
        document
            .select(&ANCHOR_SELECTOR)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| absolute_url(base, href))
            .filter(|url| keep(url)),
    )
}

pub fn unique_links<I>(links: I) -> Vec<Url>
where
    I: IntoIterator<Item = Url>,
{
    let mut seen = std::collections::HashSet::new();
    links
        .into_iter()
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect()
}

pub fn next_page_link(document: &Html, current: &Url) -> Option<Url> {
    document
        .select(&NEXT_PAGE_SELECTOR)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| absolute_url(current, href))
}

/// Every `<loc>` entry of a sitemap or sitemap index, in document order.
pub fn sitemap_locations(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    while let Some(open_idx) = xml[start..].find("<loc>") {
        let open = start + open_idx + "<loc>".len();
        let Some(close_idx) = xml[open..].find("</loc>") else {
            break;
        };
        let close = open + close_idx;
        let loc = xml[open..close]
            .trim()
            .trim_start_matches("<![CDATA[")
            .trim_end_matches("]]>")
            .replace("&amp;", "&");
        if !loc.is_empty() {
            out.push(loc);
        }
        start = close + "</loc>".len();
    }
    out
}

/// Parses free-form date/time text, reading ambiguous numeric dates day-first.
///
/// Accepts ISO-8601 (with or without offset), `dd.mm.yyyy`, `dd/mm/yy` and
/// `3 апреля 2025`-style dates with an optional `HH:MM` anywhere in the text.
/// Values without an offset are placed in [`TIMEZONE`]. Returns `None` on any
/// failure.
pub fn parse_datetime(text: &str) -> Option<DateTime<FixedOffset>> {
    let cleaned = clean_text(text);
    if cleaned.is_empty() {
        return None;
    }

    if let Some(parsed) = parse_iso(&cleaned) {
        return Some(parsed);
    }

    let date = parse_naive_date(&cleaned)?;
    let time = parse_time(&cleaned).unwrap_or(NaiveTime::MIN);
    localize(NaiveDateTime::new(date, time))
}

fn parse_iso(text: &str) -> Option<DateTime<FixedOffset>> {
    let caps = ISO_RE.captures(text)?;
    let number = |idx: usize| -> Option<u32> {
        caps.get(idx)
            .map(|m| m.as_str().parse().ok())
            .unwrap_or(Some(0))
    };
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, number(2)?, number(3)?)?;
    let time = NaiveTime::from_hms_opt(number(4)?, number(5)?, number(6)?)?;
    let naive = NaiveDateTime::new(date, time);

    match caps.get(7).map(|m| m.as_str()) {
        None => localize(naive),
        Some("Z") => Some(Utc.from_utc_datetime(&naive).fixed_offset()),
        Some(raw) => {
            let offset = parse_offset(raw)?;
            offset.from_local_datetime(&naive).single()
        }
    }
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let sign = if raw.starts_with('-') { -1 } else { 1 };
    let digits: String = raw[1..].chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 4 {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_naive_date(text: &str) -> Option<NaiveDate> {
    if let Some(caps) = ISO_DATE_IN_TEXT_RE.captures(text) {
        let year = caps[1].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, caps[2].parse().ok()?, caps[3].parse().ok()?);
    }

    if let Some(caps) = NUMERIC_DATE_RE.captures(text) {
        let day = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let mut year: i32 = caps[3].parse().ok()?;
        if caps[3].len() == 2 {
            year += 2000;
        }
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    for caps in DAY_MONTH_RE.captures_iter(text) {
        let Some(month) = month_from_name(&caps[2]) else {
            continue;
        };
        let day = caps[1].parse().ok()?;
        return match caps.get(3) {
            Some(year) => NaiveDate::from_ymd_opt(year.as_str().parse().ok()?, month, day),
            None => upcoming_date(month, day),
        };
    }

    for caps in MONTH_DAY_RE.captures_iter(text) {
        let Some(month) = month_from_name(&caps[1]) else {
            continue;
        };
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[2].parse().ok()?);
    }

    None
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    TIME_RE.captures_iter(text).find_map(|caps| {
        let hour = caps[1].parse().ok()?;
        let minute = caps[2].parse().ok()?;
        let second = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        NaiveTime::from_hms_opt(hour, minute, second)
    })
}

fn month_from_name(name: &str) -> Option<u32> {
    const PREFIXES: [(&str, u32); 25] = [
        ("янв", 1),
        ("фев", 2),
        ("мар", 3),
        ("апр", 4),
        ("мая", 5),
        ("май", 5),
        ("июн", 6),
        ("июл", 7),
        ("авг", 8),
        ("сен", 9),
        ("окт", 10),
        ("ноя", 11),
        ("дек", 12),
        ("jan", 1),
        ("feb", 2),
        ("mar", 3),
        ("apr", 4),
        ("may", 5),
        ("jun", 6),
        ("jul", 7),
        ("aug", 8),
        ("sep", 9),
        ("oct", 10),
        ("nov", 11),
        ("dec", 12),
    ];
    let lower = name.to_lowercase();
    PREFIXES
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map(|(_, month)| *month)
}

/// Year-less listing dates refer to the next occurrence of that day.
fn upcoming_date(month: u32, day: u32) -> Option<NaiveDate> {
    let today = Utc::now().with_timezone(&TIMEZONE).date_naive();
    let date = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if date < today {
        return date.with_year(today.year() + 1);
    }
    Some(date)
}

fn localize(naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    match TIMEZONE.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.fixed_offset()),
        LocalResult::Ambiguous(dt, _) => Some(dt.fixed_offset()),
        LocalResult::None => None,
    }
}

/// Every parseable date among the elements matched by `selector`, in document order.
pub fn parsed_dates(document: &Html, selector: &Selector) -> Vec<DateTime<FixedOffset>> {
    document
        .select(selector)
        .filter_map(|node| parse_datetime(&inner_text(node)))
        .collect()
}

/// Start and end of an event from structured values first, then the dates
/// found in markup. Markup dates fill whichever slot is still empty, start
/// before end. An end earlier than the start is dropped.
pub fn date_window(
    start: Option<DateTime<FixedOffset>>,
    end: Option<DateTime<FixedOffset>>,
    markup: Vec<DateTime<FixedOffset>>,
) -> (Option<DateTime<FixedOffset>>, Option<DateTime<FixedOffset>>) {
    let (mut start, mut end) = (start, end);
    for value in markup {
        if start.is_none() {
            start = Some(value);
        } else if end.is_none() {
            end = Some(value);
        } else {
            break;
        }
    }
    let end = match (start, end) {
        (Some(s), Some(e)) if e < s => None,
        (_, e) => e,
    };
    (start, end)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub is_free: Option<bool>,
}

pub fn parse_price_byn(text: &str) -> PriceRange {
    let lower = text.to_lowercase();
    if lower.trim().is_empty() {
        return PriceRange::default();
    }
    if FREE_RE.is_match(&lower) {
        return PriceRange {
            min: Some(0.0),
            max: Some(0.0),
            is_free: Some(true),
        };
    }

    let numbers: Vec<f64> = NUMBER_RE
        .find_iter(&lower)
        .filter_map(|m| {
            m.as_str()
                .replace(',', ".")
                .trim_end_matches('.')
                .parse::<f64>()
                .ok()
        })
        .collect();

    if numbers.is_empty() {
        return PriceRange::default();
    }
    let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
    let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    PriceRange {
        min: Some(min),
        max: Some(max),
        is_free: Some(false),
    }
}

pub fn parse_age(text: &str) -> Option<String> {
    AGE_RE.captures(text).map(|caps| caps[1].to_string())
}

/// Social-preview cover plus every content image on the page, in document
/// order, with tracking pixels and loader gifs dropped.
pub fn extract_meta(document: &Html, page_url: &Url) -> (Option<Url>, Vec<Url>) {
    let cover = document
        .select(&OG_IMAGE_SELECTOR)
        .next()
        .and_then(|meta| meta.value().attr("content"))
        .and_then(|content| absolute_url(page_url, content));

    let images = document
        .select(&IMG_SELECTOR)
        .filter_map(|img| {
            let value = img.value();
            value
                .attr("src")
                .filter(|src| !src.trim().is_empty())
                .or_else(|| value.attr("data-src"))
        })
        .filter(|src| {
            let low = src.to_lowercase();
            !SKIPPED_IMAGE_PATTERNS.iter().any(|p| low.contains(p))
        })
        .filter_map(|src| absolute_url(page_url, src))
        .collect();

    (cover, images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn candidate_order_beats_document_order() {
        let html = Html::parse_document(
            r#"<div class="place">Зал</div><h1>  </h1><h1 class="title">Концерт</h1>
               <meta property="og:title" content=" Концерт | Relax ">"#,
        );
        let candidates = [
            Selector::parse("h1").unwrap(),
            Selector::parse(".place").unwrap(),
        ];
        assert_eq!(select_first_text(&html, &candidates).as_deref(), Some("Концерт"));
        let meta = [Selector::parse(r#"meta[property="og:title"]"#).unwrap()];
        assert_eq!(
            select_first_attr(&html, &meta, "content").as_deref(),
            Some("Концерт | Relax")
        );
        assert_eq!(select_first_text(&html, &[Selector::parse("time").unwrap()]), None);
    }

    #[test]
    fn date_window_prefers_structured_then_markup() {
        let html = Html::parse_document(
            r#"<time>завтра</time><span class="date">03.04.2025 19:00</span>
               <span class="date">05.04.2025 21:00</span>"#,
        );
        let markup = parsed_dates(&html, &Selector::parse("time, .date").unwrap());
        assert_eq!(markup.len(), 2);

        let (start, end) = date_window(None, None, markup.clone());
        assert_eq!(start.map(|d| d.day()), Some(3));
        assert_eq!(end.map(|d| d.day()), Some(5));

        let structured = parse_datetime("2025-04-04T18:00:00+03:00");
        let (start, end) = date_window(structured, None, markup.clone());
        assert_eq!(start, structured);
        // 03.04 is before the structured start, so it cannot be the end.
        assert_eq!(end, None);

        let (start, end) = date_window(None, None, Vec::new());
        assert_eq!((start, end), (None, None));
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  Джаз \n\t в   филармонии "), "Джаз в филармонии");
        assert_eq!(clean_opt(Some(" \n ")), None);
        assert_eq!(clean_opt(None), None);
    }

    #[test]
    fn numeric_dates_are_day_first() {
        let dt = parse_datetime("02.03.2025 19:00").expect("parses");
        assert_eq!((dt.day(), dt.month(), dt.year()), (2, 3, 2025));
        assert_eq!((dt.hour(), dt.minute()), (19, 0));
        assert_eq!(dt.offset().local_minus_utc(), 3 * 3600);

        let dt = parse_datetime("03/04/25").expect("parses");
        assert_eq!((dt.day(), dt.month(), dt.year()), (3, 4, 2025));
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn iso_timestamps_keep_their_offset() {
        let dt = parse_datetime("2025-04-03T19:30:00+02:00").expect("parses");
        assert_eq!(dt.to_rfc3339(), "2025-04-03T19:30:00+02:00");

        let dt = parse_datetime("2025-04-03T19:30").expect("parses");
        assert_eq!(dt.to_rfc3339(), "2025-04-03T19:30:00+03:00");

        let dt = parse_datetime("2025-04-03T16:30:00Z").expect("parses");
        assert_eq!(dt.offset().local_minus_utc(), 0);
        assert_eq!(dt.hour(), 16);
    }

    #[test]
    fn russian_month_names_are_understood() {
        let dt = parse_datetime("Пт, 3 апреля 2025 в 19:00").expect("parses");
        assert_eq!((dt.day(), dt.month(), dt.year()), (3, 4, 2025));
        assert_eq!(dt.hour(), 19);

        let dt = parse_datetime("12 мая").expect("year-less date parses");
        assert_eq!((dt.day(), dt.month()), (12, 5));
    }

    #[test]
    fn unparseable_dates_are_absent() {
        assert_eq!(parse_datetime(""), None);
        assert_eq!(parse_datetime("скоро"), None);
        assert_eq!(parse_datetime("31.02.2025"), None);
    }

    #[test]
    fn free_markers_win() {
        for text in ["Вход бесплатно", "FREE entry", "0 BYN", "0 руб.", "цена: 0руб"] {
            let price = parse_price_byn(text);
            assert_eq!(
                price,
                PriceRange {
                    min: Some(0.0),
                    max: Some(0.0),
                    is_free: Some(true)
                },
                "{text}"
            );
        }
    }

    #[test]
    fn single_price_token() {
        let price = parse_price_byn("10 руб");
        assert_eq!(price.min, Some(10.0));
        assert_eq!(price.max, Some(10.0));
        assert_eq!(price.is_free, Some(false));

        assert_eq!(parse_price_byn("25,50 BYN").min, Some(25.5));
    }

    #[test]
    fn price_range_ignores_token_order() {
        let forward = parse_price_byn("от 25 до 60 BYN");
        let backward = parse_price_byn("60 / 40,5 / 25 руб.");
        assert_eq!((forward.min, forward.max), (Some(25.0), Some(60.0)));
        assert_eq!((backward.min, backward.max), (Some(25.0), Some(60.0)));
        assert_eq!(backward.is_free, Some(false));
    }

    #[test]
    fn price_without_numbers_is_absent() {
        assert_eq!(parse_price_byn("уточняйте у организатора"), PriceRange::default());
        assert_eq!(parse_price_byn(""), PriceRange::default());
    }

    #[test]
    fn age_restriction() {
        assert_eq!(parse_age("Возраст: 16+").as_deref(), Some("16+"));
        assert_eq!(parse_age("6+ / 12+").as_deref(), Some("6+"));
        assert_eq!(parse_age("для всех"), None);
    }

    #[test]
    fn meta_skips_pixels_and_keeps_order() {
        let html = Html::parse_document(
            r#"<html><head><meta property="og:image" content=" https://img.relax.by/cover.jpg "></head>
            <body>
              <img src="/media/a.jpg">
              <img src="/img/ajax-loader.gif">
              <img src="https://mc.yandex.ru/watch/123">
              <img data-src="/media/b.jpg">
              <img src="/media/a.jpg">
              <img src="/px/1x1.gif">
            </body></html>"#,
        );
        let page = Url::parse("https://afisha.relax.by/event/1/").unwrap();
        let (cover, images) = extract_meta(&html, &page);
        assert_eq!(cover.unwrap().as_str(), "https://img.relax.by/cover.jpg");
        let images: Vec<&str> = images.iter().map(Url::as_str).collect();
        assert_eq!(
            images,
            vec![
                "https://afisha.relax.by/media/a.jpg",
                "https://afisha.relax.by/media/b.jpg",
                "https://afisha.relax.by/media/a.jpg",
            ]
        );
    }

    #[test]
    fn links_are_resolved_and_deduplicated() {
        let html = Html::parse_document(
            r##"<a href="/event/1/">one</a><a href="https://afisha.relax.by/event/1/">again</a>
               <a href="/news/2/">news</a><a href="/event/3/">three</a><a href="#top">top</a>"##,
        );
        let base = Url::parse("https://afisha.relax.by/").unwrap();
        let links = collect_links(&html, &base, |u| u.path().contains("/event/"));
        let links: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(
            links,
            vec![
                "https://afisha.relax.by/event/1/",
                "https://afisha.relax.by/event/3/"
            ]
        );
    }

    #[test]
    fn next_page_and_sitemap() {
        let html = Html::parse_document(
            r#"<div class="pagination"><a class="next" href="?page=2">»</a></div>"#,
        );
        let current = Url::parse("https://minsktourism.by/afisha/").unwrap();
        assert_eq!(
            next_page_link(&html, &current).unwrap().as_str(),
            "https://minsktourism.by/afisha/?page=2"
        );

        let xml = "<urlset><url><loc> https://www.ticketpro.by/ru/Events/1/ </loc></url>\
                   <url><loc><![CDATA[https://www.ticketpro.by/a?x=1&amp;y=2]]></loc></url></urlset>";
        assert_eq!(
            sitemap_locations(xml),
            vec![
                "https://www.ticketpro.by/ru/Events/1/".to_string(),
                "https://www.ticketpro.by/a?x=1&y=2".to_string()
            ]
        );
    }
}

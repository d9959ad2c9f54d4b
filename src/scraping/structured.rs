//! schema.org `Event` blocks embedded as `application/ld+json`.

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

use super::base::clean_opt;

/// Substring whose presence suggests a page carries structured data.
pub const LD_JSON_MARKER: &str = "application/ld+json";

static LD_JSON_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("ld+json selector")
});

/// Raw values from the page's Event blocks; unparsed and uncleaned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLd {
    pub name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub location_name: Option<String>,
    pub street_address: Option<String>,
    pub locality: Option<String>,
    pub identifier: Option<String>,
}

impl EventLd {
    /// Fills fields still missing here from `other`.
    fn absorb(&mut self, other: EventLd) {
        fn fill(slot: &mut Option<String>, value: Option<String>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.name, other.name);
        fill(&mut self.start_date, other.start_date);
        fill(&mut self.end_date, other.end_date);
        fill(&mut self.description, other.description);
        fill(&mut self.image, other.image);
        fill(&mut self.location_name, other.location_name);
        fill(&mut self.street_address, other.street_address);
        fill(&mut self.locality, other.locality);
        fill(&mut self.identifier, other.identifier);
    }
}

/// Merges every Event-typed block on the page, earlier blocks taking
/// precedence per field. Malformed blocks are skipped.
pub fn event_ld(document: &Html) -> Option<EventLd> {
    let mut merged: Option<EventLd> = None;
    for script in document.select(&LD_JSON_SELECTOR) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<Value>(raw.trim()) else {
            tracing::debug!("skipping malformed ld+json block");
            continue;
        };
        let mut nodes = Vec::new();
        flatten(&value, &mut nodes);
        for node in nodes.into_iter().filter(|n| is_event(n)) {
            let parsed = from_node(node);
            match merged.as_mut() {
                Some(existing) => existing.absorb(parsed),
                None => merged = Some(parsed),
            }
        }
    }
    merged
}

fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                flatten(graph, out);
            }
            out.push(value);
        }
        _ => {}
    }
}

/// `Event` itself or a schema.org subtype such as `MusicEvent`.
fn is_event(node: &Value) -> bool {
    let matches = |t: &str| t == "Event" || (t.ends_with("Event") && t.len() > "Event".len());
    match node.get("@type") {
        Some(Value::String(t)) => matches(t.as_str()),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).any(matches),
        _ => false,
    }
}

fn from_node(node: &Value) -> EventLd {
    let location = match node.get("location") {
        Some(Value::Array(items)) => items.first(),
        other => other,
    };
    let (location_name, street_address, locality) = match location {
        Some(Value::Object(loc)) => {
            let name = loc.get("name").and_then(scalar);
            match loc.get("address") {
                Some(Value::Object(addr)) => (
                    name,
                    addr.get("streetAddress").and_then(scalar),
                    addr.get("addressLocality").and_then(scalar),
                ),
                Some(other) => (name, scalar(other), None),
                None => (name, None, None),
            }
        }
        Some(Value::String(place)) => (clean_opt(Some(place.as_str())), None, None),
        _ => (None, None, None),
    };

    EventLd {
        name: node.get("name").and_then(scalar),
        start_date: node.get("startDate").and_then(scalar),
        end_date: node.get("endDate").and_then(scalar),
        description: node.get("description").and_then(scalar),
        image: node.get("image").and_then(image_url),
        location_name,
        street_address,
        locality,
        identifier: node.get("identifier").and_then(scalar),
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => clean_opt(Some(s.as_str())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn image_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => clean_opt(Some(s.as_str())),
        Value::Array(items) => items.iter().find_map(image_url),
        Value::Object(map) => map.get("url").and_then(image_url),
        _ => None,
    }
}

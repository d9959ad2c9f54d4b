use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const UNKNOWN_VENUE: &str = "Unknown";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Venue {
    pub name: String,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Venue {
    pub fn set_coordinates(&mut self, coords: Option<(f64, f64)>) {
        match coords {
            Some((lat, lon)) => {
                self.lat = Some(lat);
                self.lon = Some(lon);
            }
            None => {
                self.lat = None;
                self.lon = None;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub title: String,
    pub start_dt: DateTime<FixedOffset>,
    pub end_dt: Option<DateTime<FixedOffset>>,
    pub venue: Venue,
    pub city: Option<String>,
    pub category: Option<String>,
    pub price_min_byn: Option<f64>,
    pub price_max_byn: Option<f64>,
    pub is_free: Option<bool>,
    pub age: Option<String>, // "N+"
    pub link: Url,
    pub source: String,
    pub source_uid: Option<String>,
    pub cover_url: Option<Url>,
    pub description: Option<String>,
    pub images: Option<Vec<Url>>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ModelError {
    #[error("event has no title")]
    MissingTitle,
    #[error("event has no start date")]
    MissingStart,
}

/// Fields an adapter has resolved for one detail page.
///
/// Everything is optional here; [`EventDraft::build`] is the only way to turn a
/// draft into an [`Event`] and refuses drafts without a title or start date.
#[derive(Clone, Debug, Default)]
pub struct EventDraft {
    pub title: Option<String>,
    pub start_dt: Option<DateTime<FixedOffset>>,
    pub end_dt: Option<DateTime<FixedOffset>>,
    pub venue_name: Option<String>,
    pub venue_address: Option<String>,
    pub city: Option<String>,
    pub category: Option<String>,
    pub price_min_byn: Option<f64>,
    pub price_max_byn: Option<f64>,
    pub is_free: Option<bool>,
    pub age: Option<String>,
    pub source_uid: Option<String>,
    pub cover_url: Option<Url>,
    pub description: Option<String>,
    pub images: Vec<Url>,
}

impl EventDraft {
    /// Address (or venue name when the address is missing) and city handed to the geocoder.
    pub fn geocode_query(&self) -> (Option<String>, Option<String>) {
        let place = self
            .venue_address
            .clone()
            .or_else(|| self.venue_name.clone());
        (place, self.city.clone())
    }

    pub fn build(self, source: &str, link: Url) -> Result<Event, ModelError> {
        let title = self
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or(ModelError::MissingTitle)?;
        let start_dt = self.start_dt.ok_or(ModelError::MissingStart)?;

        let name = self
            .venue_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNKNOWN_VENUE.to_string());

        Ok(Event {
            title,
            start_dt,
            end_dt: self.end_dt,
            venue: Venue {
                name,
                address: self.venue_address,
                lat: None,
                lon: None,
            },
            city: self.city,
            category: self.category,
            price_min_byn: self.price_min_byn,
            price_max_byn: self.price_max_byn,
            is_free: self.is_free,
            age: self.age,
            link,
            source: source.to_string(),
            source_uid: self.source_uid,
            cover_url: self.cover_url,
            description: self.description,
            images: if self.images.is_empty() {
                None
            } else {
                Some(self.images)
            },
            fetched_at: Utc::now(),
        })
    }
}

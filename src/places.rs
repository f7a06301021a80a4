//! Places search API client and record normalization.
//!
//! The crawler issues one bounded nearby-search request per cell. The client
//! sits behind a trait so the run loop can be exercised without a network.

use crate::error::{CrawlError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const PLACES_SEARCH_URL: &str = "https://places.googleapis.com/v1/places:searchNearby";

const FIELD_MASK: &str = "places.id,places.displayName,places.location,places.priceLevel,places.businessStatus,places.formattedAddress";

/// One page of nearby-search results is capped at this many records.
pub const MAX_RESULTS_PER_CALL: u32 = 20;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisplayName {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatLng {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// A place record as returned on the wire, every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlace {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<DisplayName>,
    #[serde(default)]
    pub location: Option<LatLng>,
    /// The API is not consistent here; only integer values are kept.
    #[serde(default)]
    pub price_level: Option<serde_json::Value>,
    #[serde(default)]
    pub business_status: Option<String>,
    #[serde(default)]
    pub formatted_address: Option<String>,
}

/// A validated place ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRecord {
    pub place_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub price_level: Option<i64>,
    pub business_status: String,
}

/// Validate a raw record. A missing identifier or missing coordinates drops
/// that single record, never the whole call.
pub fn normalize_place(raw: &RawPlace) -> Option<PlaceRecord> {
    let place_id = match raw.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            debug!("Dropping place record without id");
            return None;
        }
    };

    let location = raw.location.as_ref();
    let (latitude, longitude) = match (
        location.and_then(|l| l.latitude),
        location.and_then(|l| l.longitude),
    ) {
        (Some(lat), Some(lng)) => (lat, lng),
        _ => {
            debug!("Dropping place record {} without coordinates", place_id);
            return None;
        }
    };

    let name = raw
        .display_name
        .as_ref()
        .and_then(|d| d.text.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Unnamed")
        .to_string();

    Some(PlaceRecord {
        place_id,
        name,
        latitude,
        longitude,
        address: raw.formatted_address.clone().unwrap_or_default(),
        price_level: raw.price_level.as_ref().and_then(|v| v.as_i64()),
        business_status: raw
            .business_status
            .clone()
            .unwrap_or_else(|| "OPERATIONAL".to_string()),
    })
}

/// Character-boundary-safe cut; `String::truncate` panics when the byte
/// offset lands inside a multibyte character.
fn truncate_chars(message: &str, max_chars: usize) -> String {
    message.chars().take(max_chars).collect()
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub places: Vec<RawPlace>,
    pub http_status: u16,
}

#[derive(Debug, Default, Deserialize)]
struct NearbyResponseBody {
    #[serde(default)]
    places: Vec<RawPlace>,
}

/// One bounded circular-region search per call.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search_nearby(&self, lat: f64, lng: f64, radius_m: f64) -> Result<SearchResponse>;
}

pub struct GooglePlacesClient {
    client: reqwest::Client,
    api_key: String,
    included_type: String,
}

impl GooglePlacesClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            included_type: "restaurant".to_string(),
        })
    }
}

#[async_trait]
impl SearchClient for GooglePlacesClient {
    async fn search_nearby(&self, lat: f64, lng: f64, radius_m: f64) -> Result<SearchResponse> {
        let payload = serde_json::json!({
            "locationRestriction": {
                "circle": {
                    "center": {"latitude": lat, "longitude": lng},
                    "radius": radius_m,
                }
            },
            "includedPrimaryTypes": [self.included_type],
            "maxResultCount": MAX_RESULTS_PER_CALL,
        });

        let response = self
            .client
            .post(PLACES_SEARCH_URL)
            .header("Content-Type", "application/json")
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&payload)
            .send()
            .await?;

        let http_status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrawlError::Search {
                status: http_status,
                message: truncate_chars(&body, 500),
            });
        }

        let body: NearbyResponseBody = response.json().await?;
        Ok(SearchResponse {
            places: body.places,
            http_status,
        })
    }
}

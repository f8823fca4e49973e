use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::GeocoderConfig;
use crate::jobs::BoundingBox;

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("Geocoding request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Geocoder returned HTTP {0}")]
    Status(u16),

    #[error("No boundary found for OSM relation {0}")]
    NotFound(i64),

    #[error("Unreadable geocoder response: {0}")]
    Parse(String),
}

/// Resolves an administrative boundary to the rectangle that encloses it.
pub trait Geocoder: Send + Sync {
    fn bounding_box(&self, osm_id: i64) -> Result<BoundingBox, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct LookupPlace {
    /// `[min_lat, max_lat, min_lon, max_lon]` as decimal strings.
    boundingbox: Vec<String>,
}

fn parse_lookup(osm_id: i64, body: &str) -> Result<BoundingBox, GeocodeError> {
    let places: Vec<LookupPlace> =
        serde_json::from_str(body).map_err(|e| GeocodeError::Parse(e.to_string()))?;
    let place = places.into_iter().next().ok_or(GeocodeError::NotFound(osm_id))?;

    let coords = place
        .boundingbox
        .iter()
        .map(|v| v.parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GeocodeError::Parse(format!("bad coordinate: {}", e)))?;
    let &[min_lat, max_lat, min_lon, max_lon] = &coords[..] else {
        return Err(GeocodeError::Parse(format!(
            "expected 4 coordinates, got {}",
            coords.len()
        )));
    };

    Ok(BoundingBox {
        lat_upper_left: max_lat,
        lon_upper_left: min_lon,
        lat_bottom_right: min_lat,
        lon_bottom_right: max_lon,
    })
}

/// Looks up OSM relations through a Nominatim `/lookup` endpoint.
pub struct NominatimGeocoder {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GeocodeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mapsched/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &GeocoderConfig) -> Result<Self, GeocodeError> {
        Self::new(
            config.base_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

impl Geocoder for NominatimGeocoder {
    fn bounding_box(&self, osm_id: i64) -> Result<BoundingBox, GeocodeError> {
        let url = format!("{}/lookup", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("osm_ids", format!("R{}", osm_id)), ("format", "json".to_string())])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }

        parse_lookup(osm_id, &response.text()?)
    }
}

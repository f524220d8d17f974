use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_USER_AGENT: &str = "streetlabel";

const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityCountry {
    pub city: String,
    pub country: String,
}

#[derive(Deserialize)]
struct Place {
    display_name: Option<String>,
    #[serde(default)]
    address: Option<PlaceAddress>,
}

#[derive(Deserialize)]
struct PlaceAddress {
    country: Option<String>,
}

/// City and country of every place in a Nominatim search response
pub fn parse_places(body: &str) -> Result<Vec<CityCountry>> {
    let places: Vec<Place> =
        serde_json::from_str(body).context("Failed to parse Nominatim response")?;

    Ok(places
        .into_iter()
        .map(|place| {
            let city = place
                .display_name
                .as_deref()
                .and_then(|name| name.split(',').next())
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string());
            let country = place
                .address
                .and_then(|a| a.country)
                .unwrap_or_else(|| NOT_AVAILABLE.to_string());
            CityCountry { city, country }
        })
        .collect())
}

/// Place lookup through the Nominatim search API
pub struct NominatimClient {
    client: Client,
    base_url: String,
}

impl NominatimClient {
    /// Nominatim rejects requests without an identifying User-Agent
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(NominatimClient {
            client,
            base_url: NOMINATIM_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn search(&self, query: &str) -> Result<Vec<CityCountry>> {
        debug!("Nominatim search: {}", query);
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json"), ("addressdetails", "1")])
            .send()
            .context("Failed to send request to Nominatim")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Nominatim returned error {}: {}", status, body);
        }

        let body = response
            .text()
            .context("Failed to read Nominatim response")?;
        parse_places(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_places() {
        let body = r#"[
            {"display_name": "Paris, Ile-de-France, France", "address": {"country": "France"}},
            {"display_name": " Paris , Lamar County, Texas", "address": {}},
            {"address": {"country": "Canada"}}
        ]"#;
        let places = parse_places(body).unwrap();
        assert_eq!(
            places,
            vec![
                CityCountry {
                    city: "Paris".to_string(),
                    country: "France".to_string()
                },
                CityCountry {
                    city: "Paris".to_string(),
                    country: "N/A".to_string()
                },
                CityCountry {
                    city: "N/A".to_string(),
                    country: "Canada".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_places_empty_and_invalid() {
        assert!(parse_places("[]").unwrap().is_empty());
        assert!(parse_places("{\"error\": 1}").is_err());
    }
}

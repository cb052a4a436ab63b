//! Geocoding and routing collaborators.
//!
//! Both services are external; the core only depends on the [`Geocoder`] and
//! [`Router`] traits. HTTP implementations for Nominatim and OSRM are
//! available with the `http` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LookupError;
use crate::location::Coordinates;

/// Route context between the participant and the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub distance_km: f64,
    pub duration_min: f64,
    /// First instruction of the route, "Arrived" when there is none.
    pub next_instruction: String,
}

/// Text to coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` means the service answered but knows no such place.
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, LookupError>;
}

/// Two coordinates to a route summary.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, from: Coordinates, to: Coordinates) -> Result<RouteSummary, LookupError>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// Parse a Nominatim `format=json` search response, taking the first hit.
pub fn parse_geocode_response(body: &str) -> Result<Option<Coordinates>, LookupError> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).map_err(|e| LookupError::Decode {
            service: "geocoder",
            details: e.to_string(),
        })?;

    let Some(first) = places.first() else {
        return Ok(None);
    };

    let lat = first.lat.trim().parse::<f64>();
    let lng = first.lon.trim().parse::<f64>();
    match (lat, lng) {
        (Ok(lat), Ok(lng)) => Ok(Some(Coordinates::new(lat, lng))),
        _ => Err(LookupError::Decode {
            service: "geocoder",
            details: format!("non-numeric coordinates '{}', '{}'", first.lat, first.lon),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    /// metres
    distance: f64,
    /// seconds
    duration: f64,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
struct OsrmLeg {
    #[serde(default)]
    steps: Vec<OsrmStep>,
}

#[derive(Debug, Deserialize)]
struct OsrmStep {
    #[serde(default)]
    name: String,
    maneuver: OsrmManeuver,
}

#[derive(Debug, Deserialize)]
struct OsrmManeuver {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    modifier: Option<String>,
}

fn describe_step(step: &OsrmStep) -> String {
    let mut text = match step.maneuver.kind.as_str() {
        "depart" => "Head out".to_string(),
        "arrive" => return "Arrived".to_string(),
        "turn" | "end of road" | "fork" => match &step.maneuver.modifier {
            Some(modifier) => format!("Turn {}", modifier),
            None => "Turn".to_string(),
        },
        "roundabout" | "rotary" => "Enter the roundabout".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect(),
                None => "Continue".to_string(),
            }
        }
    };
    if !step.name.is_empty() {
        text.push_str(" onto ");
        text.push_str(&step.name);
    }
    text
}

/// Parse an OSRM `route/v1` response into a summary of the first route.
pub fn parse_route_response(body: &str) -> Result<RouteSummary, LookupError> {
    let response: OsrmResponse = serde_json::from_str(body).map_err(|e| LookupError::Decode {
        service: "router",
        details: e.to_string(),
    })?;

    if response.code != "Ok" {
        return Err(LookupError::NoRoute);
    }
    let route = response.routes.first().ok_or(LookupError::NoRoute)?;

    let next_instruction = route
        .legs
        .iter()
        .flat_map(|leg| leg.steps.iter())
        .next()
        .map(describe_step)
        .unwrap_or_else(|| "Arrived".to_string());

    Ok(RouteSummary {
        distance_km: route.distance / 1000.0,
        duration_min: route.duration / 60.0,
        next_instruction,
    })
}

#[cfg(feature = "http")]
pub use http::{NominatimGeocoder, OsrmRouter, http_client};

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::debug;

    use super::{Geocoder, RouteSummary, Router, parse_geocode_response, parse_route_response};
    use crate::config::ServicesConfig;
    use crate::error::LookupError;
    use crate::location::Coordinates;

    pub fn http_client(timeout: Duration) -> Result<reqwest::Client, LookupError> {
        reqwest::Client::builder()
            .user_agent(concat!("aether/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|cause| LookupError::Http {
                service: "client",
                cause,
            })
    }

    /// Forward geocoding against a Nominatim search endpoint.
    #[derive(Debug, Clone)]
    pub struct NominatimGeocoder {
        client: reqwest::Client,
        url: String,
    }

    impl NominatimGeocoder {
        pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
            Self {
                client,
                url: url.into(),
            }
        }

        pub fn from_config(config: &ServicesConfig) -> Result<Self, LookupError> {
            let client = http_client(Duration::from_secs(config.timeout_secs))?;
            Ok(Self::new(client, config.geocoder_url.clone()))
        }
    }

    #[async_trait]
    impl Geocoder for NominatimGeocoder {
        async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, LookupError> {
            debug!(query, "geocoding");
            let body = self
                .client
                .get(&self.url)
                .query(&[("format", "json"), ("q", query)])
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|cause| LookupError::Http {
                    service: "geocoder",
                    cause,
                })?
                .text()
                .await
                .map_err(|cause| LookupError::Http {
                    service: "geocoder",
                    cause,
                })?;
            parse_geocode_response(&body)
        }
    }

    /// Driving routes from an OSRM `route/v1` endpoint.
    #[derive(Debug, Clone)]
    pub struct OsrmRouter {
        client: reqwest::Client,
        url: String,
    }

    impl OsrmRouter {
        pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
            Self {
                client,
                url: url.into(),
            }
        }

        pub fn from_config(config: &ServicesConfig) -> Result<Self, LookupError> {
            let client = http_client(Duration::from_secs(config.timeout_secs))?;
            Ok(Self::new(client, config.router_url.clone()))
        }
    }

    #[async_trait]
    impl Router for OsrmRouter {
        async fn route(
            &self,
            from: Coordinates,
            to: Coordinates,
        ) -> Result<RouteSummary, LookupError> {
            // OSRM wants lng,lat order
            let url = format!(
                "{}/driving/{},{};{},{}",
                self.url.trim_end_matches('/'),
                from.lng,
                from.lat,
                to.lng,
                to.lat
            );
            let body = self
                .client
                .get(url)
                .query(&[("overview", "false"), ("steps", "true")])
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|cause| LookupError::Http {
                    service: "router",
                    cause,
                })?
                .text()
                .await
                .map_err(|cause| LookupError::Http {
                    service: "router",
                    cause,
                })?;
            parse_route_response(&body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_geocode_takes_first_hit() {
        let body = r#"[
            {"lat": "48.8566", "lon": "2.3522", "display_name": "Paris"},
            {"lat": "33.66", "lon": "-95.55", "display_name": "Paris, Texas"}
        ]"#;
        let coords = parse_geocode_response(body).unwrap().unwrap();
        assert_eq!(coords, Coordinates::new(48.8566, 2.3522));
    }

    #[test]
    fn test_geocode_empty_is_not_found() {
        assert_eq!(parse_geocode_response("[]").unwrap(), None);
    }

    #[test]
    fn test_geocode_garbage_is_decode_error() {
        assert!(matches!(
            parse_geocode_response(r#"{"error": "rate limited"}"#),
            Err(LookupError::Decode { .. })
        ));
    }

    #[test]
    fn test_route_summary() {
        let body = r#"{
            "code": "Ok",
            "routes": [{
                "distance": 2540.0,
                "duration": 420.0,
                "legs": [{"steps": [
                    {"name": "Rue de Rivoli", "maneuver": {"type": "depart", "modifier": "left"}},
                    {"name": "", "maneuver": {"type": "turn", "modifier": "right"}}
                ]}]
            }]
        }"#;
        let summary = parse_route_response(body).unwrap();
        assert_eq!(
            summary,
            RouteSummary {
                distance_km: 2.54,
                duration_min: 7.0,
                next_instruction: "Head out onto Rue de Rivoli".to_string(),
            }
        );
    }

    #[test]
    fn test_route_without_steps_is_arrived() {
        let body = r#"{"code": "Ok", "routes": [{"distance": 0.0, "duration": 0.0, "legs": []}]}"#;
        assert_eq!(parse_route_response(body).unwrap().next_instruction, "Arrived");
    }

    #[test]
    fn test_route_error_code() {
        let body = r#"{"code": "NoRoute", "message": "Impossible route"}"#;
        assert!(matches!(parse_route_response(body), Err(LookupError::NoRoute)));
    }
}

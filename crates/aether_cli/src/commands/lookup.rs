use aether_core::config::TrackerConfig;
use aether_core::location::Coordinates;
use aether_core::lookup::{Geocoder, NominatimGeocoder, OsrmRouter, Router};
use miette::Result;

use crate::output::Output;

pub async fn geocode(config: &TrackerConfig, query: &str, output: &Output) -> Result<()> {
    let geocoder = NominatimGeocoder::from_config(&config.services)?;
    match geocoder.lookup(query).await? {
        Some(coords) => {
            output.success(query);
            output.kv("lat", &format!("{:.6}", coords.lat));
            output.kv("lng", &format!("{:.6}", coords.lng));
        }
        None => output.warning("Location not found"),
    }
    Ok(())
}

pub async fn route(
    config: &TrackerConfig,
    from: Coordinates,
    to: Coordinates,
    output: &Output,
) -> Result<()> {
    let router = OsrmRouter::from_config(&config.services)?;
    let summary = router.route(from, to).await?;
    output.section("Route");
    output.kv("distance", &format!("{:.2} km", summary.distance_km));
    output.kv("duration", &format!("{:.0} min", summary.duration_min));
    output.kv("next", &summary.next_instruction);
    Ok(())
}

//! Waypoint validation and clipping for route requests.

use crate::error::ValidationError;
use crate::types::Waypoint;

/// Reject fewer than two points or any point outside coordinate ranges.
pub fn validate_waypoints(points: &[Waypoint]) -> Result<(), ValidationError> {
    let valid = points.iter().filter(|p| p.is_valid()).count();
    if valid < 2 {
        return Err(ValidationError::TooFewWaypoints { valid });
    }
    if let Some((index, p)) = points.iter().enumerate().find(|(_, p)| !p.is_valid()) {
        return Err(ValidationError::InvalidWaypoint {
            index,
            lat: p.lat,
            lon: p.lon,
        });
    }
    Ok(())
}

/// Clip a route to at most `max` points: first, evenly sampled interior, last.
///
/// `max` below 2 is treated as 2.
#[must_use]
pub fn clip_waypoints(points: &[Waypoint], max: usize) -> Vec<Waypoint> {
    let max = max.max(2);
    if points.len() <= max {
        return points.to_vec();
    }

    let interior = &points[1..points.len() - 1];
    let keep = max - 2;
    let mut out = Vec::with_capacity(max);
    out.push(points[0]);
    // interior.len() > keep, so sampled indices are strictly increasing
    out.extend((0..keep).map(|k| interior[k * interior.len() / keep]));
    out.push(points[points.len() - 1]);
    out
}

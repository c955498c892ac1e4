use std::collections::HashMap;

use kiosk_core::LocationReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
pub const RADIUS_SMALL_METERS: f64 = 50.0;
pub const RADIUS_MEDIUM_METERS: f64 = 100.0;
pub const RADIUS_LARGE_METERS: f64 = 500.0;
pub const DEFAULT_NEARBY_METERS: f64 = 1_000.0;

/// A circular area around a place the kiosk reports visits to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    /// Free-form category such as `office` or `warehouse`.
    pub place_type: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_radius")]
    pub radius_meters: f64,
    #[serde(default)]
    pub metadata: Value,
}

fn default_radius() -> f64 {
    RADIUS_MEDIUM_METERS
}

impl Geofence {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        place_type: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            place_type: place_type.into(),
            latitude,
            longitude,
            radius_meters: RADIUS_MEDIUM_METERS,
            metadata: Value::Null,
        }
    }

    pub fn with_radius(mut self, radius_meters: f64) -> Self {
        self.radius_meters = radius_meters;
        self
    }

    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        distance_meters(self.latitude, self.longitude, latitude, longitude)
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        self.distance_to(latitude, longitude) <= self.radius_meters
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeofenceTransition {
    Enter,
    Exit,
}

impl GeofenceTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceTransition::Enter => "enter",
            GeofenceTransition::Exit => "exit",
        }
    }
}

/// Body of a `geofence_event` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub device_id: String,
    pub geofence_id: String,
    pub event_type: GeofenceTransition,
    pub place_name: String,
    pub place_type: String,
    pub latitude: f64,
    pub longitude: f64,
    /// RFC 3339 instant of the fix that crossed the boundary.
    pub recorded_at: String,
    /// Seconds spent inside, on exit events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyGeofence {
    pub geofence: Geofence,
    pub distance_meters: f64,
}

#[derive(Debug, Clone, Copy)]
struct FenceState {
    entered_at: Option<OffsetDateTime>,
}

/// Remembers which geofences the device is inside and turns each new fix
/// into enter/exit transitions.
///
/// The first fix seen for a fence only emits an event when it lands
/// inside; a fix outside just records the starting state.
#[derive(Debug, Default)]
pub struct GeofenceTracker {
    fences: Vec<Geofence>,
    states: HashMap<String, FenceState>,
}

impl GeofenceTracker {
    pub fn new(fences: Vec<Geofence>) -> Self {
        Self {
            fences,
            states: HashMap::new(),
        }
    }

    pub fn geofences(&self) -> &[Geofence] {
        &self.fences
    }

    /// Adds or replaces a fence by id. A replaced fence starts over.
    pub fn add(&mut self, fence: Geofence) {
        self.states.remove(&fence.id);
        match self.fences.iter_mut().find(|known| known.id == fence.id) {
            Some(known) => *known = fence,
            None => self.fences.push(fence),
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.states.remove(id);
        let before = self.fences.len();
        self.fences.retain(|fence| fence.id != id);
        self.fences.len() != before
    }

    /// Replaces the fence list, keeping state for ids that survive.
    pub fn replace_all(&mut self, fences: Vec<Geofence>) {
        self.states
            .retain(|id, _| fences.iter().any(|fence| &fence.id == id));
        self.fences = fences;
    }

    pub fn clear(&mut self) {
        self.fences.clear();
        self.states.clear();
    }

    /// Fences the device was inside at the last fix.
    pub fn current(&self) -> Vec<&Geofence> {
        self.fences
            .iter()
            .filter(|fence| {
                self.states
                    .get(&fence.id)
                    .is_some_and(|state| state.entered_at.is_some())
            })
            .collect()
    }

    /// Evaluates a location report. Fails only when `recorded_at` is not
    /// an RFC 3339 instant.
    pub fn check_location(
        &mut self,
        fix: &LocationReport,
    ) -> Result<Vec<GeofenceEvent>, time::error::Parse> {
        let at = OffsetDateTime::parse(&fix.recorded_at, &Rfc3339)?;
        Ok(self.evaluate(&fix.device_id, fix.latitude, fix.longitude, at))
    }

    pub fn evaluate(
        &mut self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        at: OffsetDateTime,
    ) -> Vec<GeofenceEvent> {
        let recorded_at = at.format(&Rfc3339).unwrap_or_default();
        let mut events = Vec::new();
        for fence in &self.fences {
            let inside = fence.contains(latitude, longitude);
            let previous = self.states.get(&fence.id).copied();
            let transition = match (previous, inside) {
                (None, true) => Some((GeofenceTransition::Enter, None)),
                (Some(state), true) if state.entered_at.is_none() => {
                    Some((GeofenceTransition::Enter, None))
                }
                (Some(FenceState {
                    entered_at: Some(since),
                }), false) => Some((
                    GeofenceTransition::Exit,
                    Some((at - since).whole_seconds().max(0)),
                )),
                _ => None,
            };
            let entered_at = match (inside, previous) {
                (false, _) => None,
                (true, Some(FenceState {
                    entered_at: Some(since),
                })) => Some(since),
                (true, _) => Some(at),
            };
            self.states
                .insert(fence.id.clone(), FenceState { entered_at });

            if let Some((event_type, dwell_secs)) = transition {
                events.push(GeofenceEvent {
                    device_id: device_id.to_string(),
                    geofence_id: fence.id.clone(),
                    event_type,
                    place_name: fence.name.clone(),
                    place_type: fence.place_type.clone(),
                    latitude,
                    longitude,
                    recorded_at: recorded_at.clone(),
                    dwell_secs,
                });
            }
        }
        events
    }

    /// Fences within `max_distance` meters of a point, nearest first.
    pub fn find_nearby(&self, latitude: f64, longitude: f64, max_distance: f64) -> Vec<NearbyGeofence> {
        let mut nearby: Vec<NearbyGeofence> = self
            .fences
            .iter()
            .map(|fence| NearbyGeofence {
                distance_meters: fence.distance_to(latitude, longitude),
                geofence: fence.clone(),
            })
            .filter(|candidate| candidate.distance_meters <= max_distance)
            .collect();
        nearby.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        nearby
    }
}

/// Great-circle distance in meters (haversine).
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().atan2((1.0 - a).sqrt())
}

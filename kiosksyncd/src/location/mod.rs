pub mod geofence;
pub mod history;

pub use geofence::{
    Geofence, GeofenceEvent, GeofenceTracker, GeofenceTransition, NearbyGeofence,
    distance_meters,
};
pub use history::{GeofenceEventRecord, LocationHistory, LocationPoint, LocationStats, TimeRange};

use serde::{Deserialize, Serialize};

/// One location fix as the backend expects it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocationReport {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// RFC 3339 instant.
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceStatusReport {
    pub device_id: String,
    #[serde(default)]
    pub battery_percent: Option<u8>,
    #[serde(default)]
    pub is_charging: bool,
    pub network_type: String,
    pub connectivity: String,
    #[serde(default)]
    pub kiosk_locked: bool,
}

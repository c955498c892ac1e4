mod client;
mod models;
mod pinning;

pub use client::{ApiErrorClass, BackendClient, BackendConfig, BackendError, RecordMeta};
pub use models::{DeviceStatusReport, LocationReport};
pub use pinning::{PinError, PinSet, spki_pin};

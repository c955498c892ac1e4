pub mod daemon;
pub mod location;
pub mod logging;
pub mod storage;
pub mod sync;

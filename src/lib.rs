//! Control core of a vehicle-mounted fare meter: GPS acquisition, fare
//! computation for sharing and private trips, rotary-selector mode
//! detection, and the hold-to-arm emergency system. Rendering, map
//! tiles, and ride-record upload live behind the event surface in
//! [`events::MeterEvent`] and never reach back into the core.

pub mod config;
pub mod events;
pub mod fare;
pub mod geo;
pub mod inputs;
pub mod meter;
pub mod mode;
pub mod sos;
pub mod sync;

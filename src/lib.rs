#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bipfetch
//!
//! A Rust library for pulling recorded activities off an Amazfit Bip over
//! Bluetooth Low Energy, without the vendor app.
//!
//! A sync runs in four steps:
//!
//! - **Authentication**: the watch sends a 16-byte nonce and the host answers
//!   with that nonce encrypted under the device's AES-128 key
//! - **Fetch**: a request ladder of three command variants, each with its own
//!   deadline, until the watch starts streaming
//! - **Decode**: the reassembled stream is walked as type/length/value
//!   telemetry records (timestamps, GPS fixes, deltas, heart rate)
//! - **Export**: distance, duration, calories and heart rate are aggregated
//!   and the track can be written as GPX 1.1
//!
//! The device key is not exchanged over the air. It has to be extracted from
//! the paired phone beforehand.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bipfetch::BipDevice;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect to the strongest watch in range
//!     let device = BipDevice::connect_first().await?;
//!
//!     device.authenticate_hex("00112233445566778899aabbccddeeff").await?;
//!     device.sync_time().await?;
//!
//!     let summary = device.fetch_activities().await?;
//!     println!(
//!         "{:.2} km, {} ({} bytes)",
//!         summary.distance_km,
//!         summary.duration_hms(),
//!         summary.bytes_received
//!     );
//!
//!     std::fs::write("activity.gpx", device.export_gpx(&summary))?;
//!     Ok(())
//! }
//! ```

/// AES challenge-response authentication
pub mod auth;
/// Bluetooth Low Energy discovery and transport
pub mod ble;
/// Telemetry stream decoding
pub mod decoder;
/// Main device interface
pub mod device;
/// Error types and handling
pub mod error;
/// Activity fetch state machine and session driver
pub mod fetch;
/// GPX export
pub mod gpx;
/// Wire formats of the watch protocol
pub mod protocol;
/// Reassembly of notification chunks into one stream
pub mod reassembly;
/// Activity statistics
pub mod stats;
/// Transport abstraction and command writing
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::BipDevice;
pub use error::{AuthFailure, BipError, Result};
pub use fetch::{ActivityFetchSession, FetchAbortHandle};
pub use gpx::ExchangeExporter;
pub use transport::{EventSink, FrameTransport};
pub use types::{
    ActivitySummary, ConnectionParams, Credential, DeviceInfo, FetchConfig, FetchOutcome,
    RetainPolicy, RetryPolicy, SyncEvent, TimeoutConfig, TrackPoint,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Huami vendor service advertised by the watch
///
/// Used as the scan filter. The endpoint characteristics are looked up by
/// UUID across all services, since firmware versions spread them differently.
pub const HUAMI_SERVICE_UUID: &str = "0000fee0-0000-1000-8000-00805f9b34fb";

/// Authentication characteristic (write + notify)
pub const AUTH_CHAR_UUID: &str = "00000009-0000-3512-2118-0009af100700";

/// Activity fetch control characteristic (write + notify)
pub const FETCH_CONTROL_CHAR_UUID: &str = "00000004-0000-3512-2118-0009af100700";

/// Control characteristic used by firmware without [`FETCH_CONTROL_CHAR_UUID`]
pub const FALLBACK_CONTROL_CHAR_UUID: &str = "00000001-0000-3512-2118-0009af100700";

/// Activity data characteristic (notify only)
pub const FETCH_DATA_CHAR_UUID: &str = "00000005-0000-3512-2118-0009af100700";

/// Current Time characteristic
///
/// Found in the Current Time service on most firmware, and in the Huami
/// service on some.
pub const TIME_CHAR_UUID: &str = "00002a2b-0000-1000-8000-00805f9b34fb";

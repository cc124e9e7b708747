use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::{
    error::{BipError, Result},
    protocol::ActivityClass,
};

/// Length of the shared auth key in bytes
pub const CREDENTIAL_LEN: usize = 16;

/// The four GATT endpoints the protocol engine talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Challenge-response authentication characteristic (`0009`)
    Auth,
    /// Fetch control characteristic (commands out, status frames in)
    Control,
    /// Fetch data characteristic (bulk telemetry notifications)
    Data,
    /// Current-time characteristic (`2A2B`)
    Time,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Control => write!(f, "control"),
            Self::Data => write!(f, "data"),
            Self::Time => write!(f, "time"),
        }
    }
}

/// GATT write flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Acknowledged write (write request)
    WithResponse,
    /// Unacknowledged write (write command)
    WithoutResponse,
}

impl WriteMode {
    /// The other write flavour
    #[must_use]
    pub const fn alternate(self) -> Self {
        match self {
            Self::WithResponse => Self::WithoutResponse,
            Self::WithoutResponse => Self::WithResponse,
        }
    }
}

/// Write modes an endpoint advertises
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCapabilities {
    /// Supports acknowledged writes
    pub with_response: bool,
    /// Supports unacknowledged writes
    pub without_response: bool,
}

impl WriteCapabilities {
    /// Endpoint supporting both write modes
    pub const BOTH: Self = Self {
        with_response: true,
        without_response: true,
    };

    /// Endpoint supporting only acknowledged writes
    pub const ACKNOWLEDGED: Self = Self {
        with_response: true,
        without_response: false,
    };

    /// Endpoint that can only be subscribed to
    pub const NOTIFY_ONLY: Self = Self {
        with_response: false,
        without_response: false,
    };

    /// Check whether the endpoint supports `mode`
    #[must_use]
    pub const fn supports(self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.with_response,
            WriteMode::WithoutResponse => self.without_response,
        }
    }

    /// Check whether the endpoint is writable at all
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.with_response || self.without_response
    }
}

/// 16-byte symmetric auth key shared with the watch
///
/// Only ever built from a 32-character hexadecimal string. The key bytes are
/// never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential([u8; CREDENTIAL_LEN]);

impl Credential {
    /// Parse a 32-character hexadecimal auth key
    ///
    /// Surrounding whitespace and an optional `0x` prefix are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BipError::InvalidCredential`] if the input is not exactly
    /// 32 hexadecimal characters.
    pub fn from_hex(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex_part.len() != CREDENTIAL_LEN * 2 {
            return Err(BipError::InvalidCredential(format!(
                "expected {} hex characters, got {}",
                CREDENTIAL_LEN * 2,
                hex_part.len()
            )));
        }

        let mut key = [0u8; CREDENTIAL_LEN];
        hex::decode_to_slice(hex_part, &mut key)
            .map_err(|e| BipError::InvalidCredential(e.to_string()))?;
        Ok(Self(key))
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(**redacted**)")
    }
}

/// Authentication handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Nothing sent yet
    Idle,
    /// Random-number request sent, waiting for the nonce
    ChallengeAwaited,
    /// Encrypted nonce sent, waiting for the verdict
    ResponseSent,
    /// The watch accepted the key
    Authenticated,
    /// Rejected, timed out or broken
    Failed,
}

/// Activity fetch session progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchSessionState {
    /// Accumulators reset, nothing sent
    Idle,
    /// Direct fetch command sent
    Phase1,
    /// Secondary fetch command sent
    Phase2,
    /// Emergency authorize command sent
    Phase3,
    /// The watch accepted the request and is streaming
    Transferring,
    /// Building the summary from the accumulated chunks
    Finalizing,
    /// Finished with data, or with a definitive "nothing to fetch"
    Complete,
    /// Finished without a usable transfer
    Failed,
}

impl FetchSessionState {
    /// One of the three negotiation phases
    #[must_use]
    pub const fn is_negotiating(self) -> bool {
        matches!(self, Self::Phase1 | Self::Phase2 | Self::Phase3)
    }

    /// Session is over
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for FetchSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Phase1 => write!(f, "Phase 1 (direct fetch)"),
            Self::Phase2 => write!(f, "Phase 2 (secondary)"),
            Self::Phase3 => write!(f, "Phase 3 (emergency authorize)"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Finalizing => write!(f, "Finalizing"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Whether the watch keeps the fetched activity after the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetainPolicy {
    /// Keep the data on the watch (`03 09`)
    Keep,
    /// Delete the data from the watch (`03 01`)
    Delete,
}

/// Origin of a notification frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Status frame on the control endpoint
    Control,
    /// Telemetry frame carrying a leading sequence byte
    Data,
}

/// One notification payload exactly as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// Control or data frame
    pub kind: FrameKind,
    /// Frame bytes
    pub bytes: Bytes,
}

impl RawChunk {
    /// Data frame
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            bytes: bytes.into(),
        }
    }

    /// Control frame
    pub fn control(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Control,
            bytes: bytes.into(),
        }
    }
}

/// What a trackpoint carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
    /// GPS fix, optionally with heart rate
    Position,
    /// Heart-rate sample with no fix close enough in time
    HeartRateOnly,
}

/// One geo-temporal sample of an exercise session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Absolute sample time
    pub timestamp: DateTime<Utc>,
    /// Heart rate in BPM, if a valid sample was attached
    pub heart_rate: Option<u8>,
    /// Position fix or heart-rate-only sample
    pub kind: PointKind,
}

impl TrackPoint {
    /// Check whether this point carries a GPS position
    #[must_use]
    pub fn is_position(&self) -> bool {
        self.kind == PointKind::Position
    }

    /// Position point with coordinates inside the WGS84 range
    #[must_use]
    pub fn has_valid_coordinates(&self) -> bool {
        self.is_position()
            && self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// How a fetch session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchOutcome {
    /// The watch signalled end-of-transfer (`10 02 01`)
    Completed,
    /// The data stream went quiet and the inactivity timer closed the session
    Drained,
    /// The watch reported zero pending records
    NothingToFetch,
    /// No phase produced any response
    NoResponse,
    /// The watch aborted the transfer (`10 02 <status>`)
    TransferFailed {
        /// Status byte reported by the watch
        status: u8,
    },
    /// The session was cancelled by the caller
    Cancelled,
    /// The notification stream closed under the session
    LinkLost,
}

impl FetchOutcome {
    /// Outcomes that end in [`FetchSessionState::Complete`] given `bytes_received`
    #[must_use]
    pub const fn is_success(self, bytes_received: usize) -> bool {
        match self {
            Self::Completed | Self::NothingToFetch => true,
            Self::Drained => bytes_received > 0,
            _ => false,
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "transfer completed"),
            Self::Drained => write!(f, "stream drained (inactivity)"),
            Self::NothingToFetch => write!(f, "nothing to fetch"),
            Self::NoResponse => write!(f, "no response after all phases"),
            Self::TransferFailed { status } => {
                write!(f, "transfer failed with status {status:02X}")
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::LinkLost => write!(f, "link lost"),
        }
    }
}

/// Decoded exercise session with derived statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Sum of great-circle distances between consecutive fixes
    pub distance_km: f64,
    /// Time between first and last fix
    pub duration: Option<Duration>,
    /// Distance-based calorie approximation
    pub calorie_estimate: Option<u32>,
    /// Mean of valid heart-rate samples
    pub avg_heart_rate: Option<f64>,
    /// Decoded trackpoints, heart-rate-only samples included
    pub points: Vec<TrackPoint>,
    /// When the fetch session finished
    pub sync_timestamp: DateTime<Utc>,
    /// Whether geographic fields come from a successful decode
    pub is_real_data: bool,
    /// Raw bytes received over the data stream
    pub bytes_received: usize,
    /// How the session ended
    pub outcome: FetchOutcome,
}

impl ActivitySummary {
    /// Summary carrying no data at all
    #[must_use]
    pub fn empty(sync_timestamp: DateTime<Utc>, outcome: FetchOutcome) -> Self {
        Self {
            distance_km: 0.0,
            duration: None,
            calorie_estimate: None,
            avg_heart_rate: None,
            points: Vec::new(),
            sync_timestamp,
            is_real_data: false,
            bytes_received: 0,
            outcome,
        }
    }

    /// Duration as `HH:MM:SS`, or `--:--:--` without fixes
    #[must_use]
    pub fn duration_hms(&self) -> String {
        crate::stats::format_duration(self.duration)
    }

    /// Points that can be drawn on a map
    pub fn position_points(&self) -> impl Iterator<Item = &TrackPoint> {
        self.points.iter().filter(|p| p.has_valid_coordinates())
    }
}

/// Events delivered to the caller while a session runs
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Raw bytes received so far (rate-limited)
    Progress {
        /// Total raw bytes received
        bytes_received: usize,
    },
    /// A fetch session finished
    Completed(Box<ActivitySummary>),
    /// A handshake or configuration failure
    Failed {
        /// Human-readable reason
        reason: String,
    },
}

/// Device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name
    pub name: String,
    /// Bluetooth address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, address: String, rssi: i16) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Only accept devices whose name contains this string (case-insensitive)
    pub name_filter: Option<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            name_filter: None,
        }
    }
}

/// Protocol timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Handshake deadline in milliseconds
    pub auth_timeout_ms: u64,
    /// Phase 1 deadline in milliseconds
    pub phase1_timeout_ms: u64,
    /// Phase 2 deadline in milliseconds
    pub phase2_timeout_ms: u64,
    /// Phase 3 deadline in milliseconds
    pub phase3_timeout_ms: u64,
    /// Silence on the data stream that ends a session, in milliseconds
    pub inactivity_timeout_ms: u64,
    /// Gap between the fetch acceptance and the start-transfer command
    pub start_transfer_delay_ms: u64,
    /// Cooldown before re-sending after a `10 01 02` rejection
    pub rejection_cooldown_ms: u64,
    /// Settling gap after each notification channel is enabled
    pub channel_settle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 10_000,
            phase1_timeout_ms: 10_000,
            phase2_timeout_ms: 12_000,
            phase3_timeout_ms: 10_000,
            inactivity_timeout_ms: 5_000,
            start_transfer_delay_ms: 250,
            rejection_cooldown_ms: 2_000,
            channel_settle_ms: 1_000,
        }
    }
}

/// Back-off policy for command writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts in the primary write mode
    pub max_attempts: u32,
    /// Pause before every attempt in milliseconds
    pub settle_ms: u64,
    /// First back-off in milliseconds
    pub initial_backoff_ms: u64,
    /// Back-off cap in milliseconds
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Back-off after the given failed attempt (1-based), doubling up to the cap
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_ms: 200,
            initial_backoff_ms: 400,
            max_backoff_ms: 3_200,
        }
    }
}

/// Activity fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Which record class to request
    pub activity_class: ActivityClass,
    /// Only fetch activities recorded after this local time
    pub since: NaiveDateTime,
    /// Minute-resolution filter used by the secondary request variant
    pub secondary_since: NaiveDateTime,
    /// Keep or delete the data on the watch afterwards
    pub retain: RetainPolicy,
    /// Send a keep-alive after every this many received bytes (0 disables)
    pub keepalive_interval_bytes: usize,
    /// Minimum gap between two progress events in milliseconds
    pub progress_interval_ms: u64,
    /// How many `10 01 02` rejections are answered with a re-send
    pub max_rejection_retries: u32,
    /// Protocol timing
    pub timeouts: TimeoutConfig,
    /// Command write retry policy
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            activity_class: ActivityClass::SportsDetails,
            since: NaiveDate::from_ymd_opt(2020, 1, 1)
                .unwrap_or_default()
                .and_time(NaiveTime::MIN),
            secondary_since: NaiveDate::from_ymd_opt(2020, 2, 21)
                .and_then(|d| d.and_hms_opt(10, 0, 0))
                .unwrap_or_default(),
            retain: RetainPolicy::Keep,
            keepalive_interval_bytes: 2_048,
            progress_interval_ms: 300,
            max_rejection_retries: 3,
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

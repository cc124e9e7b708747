use crate::{
    auth::AuthHandshake,
    ble::{BleManager, BleTransport},
    error::{BipError, Result},
    fetch::{ActivityFetchSession, FetchAbortHandle},
    gpx::ExchangeExporter,
    protocol::time_sync_packets,
    transport::{CommandWriter, EndpointSet, EventSink, FrameTransport, NotificationStream},
    types::{
        ActivitySummary, ConnectionParams, Credential, DeviceInfo, Endpoint, FetchConfig,
        HandshakeState, SyncEvent, WriteMode,
    },
};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// One connected Amazfit Bip
///
/// `BipDevice` owns the link to a watch and runs the steps of a sync on it:
/// authentication, clock synchronisation, the activity fetch and GPX export.
/// At most one fetch runs at a time.
///
/// # Examples
///
/// ```no_run
/// use bipfetch::BipDevice;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let device = BipDevice::connect_first().await?;
///     device.authenticate_hex("00112233445566778899aabbccddeeff").await?;
///     device.sync_time().await?;
///
///     let summary = device.fetch_activities().await?;
///     println!("{:.2} km in {}", summary.distance_km, summary.duration_hms());
///     std::fs::write("activity.gpx", device.export_gpx(&summary))?;
///
///     device.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct BipDevice {
    transport: Arc<dyn FrameTransport>,
    link: Arc<Mutex<Option<BleTransport>>>,
    writer: Arc<CommandWriter>,
    device_info: DeviceInfo,
    config: FetchConfig,
    handshake: RwLock<HandshakeState>,
    fetch_lock: Mutex<()>,
    active_fetch: Mutex<Option<FetchAbortHandle>>,
    events: EventSink,
    exporter: ExchangeExporter,
}

impl BipDevice {
    /// Connect to the strongest watch in range with default settings
    ///
    /// # Errors
    ///
    /// Returns [`BipError::DeviceNotFound`] if no watch is found during the
    /// scan, or any BLE connection error.
    pub async fn connect_first() -> Result<Self> {
        Self::connect_first_with_params(ConnectionParams::default(), FetchConfig::default()).await
    }

    /// Connect to the strongest watch in range
    ///
    /// # Errors
    ///
    /// Returns [`BipError::DeviceNotFound`] if no watch matches `params`,
    /// or any BLE connection error.
    pub async fn connect_first_with_params(
        params: ConnectionParams,
        config: FetchConfig,
    ) -> Result<Self> {
        let ble_manager = BleManager::new().await?;
        let devices = ble_manager.scan_for_devices(&params).await?;

        // scan results are sorted by signal strength
        let device_info = devices.into_iter().next().ok_or(BipError::DeviceNotFound)?;
        Self::connect_with_manager(&ble_manager, device_info, &params, config).await
    }

    /// Connect to a specific watch
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The watch is not in range
    /// - Connecting times out
    /// - BLE communication errors occur
    pub async fn connect_to_device(
        device_info: DeviceInfo,
        params: ConnectionParams,
        config: FetchConfig,
    ) -> Result<Self> {
        let ble_manager = BleManager::new().await?;
        ble_manager.scan_for_devices(&params).await?;
        Self::connect_with_manager(&ble_manager, device_info, &params, config).await
    }

    async fn connect_with_manager(
        ble_manager: &BleManager,
        device_info: DeviceInfo,
        params: &ConnectionParams,
        config: FetchConfig,
    ) -> Result<Self> {
        let link = ble_manager.connect_to_device(&device_info, params).await?;
        let transport = Arc::new(LinkTransport::new(link));

        let mut device = Self::with_transport(transport.clone(), device_info, config);
        device.link = transport.link.clone();
        Ok(device)
    }

    /// Drive a watch over any [`FrameTransport`]
    #[must_use]
    pub fn with_transport(
        transport: Arc<dyn FrameTransport>,
        device_info: DeviceInfo,
        config: FetchConfig,
    ) -> Self {
        let writer = Arc::new(CommandWriter::new(transport.clone(), config.retry.clone()));

        Self {
            transport,
            link: Arc::new(Mutex::new(None)),
            writer,
            device_info,
            config,
            handshake: RwLock::new(HandshakeState::Idle),
            fetch_lock: Mutex::new(()),
            active_fetch: Mutex::new(None),
            events: EventSink::disabled(),
            exporter: ExchangeExporter::default(),
        }
    }

    /// Deliver sync events to a new channel
    ///
    /// Replaces any previously returned receiver.
    pub fn subscribe_events(&mut self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (events, rx) = EventSink::channel();
        self.events = events;
        rx
    }

    /// Use a custom GPX exporter
    #[must_use]
    pub fn with_exporter(mut self, exporter: ExchangeExporter) -> Self {
        self.exporter = exporter;
        self
    }

    /// Get device information
    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Get fetch configuration
    #[must_use]
    pub const fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// State of the last authentication attempt
    pub async fn handshake_state(&self) -> HandshakeState {
        *self.handshake.read().await
    }

    /// Check if the watch accepted our key on this connection
    pub async fn is_authenticated(&self) -> bool {
        self.handshake_state().await == HandshakeState::Authenticated
    }

    /// Authenticate with the 16-byte device key
    ///
    /// Every call runs a fresh handshake.
    ///
    /// # Errors
    ///
    /// - [`BipError::MissingEndpoint`] if the watch has no auth endpoint
    /// - [`BipError::AuthenticationFailed`] if the key is rejected
    /// - [`BipError::Timeout`] if the watch does not answer in time
    pub async fn authenticate(&self, credential: &Credential) -> Result<()> {
        let timeout = Duration::from_millis(self.config.timeouts.auth_timeout_ms);
        let mut handshake =
            AuthHandshake::new(self.writer.clone(), timeout).with_events(self.events.clone());

        *self.handshake.write().await = HandshakeState::ChallengeAwaited;
        let result = handshake.authenticate(credential).await;
        *self.handshake.write().await = handshake.state();
        result
    }

    /// Authenticate with a hex-encoded key
    ///
    /// # Errors
    ///
    /// Returns [`BipError::InvalidCredential`] if the key is not 32 hex
    /// digits, otherwise the errors of [`BipDevice::authenticate`].
    pub async fn authenticate_hex(&self, key: &str) -> Result<()> {
        let credential = Credential::from_hex(key)?;
        self.authenticate(&credential).await
    }

    /// Set the watch clock to the local time
    ///
    /// # Errors
    ///
    /// Returns the last write error if the watch accepts none of the time
    /// formats.
    pub async fn sync_time(&self) -> Result<()> {
        self.sync_time_to(Local::now().naive_local()).await
    }

    /// Set the watch clock
    ///
    /// The packet formats are tried from the most to the least specific and
    /// the first accepted write wins. A watch without a time endpoint is
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns the last write error if every format is refused.
    pub async fn sync_time_to(&self, now: NaiveDateTime) -> Result<()> {
        if !self.transport.endpoints().contains(Endpoint::Time) {
            warn!("Watch has no time endpoint, skipping clock sync");
            return Ok(());
        }

        let mut last_error = None;
        for packet in time_sync_packets(now) {
            match self
                .writer
                .write_once(Endpoint::Time, &packet, WriteMode::WithResponse)
                .await
            {
                Ok(()) => {
                    info!("Clock set to {} ({} byte format)", now, packet.len());
                    return Ok(());
                }
                Err(e) => {
                    debug!("{} byte time format refused: {}", packet.len(), e);
                    last_error = Some(e);
                }
            }
        }

        warn!("Watch refused every time format");
        Err(last_error.unwrap_or(BipError::WriteFailed {
            endpoint: Endpoint::Time,
            attempts: 0,
        }))
    }

    /// Fetch the stored activity data and decode it
    ///
    /// # Errors
    ///
    /// - [`BipError::NotAuthenticated`] before a successful handshake
    /// - [`BipError::FetchInProgress`] while another fetch is running
    /// - a configuration error if the watch has no usable control endpoint
    pub async fn fetch_activities(&self) -> Result<ActivitySummary> {
        let Ok(_guard) = self.fetch_lock.try_lock() else {
            return Err(BipError::FetchInProgress);
        };
        if !self.is_authenticated().await {
            return Err(BipError::NotAuthenticated);
        }

        let session = ActivityFetchSession::new(self.writer.clone(), self.config.clone())?
            .with_events(self.events.clone());
        *self.active_fetch.lock().await = Some(session.abort_handle());

        let result = session.run().await;

        *self.active_fetch.lock().await = None;
        result
    }

    /// Stop the running fetch; it finishes with the data received so far
    ///
    /// Returns `false` when no fetch is running.
    pub async fn cancel_fetch(&self) -> bool {
        match self.active_fetch.lock().await.as_ref() {
            Some(handle) => {
                info!("Cancelling activity fetch");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Render a summary as GPX
    #[must_use]
    pub fn export_gpx(&self, summary: &ActivitySummary) -> String {
        self.exporter.export(summary)
    }

    /// Write a summary as GPX
    ///
    /// # Errors
    ///
    /// Returns [`BipError::Io`] if writing fails.
    pub fn export_gpx_to<W: std::io::Write>(
        &self,
        summary: &ActivitySummary,
        writer: W,
    ) -> Result<()> {
        self.exporter.write_to(summary, writer)
    }

    /// Disconnect from the watch
    ///
    /// # Errors
    ///
    /// Returns [`BipError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from {}", self.device_info.name);

        self.cancel_fetch().await;
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.disconnect().await?;
        }

        *self.handshake.write().await = HandshakeState::Idle;
        Ok(())
    }
}

impl Drop for BipDevice {
    fn drop(&mut self) {
        let link = self.link.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        runtime.spawn(async move {
            let value = link.lock().await.take();
            if let Some(link) = value {
                let _ = link.disconnect().await;
            }
        });
    }
}

/// Shares one BLE link between the device and its command writer
struct LinkTransport {
    endpoints: EndpointSet,
    link: Arc<Mutex<Option<BleTransport>>>,
}

impl LinkTransport {
    fn new(link: BleTransport) -> Self {
        Self {
            endpoints: link.endpoints().clone(),
            link: Arc::new(Mutex::new(Some(link))),
        }
    }
}

#[async_trait]
impl FrameTransport for LinkTransport {
    fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    async fn write(&self, endpoint: Endpoint, data: &[u8], mode: WriteMode) -> Result<()> {
        match self.link.lock().await.as_ref() {
            Some(link) => link.write(endpoint, data, mode).await,
            None => Err(BipError::Disconnected),
        }
    }

    async fn subscribe(&self, endpoint: Endpoint) -> Result<()> {
        match self.link.lock().await.as_ref() {
            Some(link) => link.subscribe(endpoint).await,
            None => Err(BipError::Disconnected),
        }
    }

    async fn unsubscribe(&self, endpoint: Endpoint) -> Result<()> {
        match self.link.lock().await.as_ref() {
            Some(link) => link.unsubscribe(endpoint).await,
            None => Err(BipError::Disconnected),
        }
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        match self.link.lock().await.as_ref() {
            Some(link) => link.notifications().await,
            None => Err(BipError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::encrypt_nonce,
        decoder::test_records::*,
        protocol::auth_response,
        transport::{mock::MockTransport, Notification},
        types::{FetchOutcome, WriteCapabilities},
    };
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";
    const NONCE: [u8; 16] = [0x5A; 16];

    fn device(transport: &Arc<MockTransport>) -> BipDevice {
        BipDevice::with_transport(
            transport.clone(),
            DeviceInfo::new("Amazfit Bip Watch".to_string(), "C8:0F:10:00:00:01".to_string(), -60),
            FetchConfig::default(),
        )
    }

    fn challenge() -> Vec<u8> {
        let mut frame = vec![0x10, 0x02, 0x01];
        frame.extend_from_slice(&NONCE);
        frame
    }

    fn telemetry_frames() -> Vec<Notification> {
        let telemetry = [
            timestamp(1_714_550_400_000),
            absolute(40.0, -3.0),
            heart_rate(0, 110),
            delta(10, 300, 300),
            heart_rate(0, 130),
        ]
        .concat();
        telemetry
            .chunks(12)
            .enumerate()
            .map(|(i, chunk)| {
                let mut frame = vec![i as u8];
                frame.extend_from_slice(chunk);
                Notification::new(Endpoint::Data, frame)
            })
            .collect()
    }

    /// A watch that accepts `KEY` and serves one short activity
    fn cooperative_watch() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::watch());
        let credential = Credential::from_hex(KEY).unwrap();
        let expected = auth_response(&encrypt_nonce(&credential, &NONCE)).to_vec();
        let transferring = AtomicBool::new(false);

        transport.respond_with(move |endpoint, data| match (endpoint, data) {
            (Endpoint::Auth, [0x02, 0x00]) => vec![Notification::new(Endpoint::Auth, challenge())],
            (Endpoint::Auth, response) if response == expected.as_slice() => {
                vec![Notification::new(Endpoint::Auth, vec![0x10, 0x03, 0x01])]
            }
            (Endpoint::Auth, _) => vec![Notification::new(Endpoint::Auth, vec![0x10, 0x03, 0x04])],
            (Endpoint::Control, [0x01, ..]) => vec![Notification::new(
                Endpoint::Control,
                vec![0x10, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00],
            )],
            (Endpoint::Control, [0x02]) if !transferring.swap(true, Ordering::SeqCst) => {
                let mut frames = telemetry_frames();
                frames.push(Notification::new(Endpoint::Control, vec![0x10, 0x02, 0x01]));
                frames
            }
            _ => Vec::new(),
        });
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_then_fetch() {
        let transport = cooperative_watch();
        let mut device = device(&transport);
        let mut events = device.subscribe_events();

        assert!(!device.is_authenticated().await);
        assert_ok!(device.authenticate_hex(KEY).await);
        assert!(device.is_authenticated().await);

        let summary = assert_ok!(device.fetch_activities().await);
        assert_eq!(summary.outcome, FetchOutcome::Completed);
        assert!(summary.is_real_data);
        assert_eq!(summary.position_points().count(), 2);
        assert_eq!(summary.avg_heart_rate, Some(120.0));

        let gpx = device.export_gpx(&summary);
        assert_eq!(gpx.matches("<trkpt ").count(), 2);

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::Completed(done) = event {
                assert_eq!(done.outcome, FetchOutcome::Completed);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_fetch_requires_authentication() {
        let transport = cooperative_watch();
        let device = device(&transport);

        let err = assert_err!(device.fetch_activities().await);
        assert!(matches!(err, BipError::NotAuthenticated));
        assert!(transport.written_to(Endpoint::Control).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_key_leaves_device_unauthenticated() {
        let transport = cooperative_watch();
        let device = device(&transport);

        let err = assert_err!(
            device
                .authenticate_hex("ffffffffffffffffffffffffffffffff")
                .await
        );
        assert!(matches!(err, BipError::AuthenticationFailed(_)));
        assert_eq!(device.handshake_state().await, HandshakeState::Failed);
        assert!(matches!(
            device.authenticate_hex("not hex").await,
            Err(BipError::InvalidCredential(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_fetch_is_rejected_and_cancel_finishes_first() {
        let transport = Arc::new(MockTransport::watch());
        let credential = Credential::from_hex(KEY).unwrap();
        let expected = auth_response(&encrypt_nonce(&credential, &NONCE)).to_vec();
        // authenticates, then never answers a fetch request
        transport.respond_with(move |endpoint, data| match (endpoint, data) {
            (Endpoint::Auth, [0x02, 0x00]) => vec![Notification::new(Endpoint::Auth, challenge())],
            (Endpoint::Auth, response) if response == expected.as_slice() => {
                vec![Notification::new(Endpoint::Auth, vec![0x10, 0x03, 0x01])]
            }
            _ => Vec::new(),
        });

        let device = Arc::new(device(&transport));
        assert_ok!(device.authenticate(&credential).await);
        assert!(!device.cancel_fetch().await);

        let running = tokio::spawn({
            let device = device.clone();
            async move { device.fetch_activities().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            device.fetch_activities().await,
            Err(BipError::FetchInProgress)
        ));
        assert!(device.cancel_fetch().await);

        let summary = assert_ok!(running.await.unwrap());
        assert_eq!(summary.outcome, FetchOutcome::Cancelled);
        assert_eq!(summary.bytes_received, 0);
        assert!(!device.cancel_fetch().await);
    }

    #[tokio::test]
    async fn test_sync_time_falls_back_to_shorter_format() {
        let transport = Arc::new(MockTransport::watch());
        let device = device(&transport);
        let now = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 30, 15)
            .unwrap();

        transport.fail_next_writes(1);
        assert_ok!(device.sync_time_to(now).await);

        let attempts = transport.writes();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].succeeded);
        assert_eq!(attempts[0].data.len(), 11);
        assert!(attempts[1].succeeded);
        assert_eq!(
            transport.written_to(Endpoint::Time),
            vec![vec![0xE8, 0x07, 5, 1, 8, 30, 15, 3, 0, 1]]
        );
    }

    #[tokio::test]
    async fn test_sync_time_gives_up_after_every_format() {
        let transport = Arc::new(MockTransport::watch());
        let device = device(&transport);

        transport.fail_next_writes(3);
        assert!(device.sync_time().await.is_err());
        assert!(transport.written_to(Endpoint::Time).is_empty());
    }

    #[tokio::test]
    async fn test_sync_time_without_time_endpoint_is_skipped() {
        let transport = Arc::new(MockTransport::new(
            EndpointSet::new()
                .with(Endpoint::Auth, WriteCapabilities::BOTH)
                .with(Endpoint::Control, WriteCapabilities::BOTH),
        ));
        let device = device(&transport);

        assert_ok!(device.sync_time().await);
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_resets_authentication() {
        let transport = cooperative_watch();
        let device = device(&transport);

        assert_ok!(device.authenticate_hex(KEY).await);
        assert_ok!(device.disconnect().await);
        assert!(!device.is_authenticated().await);
    }
}

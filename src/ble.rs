use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BipError, Result},
    transport::{EndpointSet, FrameTransport, Notification, NotificationStream},
    types::{ConnectionParams, DeviceInfo, Endpoint, WriteCapabilities, WriteMode},
    AUTH_CHAR_UUID, FALLBACK_CONTROL_CHAR_UUID, FETCH_CONTROL_CHAR_UUID, FETCH_DATA_CHAR_UUID,
    HUAMI_SERVICE_UUID, TIME_CHAR_UUID,
};

/// Advertised name fragments of supported watches
const NAME_HINTS: [&str; 2] = ["amazfit", "bip"];

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| BipError::Protocol(format!("Invalid {what} UUID: {e}")))
}

/// Map characteristic properties onto write capabilities
#[must_use]
pub fn capabilities_from_flags(flags: CharPropFlags) -> WriteCapabilities {
    WriteCapabilities {
        with_response: flags.contains(CharPropFlags::WRITE),
        without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

const fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::WithResponse => WriteType::WithResponse,
        WriteMode::WithoutResponse => WriteType::WithoutResponse,
    }
}

/// Characteristic UUIDs for each endpoint
fn endpoint_uuids() -> Result<[(Endpoint, Uuid); 4]> {
    Ok([
        (Endpoint::Auth, parse_uuid(AUTH_CHAR_UUID, "auth characteristic")?),
        (
            Endpoint::Control,
            parse_uuid(FETCH_CONTROL_CHAR_UUID, "fetch control characteristic")?,
        ),
        (
            Endpoint::Data,
            parse_uuid(FETCH_DATA_CHAR_UUID, "fetch data characteristic")?,
        ),
        (Endpoint::Time, parse_uuid(TIME_CHAR_UUID, "time characteristic")?),
    ])
}

/// Pick the characteristic for every endpoint among all discovered ones
fn resolve_endpoints<'a>(
    characteristics: impl IntoIterator<Item = &'a Characteristic>,
) -> Result<HashMap<Endpoint, Characteristic>> {
    let wanted = endpoint_uuids()?;
    let fallback_control =
        parse_uuid(FALLBACK_CONTROL_CHAR_UUID, "fallback control characteristic")?;

    let mut resolved = HashMap::new();
    let mut fallback = None;
    for characteristic in characteristics {
        if let Some((endpoint, _)) = wanted.iter().find(|(_, uuid)| *uuid == characteristic.uuid) {
            resolved
                .entry(*endpoint)
                .or_insert_with(|| characteristic.clone());
        } else if characteristic.uuid == fallback_control {
            fallback = Some(characteristic.clone());
        }
    }

    if !resolved.contains_key(&Endpoint::Control) {
        if let Some(characteristic) = fallback {
            warn!("Fetch control characteristic missing, using {}", characteristic.uuid);
            resolved.insert(Endpoint::Control, characteristic);
        }
    }
    Ok(resolved)
}

/// BLE manager for Amazfit watch discovery and connection
pub struct BleManager {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleManager {
    /// Create a new BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`BipError::Ble`] if the Bluetooth adapter cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Scan for Amazfit watches
    ///
    /// # Errors
    ///
    /// Returns [`BipError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`BipError::Ble`] for other Bluetooth-related errors.
    pub async fn scan_for_devices(&self, params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for Amazfit watches...");

        let adapters = self.manager.adapters().await?;
        let Some(central) = adapters.first() else {
            return Err(BipError::DeviceNotFound);
        };

        let scan_filter = ScanFilter {
            services: vec![parse_uuid(HUAMI_SERVICE_UUID, "service")?],
        };
        central.start_scan(scan_filter).await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Some(device_info) = Self::watch_info(&peripheral, params).await else {
                continue;
            };
            info!(
                "Found watch: {} ({}, {} dBm)",
                device_info.name, device_info.address, device_info.rssi
            );
            self.peripherals
                .lock()
                .await
                .insert(device_info.address.clone(), peripheral);
            devices.push(device_info);
        }

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        info!("Scan completed. Found {} watch(es)", devices.len());
        Ok(devices)
    }

    /// Connect to a watch found by [`BleManager::scan_for_devices`]
    ///
    /// # Errors
    ///
    /// Returns [`BipError::DeviceNotFound`] if the watch was not seen during the scan,
    /// [`BipError::Timeout`] if connecting takes too long,
    /// or [`BipError::ConnectionFailed`] if the link cannot be established.
    pub async fn connect_to_device(
        &self,
        device_info: &DeviceInfo,
        params: &ConnectionParams,
    ) -> Result<BleTransport> {
        info!("Connecting to watch: {}", device_info.name);

        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&device_info.address)
            .cloned()
            .ok_or(BipError::DeviceNotFound)?;

        timeout(Duration::from_millis(params.timeout_ms), peripheral.connect())
            .await
            .map_err(|_| BipError::Timeout {
                operation: "connect",
                timeout_ms: params.timeout_ms,
            })?
            .map_err(|e| BipError::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let transport = BleTransport::new(peripheral)?;
        info!("Successfully connected to {}", device_info.name);
        Ok(transport)
    }

    /// Device info for a peripheral that looks like a supported watch
    async fn watch_info(peripheral: &Peripheral, params: &ConnectionParams) -> Option<DeviceInfo> {
        let properties = peripheral.properties().await.ok()??;
        let name = properties.local_name.clone().unwrap_or_default();
        let lower = name.to_lowercase();

        if let Some(filter) = &params.name_filter {
            if !lower.contains(&filter.to_lowercase()) {
                return None;
            }
        } else if !NAME_HINTS.iter().any(|hint| lower.contains(hint)) {
            return None;
        }

        Some(DeviceInfo::new(
            name,
            properties.address.to_string(),
            properties.rssi.unwrap_or(0),
        ))
    }
}

/// Connected watch exposed through [`FrameTransport`]
pub struct BleTransport {
    peripheral: Peripheral,
    characteristics: HashMap<Endpoint, Characteristic>,
    endpoints: EndpointSet,
}

impl BleTransport {
    /// Resolve the endpoints of an already connected peripheral
    ///
    /// # Errors
    ///
    /// Returns [`BipError::Protocol`] if the built-in UUIDs cannot be parsed.
    pub fn new(peripheral: Peripheral) -> Result<Self> {
        let characteristics = resolve_endpoints(&peripheral.characteristics())?;

        let mut endpoints = EndpointSet::new();
        for (endpoint, characteristic) in &characteristics {
            let capabilities = capabilities_from_flags(characteristic.properties);
            debug!(
                "Endpoint {} -> {} ({:?})",
                endpoint, characteristic.uuid, characteristic.properties
            );
            endpoints.insert(*endpoint, capabilities);
        }
        for endpoint in [Endpoint::Auth, Endpoint::Control, Endpoint::Data, Endpoint::Time] {
            if !endpoints.contains(endpoint) {
                warn!("Watch does not expose the {} endpoint", endpoint);
            }
        }

        Ok(Self {
            peripheral,
            characteristics,
            endpoints,
        })
    }

    fn characteristic(&self, endpoint: Endpoint) -> Result<&Characteristic> {
        self.characteristics
            .get(&endpoint)
            .ok_or(BipError::MissingEndpoint { endpoint })
    }

    /// Check if the watch is still connected
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Disconnect from the watch
    ///
    /// A link that already dropped is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`BipError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.is_connected().await {
            debug!("Link already down");
            return Ok(());
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl FrameTransport for BleTransport {
    fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    async fn write(&self, endpoint: Endpoint, data: &[u8], mode: WriteMode) -> Result<()> {
        let characteristic = self.characteristic(endpoint)?;
        self.peripheral
            .write(characteristic, data, write_type(mode))
            .await
            .map_err(|e| BipError::Transport(format!("write to {endpoint} failed: {e}")))
    }

    async fn subscribe(&self, endpoint: Endpoint) -> Result<()> {
        let characteristic = self.characteristic(endpoint)?;
        self.peripheral
            .subscribe(characteristic)
            .await
            .map_err(|e| BipError::Transport(format!("subscribe to {endpoint} failed: {e}")))
    }

    async fn unsubscribe(&self, endpoint: Endpoint) -> Result<()> {
        let characteristic = self.characteristic(endpoint)?;
        self.peripheral
            .unsubscribe(characteristic)
            .await
            .map_err(|e| BipError::Transport(format!("unsubscribe from {endpoint} failed: {e}")))
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let routes: HashMap<Uuid, Endpoint> = self
            .characteristics
            .iter()
            .map(|(endpoint, characteristic)| (characteristic.uuid, *endpoint))
            .collect();

        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .filter_map(move |notification| {
                let routed = routes
                    .get(&notification.uuid)
                    .map(|endpoint| Notification::new(*endpoint, notification.value));
                futures::future::ready(routed)
            })
            .boxed())
    }
}

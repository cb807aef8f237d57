use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bluer::gatt::remote::{Characteristic as GattCharacteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::connection::{GattLink, NotificationHandler};
use crate::errors::ConnectionError;
use crate::protocol::{is_capture_service, Characteristic};

const SCAN_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const RESOLVE_TIMEOUT_SECS: u64 = 10;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;
const RESOLVE_POLL_MS: u64 = 100;

/// Opens GATT links to the gesture sensor through BlueZ.
///
/// Discovery and connection are retried with exponential backoff; no pairing
/// is needed, the sketch accepts any central.
#[derive(Debug, Clone)]
pub struct BluezConnector {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub resolve_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluezConnector {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            resolve_timeout: Duration::from_secs(RESOLVE_TIMEOUT_SECS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BluezConnector {
    /// Scan for a device whose advertised name starts with `name_prefix` and
    /// return its address.
    pub async fn discover(&self, name_prefix: &str) -> Result<String, ConnectionError> {
        let session = Session::new().await.map_err(connect_failed)?;
        let adapter = powered_adapter(&session).await?;
        info!("scanning for device: name_prefix={}", name_prefix);

        let found = tokio::time::timeout(self.scan_timeout, async {
            let events = adapter.discover_devices().await.map_err(connect_failed)?;
            pin_mut!(events);
            while let Some(evt) = events.next().await {
                let AdapterEvent::DeviceAdded(addr) = evt else {
                    continue;
                };
                let Ok(device) = adapter.device(addr) else {
                    continue;
                };
                if let Ok(Some(name)) = device.name().await {
                    debug!("device seen: mac={}, name={}", addr, name);
                    if name.starts_with(name_prefix) {
                        info!("device discovered: mac={}, name={}", addr, name);
                        return Ok(addr);
                    }
                }
            }
            Err(ConnectionError::DeviceNotFound {
                target: name_prefix.to_string(),
            })
        })
        .await
        .map_err(|_| ConnectionError::DeviceNotFound {
            target: name_prefix.to_string(),
        })??;

        Ok(found.to_string())
    }

    /// Connect to `address` and resolve the capture characteristics.
    ///
    /// `timeout` bounds each individual connection attempt.
    pub async fn connect(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<BluezLink, ConnectionError> {
        let addr: Address = address
            .parse()
            .map_err(|_| ConnectionError::ConnectFailed(format!("invalid address: {address}")))?;

        let session = Session::new().await.map_err(connect_failed)?;
        let adapter = powered_adapter(&session).await?;

        wait_for_device(&adapter, addr, self.scan_timeout).await?;
        let device = adapter.device(addr).map_err(connect_failed)?;

        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying GATT connection after {:?} (mac={}, attempt={})",
                    delay, address, attempt
                );
                tokio::time::sleep(delay).await;
            }

            match connect_device(&device, timeout).await {
                Ok(()) => {
                    info!("GATT connection established: mac={}", address);
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "GATT connection attempt failed: mac={}, attempt={}, error={}",
                        address, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }

        let resolved =
            tokio::time::timeout(self.resolve_timeout, resolve_characteristics(&device)).await;
        let characteristics = match resolved {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                let _ = device.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                let _ = device.disconnect().await;
                return Err(ConnectionError::ConnectFailed(
                    "GATT services not resolved in time".into(),
                ));
            }
        };

        let connected = Arc::new(AtomicBool::new(true));
        let watcher = spawn_connection_watcher(&device, Arc::clone(&connected)).await;

        Ok(BluezLink {
            address: address.to_string(),
            _session: session,
            device,
            characteristics,
            connected,
            pumps: Mutex::new(HashMap::new()),
            watcher,
        })
    }
}

/// A live GATT connection to the sensor.
pub struct BluezLink {
    address: String,
    _session: Session,
    device: Device,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
    connected: Arc<AtomicBool>,
    pumps: Mutex<HashMap<Characteristic, JoinHandle<()>>>,
    watcher: Option<JoinHandle<()>>,
}

impl BluezLink {
    fn characteristic(
        &self,
        characteristic: Characteristic,
    ) -> Result<&GattCharacteristic, ConnectionError> {
        self.characteristics.get(&characteristic).ok_or_else(|| {
            ConnectionError::ConnectFailed(format!("{:?} characteristic not found", characteristic))
        })
    }

    fn pumps(&self) -> MutexGuard<'_, HashMap<Characteristic, JoinHandle<()>>> {
        self.pumps.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_pumps(&self) {
        for (_, pump) in self.pumps().drain() {
            pump.abort();
        }
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        self.stop_pumps();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl GattLink for BluezLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        characteristic: Characteristic,
        handler: NotificationHandler,
    ) -> Result<(), ConnectionError> {
        let gatt = self.characteristic(characteristic)?;
        let stream = gatt
            .notify()
            .await
            .map_err(|e| ConnectionError::SubscribeFailed {
                characteristic,
                reason: e.to_string(),
            })?;

        let pump = tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                handler(&value);
            }
            debug!("notification stream ended: characteristic={:?}", characteristic);
        });

        if let Some(previous) = self.pumps().insert(characteristic, pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Characteristic) -> Result<(), ConnectionError> {
        // Dropping the notify stream stops notifications at BlueZ.
        if let Some(pump) = self.pumps().remove(&characteristic) {
            pump.abort();
        }
        Ok(())
    }

    async fn write(
        &self,
        characteristic: Characteristic,
        value: &[u8],
        require_ack: bool,
    ) -> Result<(), ConnectionError> {
        let gatt = self.characteristic(characteristic)?;
        let mut req = CharacteristicWriteRequest::default();
        req.op_type = if require_ack {
            WriteOp::Request
        } else {
            WriteOp::Command
        };
        gatt.write_ext(value, &req)
            .await
            .map_err(|e| ConnectionError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.stop_pumps();
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.device
            .disconnect()
            .await
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))
    }
}

fn connect_failed(e: bluer::Error) -> ConnectionError {
    ConnectionError::ConnectFailed(e.to_string())
}

async fn powered_adapter(session: &Session) -> Result<Adapter, ConnectionError> {
    let adapter = session.default_adapter().await.map_err(connect_failed)?;
    adapter.set_powered(true).await.map_err(connect_failed)?;
    Ok(adapter)
}

async fn wait_for_device(
    adapter: &Adapter,
    address: Address,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let not_found = || ConnectionError::DeviceNotFound {
        target: address.to_string(),
    };

    tokio::time::timeout(timeout, async {
        let events = adapter.discover_devices().await.map_err(connect_failed)?;
        pin_mut!(events);
        while let Some(evt) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = evt {
                if addr == address {
                    info!("device discovered: mac={}", addr);
                    return Ok(());
                }
            }
        }
        Err(not_found())
    })
    .await
    .map_err(|_| not_found())?
}

async fn connect_device(device: &Device, timeout: Duration) -> Result<(), ConnectionError> {
    if device.is_connected().await.unwrap_or(false) {
        return Ok(());
    }
    tokio::time::timeout(timeout, device.connect())
        .await
        .map_err(|_| ConnectionError::ConnectFailed("GATT connect timed out".into()))?
        .map_err(connect_failed)
}

async fn resolve_characteristics(
    device: &Device,
) -> Result<HashMap<Characteristic, GattCharacteristic>, ConnectionError> {
    while !device.is_services_resolved().await.map_err(connect_failed)? {
        tokio::time::sleep(Duration::from_millis(RESOLVE_POLL_MS)).await;
    }

    let mut found = HashMap::new();
    for service in device.services().await.map_err(connect_failed)? {
        let service_uuid = service.uuid().await.map_err(connect_failed)?;
        if !is_capture_service(&service_uuid.to_string()) {
            continue;
        }
        for gatt in service.characteristics().await.map_err(connect_failed)? {
            let uuid = gatt.uuid().await.map_err(connect_failed)?;
            if let Some(characteristic) = Characteristic::from_uuid(&uuid.to_string()) {
                debug!("characteristic resolved: {:?} ({})", characteristic, uuid);
                found.insert(characteristic, gatt);
            }
        }
    }

    for characteristic in Characteristic::ALL {
        if !found.contains_key(&characteristic) {
            return Err(ConnectionError::ConnectFailed(format!(
                "{:?} characteristic ({}) not offered by device",
                characteristic,
                characteristic.uuid()
            )));
        }
    }
    Ok(found)
}

/// Track link loss reported by BlueZ.
async fn spawn_connection_watcher(
    device: &Device,
    connected: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("could not watch device events: {}", e);
            return None;
        }
    };
    let address = device.address();
    Some(tokio::spawn(async move {
        pin_mut!(events);
        while let Some(DeviceEvent::PropertyChanged(prop)) = events.next().await {
            if let DeviceProperty::Connected(false) = prop {
                warn!("link lost: mac={}", address);
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }
    }))
}

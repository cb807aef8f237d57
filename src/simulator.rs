//! In-process stand-in for the sensor board.
//!
//! [`SimulatedLink`] implements [`GattLink`] without any radio: subscriptions
//! are kept in a table, and writing `StartCapture` to the command
//! characteristic replays a script of notifications from a spawned task, the
//! way the sketch answers over the air. The default script mirrors the real
//! device: `Busy` on the command characteristic, a three-step countdown one
//! second apart, `Capturing`, 42 chunks of three samples, `Complete`, then
//! `Idle`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::connection::{GattLink, NotificationHandler};
use crate::errors::ConnectionError;
use crate::protocol::{
    encode_accel_chunk, Characteristic, Command, Sample, Status, EXPECTED_CHUNKS,
    SAMPLES_PER_CHUNK,
};

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);
const CHUNK_INTERVAL: Duration = Duration::from_millis(20);

/// Order in which the simulated device sends its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryOrder {
    #[default]
    InOrder,
    Reversed,
    /// Odd sequence numbers first, then even ones.
    Interleaved,
}

/// What the device does after the last chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ending {
    #[default]
    Complete,
    Error,
    /// Never sends a terminal status.
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub countdown_step: Duration,
    pub chunk_interval: Duration,
    pub chunks: usize,
    pub samples_per_chunk: usize,
    pub order: DeliveryOrder,
    pub ending: Ending,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            countdown_step: COUNTDOWN_STEP,
            chunk_interval: CHUNK_INTERVAL,
            chunks: EXPECTED_CHUNKS,
            samples_per_chunk: SAMPLES_PER_CHUNK,
            order: DeliveryOrder::InOrder,
            ending: Ending::Complete,
        }
    }
}

/// One scripted action of the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Notify {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    Pause(Duration),
}

impl Step {
    pub fn status(status: Status) -> Self {
        Step::Notify {
            characteristic: Characteristic::Status,
            data: vec![status.as_byte()],
        }
    }

    pub fn command(command: Command) -> Self {
        Step::Notify {
            characteristic: Characteristic::Command,
            data: vec![command.as_byte()],
        }
    }

    pub fn accel(data: Vec<u8>) -> Self {
        Step::Notify {
            characteristic: Characteristic::AccelData,
            data,
        }
    }
}

/// Deterministic wrist-motion-like trace: a slow loop in x/y over gravity on z.
pub fn synthetic_samples(n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| {
            let t = i as f64 / 20.0;
            Sample::new(0.8 * t.sin(), 0.6 * (2.0 * t).cos(), 1.0 - 0.1 * t.sin())
        })
        .collect()
}

/// Build the notification script for one gesture.
pub fn gesture_script(config: &SimulatorConfig) -> Vec<Step> {
    let mut steps = vec![Step::command(Command::Busy)];
    for status in [Status::Countdown3, Status::Countdown2, Status::Countdown1] {
        steps.push(Step::status(status));
        steps.push(Step::Pause(config.countdown_step));
    }
    steps.push(Step::status(Status::Capturing));

    let samples = synthetic_samples(config.chunks * config.samples_per_chunk);
    for seq in delivery_order(config.order, config.chunks) {
        let start = seq * config.samples_per_chunk;
        let end = (start + config.samples_per_chunk).min(samples.len());
        let chunk = samples.get(start..end).unwrap_or(&[]);
        steps.push(Step::accel(encode_accel_chunk(seq as u8, chunk)));
        if !config.chunk_interval.is_zero() {
            steps.push(Step::Pause(config.chunk_interval));
        }
    }

    match config.ending {
        Ending::Complete => steps.push(Step::status(Status::Complete)),
        Ending::Error => steps.push(Step::status(Status::Error)),
        Ending::Silent => return steps,
    }
    steps.push(Step::command(Command::Idle));
    steps
}

fn delivery_order(order: DeliveryOrder, n: usize) -> Vec<usize> {
    match order {
        DeliveryOrder::InOrder => (0..n).collect(),
        DeliveryOrder::Reversed => (0..n).rev().collect(),
        DeliveryOrder::Interleaved => (1..n).step_by(2).chain((0..n).step_by(2)).collect(),
    }
}

// ============================================================================
// Simulated link
// ============================================================================

#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<Characteristic, NotificationHandler>>,
}

impl Shared {
    fn handlers(&self) -> MutexGuard<'_, HashMap<Characteristic, NotificationHandler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, characteristic: Characteristic, data: &[u8]) -> bool {
        let handler = self.handlers().get(&characteristic).cloned();
        match handler {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }
}

/// A [`GattLink`] backed by a scripted, in-process device.
pub struct SimulatedLink {
    address: String,
    connected: AtomicBool,
    reject_writes: AtomicBool,
    shared: Arc<Shared>,
    script: Mutex<Vec<Step>>,
    writes: Mutex<Vec<Vec<u8>>>,
    playback: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedLink {
    /// A connected device that answers `StartCapture` with the default gesture script.
    pub fn new(address: &str) -> Self {
        Self::with_script(address, gesture_script(&SimulatorConfig::default()))
    }

    pub fn with_config(address: &str, config: &SimulatorConfig) -> Self {
        Self::with_script(address, gesture_script(config))
    }

    pub fn with_script(address: &str, script: Vec<Step>) -> Self {
        Self {
            address: address.to_string(),
            connected: AtomicBool::new(true),
            reject_writes: AtomicBool::new(false),
            shared: Arc::new(Shared::default()),
            script: Mutex::new(script),
            writes: Mutex::new(Vec::new()),
            playback: Mutex::new(None),
        }
    }

    /// Make every subsequent write fail at the transport.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_playback();
    }

    /// Deliver a notification immediately, as if the device had sent it.
    /// Returns false if nothing is subscribed to `characteristic`.
    pub fn notify(&self, characteristic: Characteristic, data: &[u8]) -> bool {
        self.shared.deliver(characteristic, data)
    }

    pub fn is_subscribed(&self, characteristic: Characteristic) -> bool {
        self.shared.handlers().contains_key(&characteristic)
    }

    /// Values written to the command characteristic so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until the current playback, if any, has delivered its last step.
    pub async fn playback_finished(&self) {
        let handle = self
            .playback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn start_playback(&self) {
        let steps = self.script.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let shared = Arc::clone(&self.shared);
        let address = self.address.clone();
        let handle = tokio::spawn(async move {
            debug!(
                "simulated playback started: address={}, steps={}",
                address,
                steps.len()
            );
            for step in steps {
                match step {
                    Step::Pause(d) => tokio::time::sleep(d).await,
                    Step::Notify {
                        characteristic,
                        data,
                    } => {
                        if !shared.deliver(characteristic, &data) {
                            debug!("notification lost (not subscribed): {:?}", characteristic);
                        }
                    }
                }
            }
        });

        let previous = self
            .playback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_playback(&self) {
        let handle = self
            .playback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        self.stop_playback();
    }
}

impl GattLink for SimulatedLink {
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
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.shared.handlers().insert(characteristic, handler);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Characteristic) -> Result<(), ConnectionError> {
        self.shared.handlers().remove(&characteristic);
        Ok(())
    }

    async fn write(
        &self,
        characteristic: Characteristic,
        value: &[u8],
        _require_ack: bool,
    ) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ConnectionError::WriteFailed(
                "simulated device rejected the write".into(),
            ));
        }
        if characteristic != Characteristic::Command {
            return Err(ConnectionError::WriteFailed(format!(
                "{:?} is not writable",
                characteristic
            )));
        }

        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(value.to_vec());

        match value.first().copied().and_then(Command::from_byte) {
            Some(Command::StartCapture) => {
                info!("simulated device starting capture: address={}", self.address);
                self.start_playback();
            }
            other => debug!("simulated device ignoring command: {:?}", other),
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_playback();
        self.shared.handlers().clear();
        Ok(())
    }
}

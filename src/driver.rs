//! One capture attempt, end to end.
//!
//! [`run_capture`] wires a fresh [`CaptureSession`] to the link's notification
//! characteristics, sends `StartCapture`, waits for the session to close and
//! always tears the subscriptions down again before mapping the outcome to a
//! [`Capture`] or a [`CaptureError`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionManager, GattLink, NotificationHandler};
use crate::errors::{CaptureError, ConnectionError, Result};
use crate::protocol::{encode_start_command, Characteristic, Sample, Status, EXPECTED_CHUNKS};
use crate::session::{CaptureSession, SessionOutcome, StatusObserver};

/// Time allowed from the start command to a terminal status.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Settings for a capture attempt.
#[derive(Clone)]
pub struct CaptureConfig {
    pub timeout: Duration,
    /// Chunks the device is expected to send; used for gap reporting only.
    pub expected_chunks: usize,
    /// Receives countdown/capturing/complete statuses as they arrive.
    pub observer: Option<StatusObserver>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            expected_chunks: EXPECTED_CHUNKS,
            observer: None,
        }
    }
}

impl fmt::Debug for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureConfig")
            .field("timeout", &self.timeout)
            .field("expected_chunks", &self.expected_chunks)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl CaptureConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }
}

/// A finished gesture.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Samples in the order the device recorded them.
    pub samples: Vec<Sample>,
    /// Wall-clock completion time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Time from just before the start command to the terminal status.
    pub elapsed: Duration,
}

impl Capture {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The samples split into equal-length x, y and z series.
    pub fn axes(&self) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut x = Vec::with_capacity(self.len());
        let mut y = Vec::with_capacity(self.len());
        let mut z = Vec::with_capacity(self.len());
        for s in &self.samples {
            x.push(s.x);
            y.push(s.y);
            z.push(s.z);
        }
        (x, y, z)
    }

    /// The persisted form of this capture for the given attempt number.
    pub fn to_record(&self, attempt: u32) -> CaptureRecord {
        let (x, y, z) = self.axes();
        CaptureRecord {
            attempt,
            timestamp: self.timestamp_ms,
            samples: self.len(),
            x,
            y,
            z,
        }
    }
}

/// One attempt as stored per letter label by the dataset writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub attempt: u32,
    pub timestamp: u64,
    pub samples: usize,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

/// Run one capture on `manager`.
///
/// Fails with [`CaptureError::Busy`] if another capture holds the link. The
/// acceleration and status subscriptions are removed before returning, on
/// every path.
pub async fn run_capture<L: GattLink>(
    manager: &ConnectionManager<L>,
    config: &CaptureConfig,
) -> Result<Capture> {
    let _slot = manager.begin_capture()?;

    let mut session = CaptureSession::new().with_expected_chunks(config.expected_chunks);
    if let Some(observer) = &config.observer {
        session = session.with_observer(Arc::clone(observer));
    }
    let session = Arc::new(session);

    if let Err(e) = subscribe_session(manager, &session).await {
        unsubscribe_session(manager).await;
        return Err(e.into());
    }

    session.begin();
    let command = encode_start_command();
    if let Err(e) = manager
        .write_command(Characteristic::Command, &command, true)
        .await
    {
        warn!("start command failed: address={}, error={}", manager.address(), e);
        unsubscribe_session(manager).await;
        return Err(match e {
            ConnectionError::WriteFailed(reason) => CaptureError::WriteFailed(reason),
            other => CaptureError::WriteFailed(other.to_string()),
        });
    }
    info!(
        "start command sent: address={}, timeout={:?}",
        manager.address(),
        config.timeout
    );

    let outcome = session.wait(config.timeout).await;
    unsubscribe_session(manager).await;

    match outcome {
        SessionOutcome::Complete(samples) if samples.is_empty() => {
            warn!("device completed without sending samples");
            Err(CaptureError::MalformedStream)
        }
        SessionOutcome::Complete(samples) => Ok(Capture {
            samples,
            timestamp_ms: now_ms(),
            elapsed: session.elapsed(),
        }),
        SessionOutcome::TimedOut => Err(CaptureError::Timeout {
            after: config.timeout,
        }),
        SessionOutcome::DeviceError => Err(CaptureError::DeviceReportedError),
    }
}

async fn subscribe_session<L: GattLink>(
    manager: &ConnectionManager<L>,
    session: &Arc<CaptureSession>,
) -> std::result::Result<(), ConnectionError> {
    let accel = Arc::clone(session);
    let on_accel: NotificationHandler = Arc::new(move |data: &[u8]| {
        accel.on_accel_notification(data);
    });
    manager
        .subscribe(Characteristic::AccelData, on_accel)
        .await?;

    let status = Arc::clone(session);
    let on_status: NotificationHandler = Arc::new(move |data: &[u8]| {
        status.on_status_notification(data);
    });
    manager.subscribe(Characteristic::Status, on_status).await?;

    // Busy/Idle reports are informational; capture proceeds without them.
    let command = Arc::clone(session);
    let on_command: NotificationHandler = Arc::new(move |data: &[u8]| {
        command.on_command_notification(data);
    });
    if let Err(e) = manager.subscribe(Characteristic::Command, on_command).await {
        debug!(
            "command notifications unavailable: address={}, error={}",
            manager.address(),
            e
        );
    }
    Ok(())
}

async fn unsubscribe_session<L: GattLink>(manager: &ConnectionManager<L>) {
    futures::join!(
        manager.unsubscribe(Characteristic::AccelData),
        manager.unsubscribe(Characteristic::Status),
        manager.unsubscribe(Characteristic::Command)
    );
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::protocol::encode_accel_chunk;
    use crate::simulator::{DeliveryOrder, Ending, SimulatedLink, SimulatorConfig, Step};

    const ADDRESS: &str = "30:C6:F7:02:AA:C6";

    fn manager_with(config: SimulatorConfig) -> ConnectionManager<SimulatedLink> {
        ConnectionManager::new(SimulatedLink::with_config(ADDRESS, &config))
    }

    fn assert_unsubscribed(manager: &ConnectionManager<SimulatedLink>) {
        assert!(manager.active_subscriptions().is_empty());
        assert!(!manager.link().is_subscribed(Characteristic::AccelData));
        assert!(!manager.link().is_subscribed(Characteristic::Status));
        assert!(!manager.link().is_subscribed(Characteristic::Command));
        assert!(!manager.capture_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn full_gesture_yields_126_ordered_samples() {
        let manager = manager_with(SimulatorConfig::default());

        let capture = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap();

        assert_eq!(capture.len(), 126);
        assert_eq!(manager.link().writes(), vec![vec![1]]);
        assert_unsubscribed(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_order_does_not_change_result() {
        let in_order = run_capture(
            &manager_with(SimulatorConfig::default()),
            &CaptureConfig::default(),
        )
        .await
        .unwrap();

        for order in [DeliveryOrder::Reversed, DeliveryOrder::Interleaved] {
            let manager = manager_with(SimulatorConfig {
                order,
                ..SimulatorConfig::default()
            });
            let capture = run_capture(&manager, &CaptureConfig::default())
                .await
                .unwrap();
            assert_eq!(capture.samples, in_order.samples, "order {:?}", order);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_after_deadline() {
        let manager = manager_with(SimulatorConfig {
            ending: Ending::Silent,
            ..SimulatorConfig::default()
        });
        let started = Instant::now();

        let err = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CaptureError::Timeout {
                after: DEFAULT_TIMEOUT
            }
        );
        let waited = started.elapsed();
        assert!(waited >= DEFAULT_TIMEOUT);
        assert!(waited < DEFAULT_TIMEOUT + Duration::from_secs(1));
        assert_unsubscribed(&manager);
        assert!(!manager.link().notify(Characteristic::Status, &[5]));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_without_chunks_is_malformed_stream() {
        let manager = ConnectionManager::new(SimulatedLink::with_script(
            ADDRESS,
            vec![Step::status(Status::Capturing), Step::status(Status::Complete)],
        ));

        let err = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err, CaptureError::MalformedStream);
        assert_unsubscribed(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_noise_is_not_a_capture() {
        let manager = ConnectionManager::new(SimulatedLink::with_script(
            ADDRESS,
            vec![
                Step::status(Status::Countdown3),
                Step::accel(encode_accel_chunk(0, &[Sample::new(9.0, 9.0, 9.0)])),
                Step::status(Status::Complete),
            ],
        ));

        let err = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err, CaptureError::MalformedStream);
        assert_unsubscribed(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_covers_countdown_and_streaming() {
        let manager = manager_with(SimulatorConfig::default());

        let capture = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap();

        // 3 countdown steps of 1 s, then 42 chunks 20 ms apart.
        let expected = Duration::from_millis(3_000 + 42 * 20);
        assert!(capture.elapsed >= expected, "{:?}", capture.elapsed);
        assert!(capture.elapsed < expected + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_is_reported() {
        let manager = manager_with(SimulatorConfig {
            ending: Ending::Error,
            ..SimulatorConfig::default()
        });

        let err = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err, CaptureError::DeviceReportedError);
        assert_unsubscribed(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_start_command_fails_without_waiting() {
        let manager = manager_with(SimulatorConfig::default());
        manager.link().reject_writes(true);
        let started = Instant::now();

        let err = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::WriteFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_unsubscribed(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_fails_at_subscribe() {
        let manager = manager_with(SimulatorConfig::default());
        manager.link().drop_link();

        let err = run_capture(&manager, &CaptureConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err, CaptureError::Link(ConnectionError::NotConnected));
        assert_unsubscribed(&manager);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_capture_on_same_link_is_rejected() {
        let manager = manager_with(SimulatorConfig::default());
        let config = CaptureConfig::default();

        let (first, second) = tokio::join!(
            run_capture(&manager, &config),
            run_capture(&manager, &config)
        );

        assert_eq!(first.unwrap().len(), 126);
        assert_eq!(second.unwrap_err(), CaptureError::Busy);
        assert_eq!(manager.link().writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_is_reusable_across_attempts() {
        let manager = manager_with(SimulatorConfig::default());
        for _ in 0..3 {
            let capture = run_capture(&manager, &CaptureConfig::default())
                .await
                .unwrap();
            assert_eq!(capture.len(), 126);
        }
        assert_eq!(manager.link().writes().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_handshake_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config =
            CaptureConfig::default().with_observer(move |s| sink.lock().unwrap().push(s));
        let manager = manager_with(SimulatorConfig::default());

        run_capture(&manager, &config).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Status::Countdown3,
                Status::Countdown2,
                Status::Countdown1,
                Status::Capturing,
                Status::Complete
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn command_reports_are_followed_during_capture() {
        let manager = Arc::new(manager_with(SimulatorConfig::default()));
        let watcher = Arc::clone(&manager);
        let followed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&followed);
        let config = CaptureConfig::default().with_observer(move |s| {
            if s == Status::Capturing {
                let link = watcher.link();
                flag.store(link.is_subscribed(Characteristic::Command), Ordering::SeqCst);
            }
        });

        run_capture(manager.as_ref(), &config).await.unwrap();

        assert!(followed.load(Ordering::SeqCst));
        assert_unsubscribed(&manager);
    }

    #[test]
    fn record_splits_axes_with_dataset_field_names() {
        let capture = Capture {
            samples: vec![Sample::new(0.1, 0.2, 0.3), Sample::new(-1.0, 0.0, 1.0)],
            timestamp_ms: 1_700_000_000_000,
            elapsed: Duration::from_secs(2),
        };
        let record = capture.to_record(4);
        assert_eq!(record.x, vec![0.1, -1.0]);
        assert_eq!(record.y, vec![0.2, 0.0]);
        assert_eq!(record.z, vec![0.3, 1.0]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["attempt"], 4);
        assert_eq!(json["timestamp"], 1_700_000_000_000u64);
        assert_eq!(json["samples"], 2);
        assert_eq!(json["x"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn config_debug_hides_observer() {
        let config = CaptureConfig::default().with_observer(|_| {});
        let text = format!("{:?}", config);
        assert!(text.contains("observer: true"));
        assert!(text.contains("15s"));
    }
}

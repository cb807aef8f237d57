//! Ownership of the device link.
//!
//! [`GattLink`] is the transport seam: BlueZ in production
//! ([`BluezLink`](crate::bluetooth::BluezLink), feature `bluez`) and the
//! in-process [`SimulatedLink`](crate::simulator::SimulatedLink) otherwise.
//! [`ConnectionManager`] wraps one link and adds the bookkeeping the capture
//! driver relies on: the set of active subscriptions, idempotent teardown,
//! and the single capture slot.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::errors::{CaptureError, ConnectionError};
use crate::protocol::Characteristic;

/// Callback run once per notification, on the transport's delivery context.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A connected GATT peripheral exposing the capture characteristics.
pub trait GattLink: Send + Sync {
    fn address(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Enable notifications and route each one to `handler`.
    fn subscribe(
        &self,
        characteristic: Characteristic,
        handler: NotificationHandler,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn unsubscribe(
        &self,
        characteristic: Characteristic,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Write `value`; `require_ack` selects write-with-response.
    fn write(
        &self,
        characteristic: Characteristic,
        value: &[u8],
        require_ack: bool,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Owner of one device link.
pub struct ConnectionManager<L: GattLink> {
    link: L,
    subscriptions: Mutex<HashSet<Characteristic>>,
    capture_active: AtomicBool,
    closed: AtomicBool,
}

impl<L: GattLink> ConnectionManager<L> {
    pub fn new(link: L) -> Self {
        info!("link ready: address={}", link.address());
        Self {
            link,
            subscriptions: Mutex::new(HashSet::new()),
            capture_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn address(&self) -> &str {
        self.link.address()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.link.is_connected()
    }

    /// Characteristics with notifications currently enabled.
    pub fn active_subscriptions(&self) -> Vec<Characteristic> {
        let mut active: Vec<_> = self.lock_subscriptions().iter().copied().collect();
        active.sort();
        active
    }

    pub async fn subscribe(
        &self,
        characteristic: Characteristic,
        handler: NotificationHandler,
    ) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.link.subscribe(characteristic, handler).await?;
        self.lock_subscriptions().insert(characteristic);
        debug!(
            "subscribed: address={}, characteristic={:?}",
            self.address(),
            characteristic
        );
        Ok(())
    }

    /// Best-effort; unsubscribing an inactive characteristic is a no-op.
    pub async fn unsubscribe(&self, characteristic: Characteristic) {
        if !self.lock_subscriptions().remove(&characteristic) {
            return;
        }
        if let Err(e) = self.link.unsubscribe(characteristic).await {
            warn!(
                "unsubscribe failed: address={}, characteristic={:?}, error={}",
                self.address(),
                characteristic,
                e
            );
        }
    }

    pub async fn write_command(
        &self,
        characteristic: Characteristic,
        value: &[u8],
        require_ack: bool,
    ) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::WriteFailed("link is not connected".into()));
        }
        self.link
            .write(characteristic, value, require_ack)
            .await
            .map_err(|e| match e {
                ConnectionError::WriteFailed(reason) => ConnectionError::WriteFailed(reason),
                other => ConnectionError::WriteFailed(other.to_string()),
            })
    }

    /// Best-effort and idempotent.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for characteristic in self.active_subscriptions() {
            self.unsubscribe(characteristic).await;
        }
        if !self.link.is_connected() {
            debug!("disconnect: link already down, address={}", self.address());
            return;
        }
        match self.link.disconnect().await {
            Ok(()) => info!("disconnected: address={}", self.address()),
            Err(e) => warn!("disconnect failed: address={}, error={}", self.address(), e),
        }
    }

    /// Claim the link's capture slot until the returned guard is dropped.
    pub fn begin_capture(&self) -> Result<CaptureSlot<'_>, CaptureError> {
        if self
            .capture_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::Busy);
        }
        Ok(CaptureSlot {
            flag: &self.capture_active,
        })
    }

    pub fn capture_in_progress(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashSet<Characteristic>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive right to run a capture on a link.
#[must_use = "the capture slot is released when dropped"]
pub struct CaptureSlot<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CaptureSlot<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedLink;

    fn noop() -> NotificationHandler {
        Arc::new(|_data: &[u8]| {})
    }

    #[tokio::test]
    async fn subscribe_tracks_active_characteristics() {
        let manager = ConnectionManager::new(SimulatedLink::new("AA:BB:CC:DD:EE:FF"));
        manager
            .subscribe(Characteristic::Status, noop())
            .await
            .unwrap();
        manager
            .subscribe(Characteristic::AccelData, noop())
            .await
            .unwrap();
        assert_eq!(
            manager.active_subscriptions(),
            vec![Characteristic::AccelData, Characteristic::Status]
        );

        manager.unsubscribe(Characteristic::Status).await;
        manager.unsubscribe(Characteristic::Status).await;
        assert_eq!(
            manager.active_subscriptions(),
            vec![Characteristic::AccelData]
        );
        assert!(!manager.link().is_subscribed(Characteristic::Status));
    }

    #[tokio::test]
    async fn write_fails_when_disconnected() {
        let manager = ConnectionManager::new(SimulatedLink::new("AA:BB:CC:DD:EE:FF"));
        manager.disconnect().await;
        let err = manager
            .write_command(Characteristic::Command, &[1], true)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::WriteFailed(_)));
        assert!(manager.link().writes().is_empty());
    }

    #[tokio::test]
    async fn rejected_write_maps_to_write_failed() {
        let link = SimulatedLink::new("AA:BB:CC:DD:EE:FF");
        link.reject_writes(true);
        let manager = ConnectionManager::new(link);
        let err = manager
            .write_command(Characteristic::Command, &[1], true)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::WriteFailed(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_drops_subscriptions() {
        let manager = ConnectionManager::new(SimulatedLink::new("AA:BB:CC:DD:EE:FF"));
        manager
            .subscribe(Characteristic::Status, noop())
            .await
            .unwrap();

        manager.disconnect().await;
        manager.disconnect().await;

        assert!(!manager.is_connected());
        assert!(manager.active_subscriptions().is_empty());
        assert_eq!(
            manager.subscribe(Characteristic::Status, noop()).await,
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn disconnect_of_dropped_link_is_noop() {
        let link = SimulatedLink::new("AA:BB:CC:DD:EE:FF");
        link.drop_link();
        let manager = ConnectionManager::new(link);
        manager.disconnect().await;
        assert!(!manager.is_connected());
    }

    #[test]
    fn capture_slot_is_exclusive() {
        let manager = ConnectionManager::new(SimulatedLink::new("AA:BB:CC:DD:EE:FF"));
        let slot = manager.begin_capture().unwrap();
        assert!(manager.capture_in_progress());
        assert!(matches!(manager.begin_capture(), Err(CaptureError::Busy)));
        drop(slot);
        assert!(!manager.capture_in_progress());
        assert!(manager.begin_capture().is_ok());
    }
}

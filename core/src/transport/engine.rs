//! Request/response engine
//!
//! Composes the registry's task slots, the session crypto and notification
//! reassembly into typed operations: discovery, read, write, reference
//! counted notifications and "write, then read one notification".

use super::abstraction::{CharacteristicId, CharacteristicInfo, PeripheralHandle, WriteType};
use super::notify::{NotificationCallback, SubscriberId, Unsubscribed};
use super::reassembly::NotificationReassembler;
use super::registry::{ConnectionRegistry, ConnectionState};
use super::task::{OperationKind, TaskTarget};
use crate::crypto::{SessionState, KEY_LEN};
use crate::error::{Result, SwitchLinkError};
use crate::protocol;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RequestResponseEngine {
    registry: ConnectionRegistry,
}

impl RequestResponseEngine {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Services of the connected peripheral, discovered once per connection
    pub async fn get_services(&self, handle: &PeripheralHandle) -> Result<Vec<Uuid>> {
        if let Some(services) = self.registry.cached_services(handle)? {
            return Ok(services);
        }

        let task = self.registry.arm_operation::<Vec<Uuid>>(
            handle,
            OperationKind::GetServices,
            TaskTarget::Peripheral,
            Some((
                self.registry.timeouts().get_services(),
                SwitchLinkError::GetServicesTimeout,
            )),
        )?;
        self.registry.transport().discover_services(handle);
        let services = task.wait().await?;
        debug!("{} exposes {} services", handle, services.len());
        Ok(services)
    }

    pub async fn get_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>> {
        let services = self.get_services(handle).await?;
        if !services.contains(&service) {
            return Err(SwitchLinkError::ServiceNotFound(service));
        }
        if let Some(chars) = self.registry.cached_characteristics(handle, &service)? {
            return Ok(chars);
        }

        let task = self.registry.arm_operation::<Vec<CharacteristicInfo>>(
            handle,
            OperationKind::GetCharacteristics,
            TaskTarget::Service(service),
            Some((
                self.registry.timeouts().get_characteristics(),
                SwitchLinkError::GetCharacteristicsTimeout,
            )),
        )?;
        self.registry
            .transport()
            .discover_characteristics(handle, service);
        task.wait().await
    }

    async fn resolve(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> Result<CharacteristicInfo> {
        self.get_characteristics(handle, characteristic.service)
            .await?
            .into_iter()
            .find(|info| info.uuid == characteristic.characteristic)
            .ok_or(SwitchLinkError::CharacteristicNotFound(
                characteristic.characteristic,
            ))
    }

    // ========================================================================
    // READ / WRITE
    // ========================================================================

    /// Read a characteristic; decrypted when encryption is enabled
    pub async fn read(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
    ) -> Result<Vec<u8>> {
        self.resolve(handle, characteristic).await?;

        let task = self.registry.arm_operation::<Vec<u8>>(
            handle,
            OperationKind::ReadCharacteristic,
            TaskTarget::Characteristic(*characteristic),
            Some((
                self.registry.timeouts().read_characteristic(),
                SwitchLinkError::ReadTimeout,
            )),
        )?;
        self.registry
            .transport()
            .read_characteristic(handle, characteristic);
        task.wait().await
    }

    /// Write a characteristic; encrypted first when encryption is enabled.
    /// Unacknowledged writes resolve after the configured delay.
    pub async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.resolve(handle, characteristic).await?;

        let payload = self.registry.with_active(handle, |peripheral| {
            if peripheral.crypto.encryption_enabled() {
                peripheral.crypto.encrypt(data)
            } else {
                Ok(data.to_vec())
            }
        })?;

        let target = TaskTarget::Characteristic(*characteristic);
        let timeouts = self.registry.timeouts();
        let task = match write_type {
            WriteType::WithResponse => self.registry.arm_operation::<()>(
                handle,
                OperationKind::WriteCharacteristic,
                target,
                Some((timeouts.write_characteristic(), SwitchLinkError::WriteTimeout)),
            )?,
            WriteType::WithoutResponse => self.registry.arm_unacknowledged(
                handle,
                OperationKind::WriteCharacteristic,
                target,
                timeouts.write_without_response_delay(),
            )?,
        };
        self.registry
            .transport()
            .write_characteristic(handle, characteristic, &payload, write_type);
        task.wait().await
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    /// Subscribe `callback` to raw notification fragments on `topic`. Only
    /// the first subscriber turns notifications on at the device.
    pub async fn enable_notifications(
        &self,
        handle: &PeripheralHandle,
        topic: CharacteristicId,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<NotificationSubscription> {
        self.resolve(handle, &topic).await?;

        let callback: NotificationCallback = Arc::new(callback);
        let (id, must_enable) = self
            .registry
            .with_active(handle, |peripheral| Ok(peripheral.bus.subscribe(topic, callback)))?;
        let subscription = NotificationSubscription {
            registry: self.registry.clone(),
            handle: handle.clone(),
            topic,
            id: Some(id),
        };
        if !must_enable {
            return Ok(subscription);
        }

        let enabled = async {
            let task = self.registry.arm_operation::<()>(
                handle,
                OperationKind::EnableNotifications,
                TaskTarget::Characteristic(topic),
                Some((
                    self.registry.timeouts().enable_notifications(),
                    SwitchLinkError::EnableNotificationsTimeout,
                )),
            )?;
            self.registry.transport().set_notify(handle, &topic, true);
            task.wait().await
        }
        .await;

        match enabled {
            Ok(()) => Ok(subscription),
            Err(e) => {
                // Nothing was turned on, so only the listener goes.
                let mut subscription = subscription;
                if let Some(id) = subscription.id.take() {
                    self.registry.with_peripheral(handle, |peripheral| {
                        peripheral.bus.mark_failed(&topic);
                        peripheral.bus.unsubscribe(&topic, id);
                    });
                }
                Err(e)
            }
        }
    }

    /// Subscribe to `topic`, run `write_command`, and return the first
    /// complete (decrypted) packet. The subscription is removed on every
    /// exit path.
    pub async fn read_once_via_notification<F>(
        &self,
        handle: &PeripheralHandle,
        topic: CharacteristicId,
        write_command: F,
    ) -> Result<Vec<u8>>
    where
        F: Future<Output = Result<()>>,
    {
        let (tx, rx) = oneshot::channel::<Result<Vec<u8>>>();
        let tx = Mutex::new(Some(tx));
        let reassembler = Mutex::new(NotificationReassembler::new());
        let registry = self.registry.clone();
        let peer = handle.clone();

        let callback = move |fragment: &[u8]| {
            let result = match reassembler.lock().merge(fragment) {
                Ok(None) => return,
                Ok(Some(packet)) => decrypt_incoming(&registry, &peer, packet),
                Err(e) => Err(e),
            };
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(result);
            }
        };

        let subscription = self.enable_notifications(handle, topic, callback).await?;

        let outcome = tokio::time::timeout(self.registry.timeouts().notification(), async {
            write_command.await?;
            rx.await.unwrap_or(Err(SwitchLinkError::NotConnected))
        })
        .await
        .unwrap_or(Err(SwitchLinkError::NotificationTimeout));

        if let Err(e) = subscription.unsubscribe().await {
            warn!("Failed to unsubscribe from {} on {}: {}", topic, handle, e);
        }
        outcome
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    /// Run `operation` with encryption forced off for `handle`; the previous
    /// flag is restored however `operation` ends
    pub async fn with_encryption_disabled<T, F>(
        &self,
        handle: &PeripheralHandle,
        operation: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _guard = EncryptionDisabled::push(&self.registry, handle);
        operation.await
    }

    /// Read the session data unencrypted and establish the session
    pub async fn establish_session(&self, handle: &PeripheralHandle) -> Result<()> {
        self.registry
            .with_active(handle, |peripheral| {
                peripheral.crypto.begin_handshake();
                Ok(())
            })?;

        let raw = self
            .with_encryption_disabled(handle, self.read(handle, &protocol::SESSION_DATA))
            .await;

        match raw {
            Ok(raw) => {
                self.registry
                    .with_peripheral(handle, |peripheral| peripheral.crypto.apply_session_data(&raw))?;
                info!("Session established with {}", handle);
                Ok(())
            }
            Err(e) => {
                warn!("Session handshake with {} failed: {}", handle, e);
                self.registry
                    .with_peripheral(handle, |peripheral| peripheral.crypto.fail_handshake());
                Err(e)
            }
        }
    }

    pub fn session_state(&self, handle: &PeripheralHandle) -> SessionState {
        self.registry
            .with_known(handle, |peripheral| peripheral.crypto.state())
            .unwrap_or(SessionState::Uninitialized)
    }

    /// Read the per-device setup key; the setup access level is used from
    /// then on
    pub async fn read_setup_key(&self, handle: &PeripheralHandle) -> Result<()> {
        let raw = zeroize::Zeroizing::new(
            self.with_encryption_disabled(handle, self.read(handle, &protocol::SETUP_KEY))
                .await?,
        );
        if raw.len() != KEY_LEN {
            return Err(SwitchLinkError::InvalidKey(format!(
                "Setup key is {} bytes, expected {}",
                raw.len(),
                KEY_LEN
            )));
        }
        if raw.iter().all(|b| *b == 0) {
            return Err(SwitchLinkError::InvalidKey(
                "Setup key unavailable, device is not in setup mode".to_string(),
            ));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&raw);
        self.registry
            .with_peripheral(handle, |peripheral| peripheral.crypto.set_setup_key(key));
        zeroize::Zeroize::zeroize(&mut key);
        info!("Setup key read from {}", handle);
        Ok(())
    }

    pub fn clear_setup_key(&self, handle: &PeripheralHandle) {
        self.registry
            .with_peripheral(handle, |peripheral| peripheral.crypto.clear_setup_key());
    }

    pub fn set_encryption_enabled(&self, handle: &PeripheralHandle, enabled: bool) {
        self.registry.with_peripheral(handle, |peripheral| {
            peripheral.crypto.set_encryption_enabled(enabled)
        });
    }
}

/// Decrypt a reassembled notification packet if encryption is enabled
pub(crate) fn decrypt_incoming(
    registry: &ConnectionRegistry,
    handle: &PeripheralHandle,
    packet: Vec<u8>,
) -> Result<Vec<u8>> {
    registry.with_peripheral(handle, |peripheral| {
        if peripheral.crypto.encryption_enabled() {
            peripheral.crypto.decrypt(&packet)
        } else {
            Ok(packet)
        }
    })
}

struct EncryptionDisabled<'a> {
    registry: &'a ConnectionRegistry,
    handle: &'a PeripheralHandle,
}

impl<'a> EncryptionDisabled<'a> {
    fn push(registry: &'a ConnectionRegistry, handle: &'a PeripheralHandle) -> Self {
        registry.with_peripheral(handle, |peripheral| {
            peripheral.crypto.push_encryption_disabled()
        });
        Self { registry, handle }
    }
}

impl Drop for EncryptionDisabled<'_> {
    fn drop(&mut self) {
        self.registry.with_peripheral(self.handle, |peripheral| {
            peripheral.crypto.pop_encryption_state()
        });
    }
}

// ============================================================================
// SUBSCRIPTION TOKEN
// ============================================================================

/// Token of one notification subscriber. `unsubscribe` turns notifications
/// off at the device once the last subscriber of the topic leaves; dropping
/// the token does the same without waiting for the acknowledgement.
pub struct NotificationSubscription {
    registry: ConnectionRegistry,
    handle: PeripheralHandle,
    topic: CharacteristicId,
    id: Option<SubscriberId>,
}

impl NotificationSubscription {
    pub fn topic(&self) -> CharacteristicId {
        self.topic
    }

    pub async fn unsubscribe(mut self) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        if !self.release(id) {
            return Ok(());
        }

        let armed = self.registry.arm_operation::<()>(
            &self.handle,
            OperationKind::DisableNotifications,
            TaskTarget::Characteristic(self.topic),
            Some((
                self.registry.timeouts().disable_notifications(),
                SwitchLinkError::DisableNotificationsTimeout,
            )),
        );
        match armed {
            Ok(task) => {
                self.registry
                    .transport()
                    .set_notify(&self.handle, &self.topic, false);
                task.wait().await
            }
            Err(SwitchLinkError::TaskSlotOccupied { active, .. }) => {
                debug!(
                    "Turning off {} on {} unacknowledged, slot busy with {:?}",
                    self.topic, self.handle, active
                );
                self.registry
                    .transport()
                    .set_notify(&self.handle, &self.topic, false);
                Ok(())
            }
            Err(SwitchLinkError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove the listener. True when notifications must be turned off.
    fn release(&self, id: SubscriberId) -> bool {
        let outcome = self
            .registry
            .with_known(&self.handle, |peripheral| {
                peripheral.bus.unsubscribe(&self.topic, id)
            })
            .unwrap_or(Unsubscribed::NotSubscribed);
        outcome == Unsubscribed::Last
            && self.registry.connection_state(&self.handle) == ConnectionState::Active
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.release(id) {
                debug!(
                    "Subscription to {} on {} dropped, turning notifications off",
                    self.topic, self.handle
                );
                self.registry
                    .transport()
                    .set_notify(&self.handle, &self.topic, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::crypto::{AccessLevel, KeyStore, SessionCrypto};
    use crate::transport::abstraction::TransportEvent;
    use crate::transport::notify::NotifyState;
    use crate::transport::reassembly::frame_notification;
    use crate::transport::testing::{harness, harness_with, ScriptedTransport, TransportCall};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const SESSION_RAW: [u8; 5] = [0x10, 0x20, 0x30, 0x40, 0x50];
    const DATA: CharacteristicId =
        CharacteristicId::new(protocol::DEVICE_SERVICE, Uuid::from_u128(0xD47A));

    fn plug() -> PeripheralHandle {
        PeripheralHandle::from("plug-1")
    }

    fn keys() -> KeyStore {
        KeyStore::new()
            .with_key(AccessLevel::Admin, [0x5A; KEY_LEN])
            .unwrap()
    }

    fn device_crypto() -> SessionCrypto {
        let mut device = SessionCrypto::new(Arc::new(keys()), true);
        device.apply_session_data(&SESSION_RAW).unwrap();
        device
    }

    fn script_device(transport: &ScriptedTransport) {
        transport.add_peripheral(&plug());
        for id in [
            protocol::CONTROL,
            protocol::RESULT,
            protocol::SESSION_DATA,
            protocol::SETUP_KEY,
            DATA,
        ] {
            transport.add_characteristic(id);
        }
        transport.set_read_value(protocol::SESSION_DATA, SESSION_RAW.to_vec());
    }

    async fn connected_plain() -> (RequestResponseEngine, Arc<ScriptedTransport>) {
        let (registry, transport) = harness();
        script_device(&transport);
        registry.connect(&plug(), None).await.unwrap();
        let engine = RequestResponseEngine::new(registry);
        engine.set_encryption_enabled(&plug(), false);
        (engine, transport)
    }

    async fn connected_encrypted() -> (RequestResponseEngine, Arc<ScriptedTransport>) {
        let (registry, transport) = harness_with(keys(), &EngineConfig::default());
        script_device(&transport);
        registry.connect(&plug(), None).await.unwrap();
        let engine = RequestResponseEngine::new(registry);
        engine.establish_session(&plug()).await.unwrap();
        (engine, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_is_cached() {
        let (engine, transport) = connected_plain().await;

        let chars = engine
            .get_characteristics(&plug(), protocol::DEVICE_SERVICE)
            .await
            .unwrap();
        assert!(chars.iter().any(|c| c.uuid == protocol::CONTROL_UUID));
        engine
            .get_characteristics(&plug(), protocol::DEVICE_SERVICE)
            .await
            .unwrap();

        let discoveries = transport
            .calls()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    TransportCall::DiscoverServices(_) | TransportCall::DiscoverCharacteristics(..)
                )
            })
            .count();
        assert_eq!(discoveries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service_and_characteristic() {
        let (engine, _transport) = connected_plain().await;

        let missing_service = CharacteristicId::new(Uuid::from_u128(0xBAD), Uuid::from_u128(1));
        assert_eq!(
            engine.read(&plug(), &missing_service).await,
            Err(SwitchLinkError::ServiceNotFound(Uuid::from_u128(0xBAD)))
        );

        let missing_char = CharacteristicId::new(protocol::DEVICE_SERVICE, Uuid::from_u128(0xBAD));
        assert_eq!(
            engine.read(&plug(), &missing_char).await,
            Err(SwitchLinkError::CharacteristicNotFound(Uuid::from_u128(0xBAD)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_connection() {
        let (registry, _transport) = harness();
        let engine = RequestResponseEngine::new(registry);
        assert_eq!(
            engine.get_services(&plug()).await,
            Err(SwitchLinkError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let (engine, _transport) = connected_plain().await;
        // No read value scripted for DATA, so the device never answers.
        assert_eq!(
            engine.read(&plug(), &DATA).await,
            Err(SwitchLinkError::ReadTimeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_read_is_decrypted() {
        let (engine, transport) = connected_encrypted().await;
        assert_eq!(engine.session_state(&plug()), SessionState::Established);

        let mut device = device_crypto();
        transport.set_read_value(DATA, device.encrypt(b"power: 12W").unwrap());
        assert_eq!(engine.read(&plug(), &DATA).await.unwrap(), b"power: 12W");
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_write() {
        let (engine, transport) = connected_encrypted().await;

        engine
            .write(&plug(), &DATA, b"relay on", WriteType::WithResponse)
            .await
            .unwrap();

        let written = transport.writes().pop().unwrap();
        assert_ne!(written, b"relay on");
        assert_eq!(device_crypto().decrypt(&written).unwrap(), b"relay on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_without_ack() {
        let (engine, transport) = connected_plain().await;
        transport.set_ack_writes(false);
        assert_eq!(
            engine
                .write(&plug(), &DATA, &[1], WriteType::WithResponse)
                .await,
            Err(SwitchLinkError::WriteTimeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_write_waits_for_delay() {
        let (engine, _transport) = connected_plain().await;
        engine
            .get_characteristics(&plug(), protocol::DEVICE_SERVICE)
            .await
            .unwrap();
        let delay = engine.registry().timeouts().write_without_response_delay();

        let started = Instant::now();
        engine
            .write(&plug(), &DATA, &[1, 2], WriteType::WithoutResponse)
            .await
            .unwrap();
        assert!(started.elapsed() >= delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_write_pending_before_delay() {
        let (engine, _transport) = connected_plain().await;
        engine
            .get_characteristics(&plug(), protocol::DEVICE_SERVICE)
            .await
            .unwrap();
        let delay = engine.registry().timeouts().write_without_response_delay();

        let write = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .write(&plug(), &DATA, &[1, 2], WriteType::WithoutResponse)
                    .await
            })
        };
        tokio::time::sleep(delay - Duration::from_millis(1)).await;
        assert!(!write.is_finished());

        assert_eq!(write.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refcounted_notifications() {
        let (engine, transport) = connected_plain().await;

        let first = engine
            .enable_notifications(&plug(), protocol::RESULT, |_| {})
            .await
            .unwrap();
        let second = engine
            .enable_notifications(&plug(), protocol::RESULT, |_| {})
            .await
            .unwrap();
        assert_eq!(transport.notify_calls(true), 1);

        first.unsubscribe().await.unwrap();
        assert_eq!(transport.notify_calls(false), 0);

        second.unsubscribe().await.unwrap();
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscription_turns_notifications_off() {
        let (engine, transport) = connected_plain().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let subscription = engine
            .enable_notifications(&plug(), protocol::RESULT, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        drop(subscription);
        assert_eq!(transport.notify_calls(false), 1);

        engine.registry().handle_event(TransportEvent::Notification {
            handle: plug(),
            characteristic: protocol::RESULT,
            value: vec![1],
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_right_after_drop() {
        let (engine, transport) = connected_plain().await;

        let subscription = engine
            .enable_notifications(&plug(), protocol::RESULT, |_| {})
            .await
            .unwrap();
        drop(subscription);

        // The "off" acknowledgement of the drop arrives while the new
        // "on" request is outstanding.
        let again = engine
            .enable_notifications(&plug(), protocol::RESULT, |_| {})
            .await;
        assert!(again.is_ok());
        assert_eq!(transport.notify_calls(true), 2);
        assert_eq!(transport.notify_calls(false), 1);
        assert_eq!(
            engine
                .registry()
                .with_peripheral(&plug(), |p| p.bus.state(&protocol::RESULT)),
            NotifyState::On
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_notifications_timeout_removes_listener() {
        let (engine, transport) = connected_plain().await;
        transport.set_ack_notify(false);

        assert!(matches!(
            engine
                .enable_notifications(&plug(), protocol::RESULT, |_| {})
                .await,
            Err(SwitchLinkError::EnableNotificationsTimeout)
        ));
        let subscribers = engine
            .registry()
            .with_peripheral(&plug(), |p| p.bus.subscriber_count(&protocol::RESULT));
        assert_eq!(subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_once_via_notification() {
        let (engine, transport) = connected_encrypted().await;
        let mut device = device_crypto();
        let reply = device.encrypt(&[0xAB; 40]).unwrap();
        transport.reply_on_write(
            protocol::CONTROL,
            protocol::RESULT,
            frame_notification(&reply, 20).unwrap(),
        );

        let result = engine
            .read_once_via_notification(
                &plug(),
                protocol::RESULT,
                engine.write(&plug(), &protocol::CONTROL, &[1], WriteType::WithResponse),
            )
            .await
            .unwrap();

        assert_eq!(result, vec![0xAB; 40]);
        assert_eq!(transport.notify_calls(true), 1);
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_once_timeout_cleans_up() {
        let (engine, transport) = connected_plain().await;

        let result = engine
            .read_once_via_notification(
                &plug(),
                protocol::RESULT,
                engine.write(&plug(), &protocol::CONTROL, &[1], WriteType::WithResponse),
            )
            .await;

        assert_eq!(result, Err(SwitchLinkError::NotificationTimeout));
        assert_eq!(transport.notify_calls(false), 1);
        let subscribers = engine
            .registry()
            .with_peripheral(&plug(), |p| p.bus.subscriber_count(&protocol::RESULT));
        assert_eq!(subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_once_deadline_frees_slot_of_pending_write() {
        let mut config = EngineConfig::default();
        config.timeouts.notification_ms = 1_000;
        let (registry, transport) = harness_with(KeyStore::new(), &config);
        script_device(&transport);
        registry.connect(&plug(), None).await.unwrap();
        let engine = RequestResponseEngine::new(registry);
        engine.set_encryption_enabled(&plug(), false);
        transport.set_ack_writes(false);

        let started = Instant::now();
        let result = engine
            .read_once_via_notification(
                &plug(),
                protocol::RESULT,
                engine.write(&plug(), &protocol::CONTROL, &[1], WriteType::WithResponse),
            )
            .await;

        assert_eq!(result, Err(SwitchLinkError::NotificationTimeout));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(
            engine.registry().current_operation(&plug()),
            OperationKind::None
        );
        assert_eq!(transport.notify_calls(false), 1);

        transport.set_ack_writes(true);
        engine
            .write(&plug(), &DATA, &[2], WriteType::WithResponse)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_encryption_flag_restored_after_error() {
        let (engine, _transport) = connected_encrypted().await;

        let result: Result<()> = engine
            .with_encryption_disabled(&plug(), async {
                assert!(!engine
                    .registry()
                    .with_peripheral(&plug(), |p| p.crypto.encryption_enabled()));
                Err(SwitchLinkError::ProcessAborted)
            })
            .await;

        assert_eq!(result, Err(SwitchLinkError::ProcessAborted));
        assert!(engine
            .registry()
            .with_peripheral(&plug(), |p| p.crypto.encryption_enabled()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_session_data_is_nonce_unavailable() {
        let (registry, transport) = harness_with(keys(), &EngineConfig::default());
        script_device(&transport);
        transport.set_read_value(protocol::SESSION_DATA, vec![0; 14]);
        registry.connect(&plug(), None).await.unwrap();
        let engine = RequestResponseEngine::new(registry);

        assert_eq!(
            engine.establish_session(&plug()).await,
            Err(SwitchLinkError::SessionNonceUnavailable)
        );
        assert_eq!(engine.session_state(&plug()), SessionState::Uninitialized);
        assert_eq!(
            engine.write(&plug(), &DATA, &[1], WriteType::WithResponse).await,
            Err(SwitchLinkError::SessionNotEstablished)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_key() {
        let (engine, transport) = connected_encrypted().await;
        transport.set_read_value(protocol::SETUP_KEY, vec![0x33; KEY_LEN]);

        engine.read_setup_key(&plug()).await.unwrap();
        let level = engine
            .registry()
            .with_peripheral(&plug(), |p| p.crypto.active_access_level());
        assert_eq!(level, Some(AccessLevel::Setup));

        engine.clear_setup_key(&plug());
        let level = engine
            .registry()
            .with_peripheral(&plug(), |p| p.crypto.active_access_level());
        assert_eq!(level, Some(AccessLevel::Admin));

        transport.set_read_value(protocol::SETUP_KEY, vec![0; KEY_LEN]);
        assert!(matches!(
            engine.read_setup_key(&plug()).await,
            Err(SwitchLinkError::InvalidKey(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_invalidates_session() {
        let (engine, _transport) = connected_encrypted().await;
        engine.registry().disconnect(&plug()).await.unwrap();
        assert_eq!(engine.session_state(&plug()), SessionState::Invalidated);
    }
}

//! Connection registry: single source of truth per peripheral handle
//!
//! Owns the pending and active connection maps plus, per handle, the
//! [`TaskSlot`], [`SessionCrypto`] and [`NotificationBus`]. Every platform
//! callback enters through [`ConnectionRegistry::handle_event`] and is routed
//! to the handle it names. Completion callbacks only resolve a task whose
//! kind and target match; everything else is stale and dropped.
//!
//! Locking: one `parking_lot::Mutex` around [`RegistryState`]. The lock is
//! never held across an `.await`, and transport calls and subscriber
//! callbacks are always made with it released, because the platform may
//! call back synchronously.

use super::abstraction::{
    AdapterState, BleTransport, CharacteristicId, CharacteristicInfo, PeripheralHandle,
    TransportEvent,
};
use super::notify::NotificationBus;
use super::task::{OperationKind, ResultSink, SinkValue, TaskId, TaskSlot, TaskTarget, TaskValue};
use crate::config::{EngineConfig, TimeoutConfig};
use crate::crypto::{KeyStore, SessionCrypto};
use crate::error::{Result, SwitchLinkError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Connection state of one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NoConnection,
    Pending,
    Active,
}

/// Discovery cache of a live connection, discarded on disconnect
#[derive(Debug, Default)]
pub(crate) struct ActiveConnection {
    services: Option<Vec<Uuid>>,
    characteristics: HashMap<Uuid, Vec<CharacteristicInfo>>,
}

/// Per-handle state, created lazily on first use
pub(crate) struct PeripheralState {
    pub slot: TaskSlot,
    pub crypto: SessionCrypto,
    pub bus: NotificationBus,
}

pub(crate) struct RegistryState {
    pending: HashSet<PeripheralHandle>,
    active: HashMap<PeripheralHandle, ActiveConnection>,
    /// Handles whose cancelled attempt is still owed one Disconnected or
    /// ConnectFailed callback
    cancelling: HashSet<PeripheralHandle>,
    peripherals: HashMap<PeripheralHandle, PeripheralState>,
    adapter: AdapterState,
    keys: Arc<KeyStore>,
    encryption_default: bool,
}

impl RegistryState {
    fn peripheral(&mut self, handle: &PeripheralHandle) -> &mut PeripheralState {
        let keys = &self.keys;
        let encryption_default = self.encryption_default;
        self.peripherals
            .entry(handle.clone())
            .or_insert_with(|| PeripheralState {
                slot: TaskSlot::new(),
                crypto: SessionCrypto::new(keys.clone(), encryption_default),
                bus: NotificationBus::new(),
            })
    }

    fn connection_state(&self, handle: &PeripheralHandle) -> ConnectionState {
        if self.active.contains_key(handle) {
            ConnectionState::Active
        } else if self.pending.contains(handle) {
            ConnectionState::Pending
        } else {
            ConnectionState::NoConnection
        }
    }

    /// Remove the handle from both maps and forget session and subscriptions
    fn drop_link(&mut self, handle: &PeripheralHandle) -> bool {
        let was_pending = self.pending.remove(handle);
        let was_active = self.active.remove(handle).is_some();
        if let Some(peripheral) = self.peripherals.get_mut(handle) {
            peripheral.crypto.invalidate();
            peripheral.bus.clear();
        }
        was_pending || was_active
    }

    /// Forget the per-handle state once it holds nothing worth keeping
    fn prune(&mut self, handle: &PeripheralHandle) {
        if self.pending.contains(handle) || self.active.contains_key(handle) {
            return;
        }
        let encryption_default = self.encryption_default;
        let idle = self
            .peripherals
            .get(handle)
            .map(|p| {
                !p.slot.is_armed() && p.bus.is_empty() && p.crypto.is_pristine(encryption_default)
            })
            .unwrap_or(false);
        if idle {
            self.peripherals.remove(handle);
            trace!("Forgot idle state of {}", handle);
        }
    }

    /// The platform still owes a callback for the attempt just cancelled
    fn mark_cancelling(&mut self, handle: &PeripheralHandle) {
        self.cancelling.insert(handle.clone());
        self.prune(handle);
    }

    /// Apply an expired timer. Returns true when the transport should be
    /// asked to cancel a connection attempt.
    fn expire(&mut self, handle: &PeripheralHandle, id: TaskId, action: TimerAction) -> bool {
        let Some(peripheral) = self.peripherals.get_mut(handle) else {
            return false;
        };

        match action {
            TimerAction::Reject(err) => {
                if peripheral.slot.reject_task(id, err.clone()) {
                    warn!("{} on {}: {}", id, handle, err);
                }
                false
            }
            TimerAction::Fulfill => {
                if peripheral.slot.fulfill_task(id, TaskValue::Void) {
                    debug!("{} on {} completed without acknowledgement", id, handle);
                }
                false
            }
            TimerAction::ConnectTimeout => {
                if !peripheral.slot.reject_task(id, SwitchLinkError::ConnectTimeout) {
                    return false;
                }
                warn!("Connect to {} timed out", handle);
                let cancel = self.pending.remove(handle);
                if cancel {
                    self.mark_cancelling(handle);
                }
                cancel
            }
            TimerAction::DisconnectTimeout => {
                if peripheral
                    .slot
                    .reject_task(id, SwitchLinkError::DisconnectTimeout)
                {
                    warn!("Disconnect from {} timed out, dropping link state", handle);
                    self.drop_link(handle);
                }
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
enum TimerAction {
    Reject(SwitchLinkError),
    Fulfill,
    ConnectTimeout,
    DisconnectTimeout,
}

/// Cheap to clone; all clones share one state
#[derive(Clone)]
pub struct ConnectionRegistry {
    shared: Arc<Mutex<RegistryState>>,
    transport: Arc<dyn BleTransport>,
    timeouts: TimeoutConfig,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn BleTransport>, keys: KeyStore, config: &EngineConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(RegistryState {
                pending: HashSet::new(),
                active: HashMap::new(),
                cancelling: HashSet::new(),
                peripherals: HashMap::new(),
                adapter: AdapterState::Unknown,
                keys: Arc::new(keys),
                encryption_default: config.encryption.enabled,
            })),
            transport,
            timeouts: config.timeouts.clone(),
        }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub(crate) fn transport(&self) -> &Arc<dyn BleTransport> {
        &self.transport
    }

    pub fn connection_state(&self, handle: &PeripheralHandle) -> ConnectionState {
        self.shared.lock().connection_state(handle)
    }

    /// Last adapter state the platform reported
    pub fn adapter_state(&self) -> AdapterState {
        self.shared.lock().adapter
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// Kind of the operation currently outstanding on `handle`
    pub fn current_operation(&self, handle: &PeripheralHandle) -> OperationKind {
        self.shared
            .lock()
            .peripherals
            .get(handle)
            .map(|p| p.slot.kind())
            .unwrap_or(OperationKind::None)
    }

    /// Replace the key store for every current and future handle
    pub fn set_keys(&self, keys: KeyStore) {
        let keys = Arc::new(keys);
        let mut state = self.shared.lock();
        for peripheral in state.peripherals.values_mut() {
            peripheral.crypto.set_keys(keys.clone());
        }
        state.keys = keys;
        info!("Key store replaced for {} peripherals", state.peripherals.len());
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Connect to `handle`. Resolves when the platform reports the link up.
    pub async fn connect(&self, handle: &PeripheralHandle, timeout: Option<Duration>) -> Result<()> {
        match self.connection_state(handle) {
            ConnectionState::Pending => {
                return Err(SwitchLinkError::AlreadyConnecting(handle.to_string()))
            }
            ConnectionState::Active => {
                debug!("Already connected to {}", handle);
                return Ok(());
            }
            ConnectionState::NoConnection => {}
        }

        let adapter = self.adapter_state();
        if !adapter.accepts_connections() {
            warn!("Bluetooth adapter is {}, not connecting to {}", adapter, handle);
            return Err(SwitchLinkError::NotInitialized);
        }
        if !self.transport.has_peripheral(handle) {
            return Err(SwitchLinkError::CannotResolveHandle(handle.to_string()));
        }

        let task = {
            let mut state = self.shared.lock();
            if state.pending.contains(handle) {
                return Err(SwitchLinkError::AlreadyConnecting(handle.to_string()));
            }
            let (sink, rx) = ResultSink::channel::<()>();
            let id = state
                .peripheral(handle)
                .slot
                .arm(OperationKind::Connect, TaskTarget::Peripheral, sink)?;
            state.pending.insert(handle.clone());
            if let Some(after) = timeout {
                self.schedule(&mut state, handle, id, after, TimerAction::ConnectTimeout);
            }
            self.pending_task(handle, id, rx)
        };

        info!("Connecting to {}", handle);
        self.transport.connect(handle);
        task.wait().await
    }

    /// Cancel an in-flight connection attempt. Idempotent.
    pub fn abort_connecting(&self, handle: &PeripheralHandle) -> Result<()> {
        let was_pending = {
            let mut state = self.shared.lock();
            if let Some(peripheral) = state.peripherals.get_mut(handle) {
                if peripheral.slot.kind() == OperationKind::Connect {
                    peripheral.slot.reject(SwitchLinkError::ConnectionCancelled);
                }
            }
            let was_pending = state.pending.remove(handle);
            if was_pending {
                state.mark_cancelling(handle);
            } else {
                state.prune(handle);
            }
            was_pending
        };

        if was_pending {
            info!("Aborted connection attempt to {}", handle);
            self.transport.cancel_connection(handle);
        }
        Ok(())
    }

    pub async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.disconnect_with(handle, OperationKind::Disconnect, self.timeouts.disconnect())
            .await
    }

    /// Disconnect after a failure; tolerates a stack in a bad state by
    /// waiting longer
    pub async fn error_disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.disconnect_with(
            handle,
            OperationKind::ErrorDisconnect,
            self.timeouts.error_disconnect(),
        )
        .await
    }

    async fn disconnect_with(
        &self,
        handle: &PeripheralHandle,
        kind: OperationKind,
        after: Duration,
    ) -> Result<()> {
        let (task, cancel_pending) = {
            let mut state = self.shared.lock();
            let connection = state.connection_state(handle);
            if connection == ConnectionState::NoConnection {
                debug!("Disconnect from {}: not connected", handle);
                return Ok(());
            }

            let peripheral = state.peripheral(handle);
            match peripheral.slot.kind() {
                OperationKind::None => {}
                OperationKind::Connect => {
                    peripheral.slot.reject(SwitchLinkError::ConnectionCancelled);
                }
                active if active.completes_on_disconnect() => {}
                _ => {
                    peripheral.slot.reject(SwitchLinkError::NotConnected);
                }
            }

            let cancel_pending = connection == ConnectionState::Pending;
            let kind = if cancel_pending {
                OperationKind::CancelPendingConnection
            } else {
                kind
            };
            let (sink, rx) = ResultSink::channel::<()>();
            let id = peripheral.slot.arm(kind, TaskTarget::Peripheral, sink)?;
            if cancel_pending {
                state.pending.remove(handle);
            }
            self.schedule(&mut state, handle, id, after, TimerAction::DisconnectTimeout);
            (self.pending_task(handle, id, rx), cancel_pending)
        };

        if cancel_pending {
            info!("Cancelling pending connection to {}", handle);
            self.transport.cancel_connection(handle);
        } else {
            info!("Disconnecting from {}", handle);
            self.transport.disconnect(handle);
        }
        task.wait().await
    }

    /// Wait for the peripheral to drop the link on its own
    pub async fn await_disconnect(
        &self,
        handle: &PeripheralHandle,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let task = {
            let mut state = self.shared.lock();
            if state.connection_state(handle) == ConnectionState::NoConnection {
                return Ok(());
            }
            let (sink, rx) = ResultSink::channel::<()>();
            let id = state.peripheral(handle).slot.arm(
                OperationKind::AwaitDisconnect,
                TaskTarget::Peripheral,
                sink,
            )?;
            let after = timeout.unwrap_or_else(|| self.timeouts.await_disconnect());
            self.schedule(
                &mut state,
                handle,
                id,
                after,
                TimerAction::Reject(SwitchLinkError::DisconnectTimeout),
            );
            self.pending_task(handle, id, rx)
        };
        debug!("Waiting for {} to disconnect", handle);
        task.wait().await
    }

    /// Reject every outstanding task with `TransportReset` and clear both
    /// connection maps. Safe to call at any time.
    pub fn on_radio_reset(&self) {
        let mut state = self.shared.lock();
        let mut rejected = 0;
        for peripheral in state.peripherals.values_mut() {
            if peripheral.slot.reject(SwitchLinkError::TransportReset) {
                rejected += 1;
            }
            peripheral.crypto.invalidate();
            peripheral.bus.clear();
        }
        let dropped = state.pending.len() + state.active.len();
        state.pending.clear();
        state.active.clear();
        state.cancelling.clear();
        let handles: Vec<PeripheralHandle> = state.peripherals.keys().cloned().collect();
        for handle in &handles {
            state.prune(handle);
        }
        warn!(
            "Bluetooth radio reset: rejected {} operations, dropped {} connections",
            rejected, dropped
        );
    }

    // ========================================================================
    // PLATFORM CALLBACKS
    // ========================================================================

    /// Route one platform callback to the handle it concerns
    pub fn handle_event(&self, event: TransportEvent) {
        trace!("Transport event: {}", event);
        match event {
            TransportEvent::Connected { handle } => self.on_connected(&handle),
            TransportEvent::ConnectFailed { handle, reason } => {
                self.on_connect_failed(&handle, reason)
            }
            TransportEvent::Disconnected { handle, reason } => {
                self.on_disconnected(&handle, reason)
            }
            TransportEvent::ServicesDiscovered { handle, result } => {
                let mut state = self.shared.lock();
                let state = &mut *state;
                let Some(peripheral) =
                    waiting(state, &handle, OperationKind::GetServices, TaskTarget::Peripheral)
                else {
                    return;
                };
                match result {
                    Ok(services) if services.is_empty() => {
                        peripheral.slot.reject(SwitchLinkError::NoServicesReturned);
                    }
                    Ok(services) => {
                        peripheral.slot.fulfill(TaskValue::Services(services.clone()));
                        if let Some(connection) = state.active.get_mut(&handle) {
                            connection.services = Some(services);
                        }
                    }
                    Err(e) => {
                        peripheral.slot.reject(SwitchLinkError::TransportFailure(e));
                    }
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                handle,
                service,
                result,
            } => {
                let mut state = self.shared.lock();
                let state = &mut *state;
                let Some(peripheral) = waiting(
                    state,
                    &handle,
                    OperationKind::GetCharacteristics,
                    TaskTarget::Service(service),
                ) else {
                    return;
                };
                match result {
                    Ok(chars) if chars.is_empty() => {
                        peripheral
                            .slot
                            .reject(SwitchLinkError::NoCharacteristicsReturned);
                    }
                    Ok(chars) => {
                        peripheral
                            .slot
                            .fulfill(TaskValue::Characteristics(chars.clone()));
                        if let Some(connection) = state.active.get_mut(&handle) {
                            connection.characteristics.insert(service, chars);
                        }
                    }
                    Err(e) => {
                        peripheral.slot.reject(SwitchLinkError::TransportFailure(e));
                    }
                }
            }
            TransportEvent::CharacteristicRead {
                handle,
                characteristic,
                result,
            } => {
                let mut state = self.shared.lock();
                let Some(peripheral) = waiting(
                    &mut state,
                    &handle,
                    OperationKind::ReadCharacteristic,
                    TaskTarget::Characteristic(characteristic),
                ) else {
                    return;
                };
                let result = result.map_err(SwitchLinkError::TransportFailure).and_then(|raw| {
                    if peripheral.crypto.encryption_enabled() {
                        peripheral.crypto.decrypt(&raw)
                    } else {
                        Ok(raw)
                    }
                });
                match result {
                    Ok(data) => peripheral.slot.fulfill(TaskValue::Bytes(data)),
                    Err(e) => peripheral.slot.reject(e),
                };
            }
            TransportEvent::CharacteristicWritten {
                handle,
                characteristic,
                result,
            } => {
                let mut state = self.shared.lock();
                let Some(peripheral) = waiting(
                    &mut state,
                    &handle,
                    OperationKind::WriteCharacteristic,
                    TaskTarget::Characteristic(characteristic),
                ) else {
                    return;
                };
                match result {
                    Ok(()) => peripheral.slot.fulfill(TaskValue::Void),
                    Err(e) => peripheral.slot.reject(SwitchLinkError::TransportFailure(e)),
                };
            }
            TransportEvent::NotificationStateChanged {
                handle,
                characteristic,
                result,
            } => self.on_notification_state(&handle, characteristic, result),
            TransportEvent::Notification {
                handle,
                characteristic,
                value,
            } => {
                let callbacks = {
                    let state = self.shared.lock();
                    state
                        .peripherals
                        .get(&handle)
                        .map(|p| p.bus.callbacks(&characteristic))
                        .unwrap_or_default()
                };
                if callbacks.is_empty() {
                    trace!("Notification on {} {} without subscribers", handle, characteristic);
                }
                for callback in callbacks {
                    callback(&value);
                }
            }
            TransportEvent::AdapterStateChanged(adapter) => {
                self.shared.lock().adapter = adapter;
                if adapter.invalidates_connections() {
                    self.on_radio_reset();
                } else if adapter == AdapterState::PoweredOn {
                    info!("Bluetooth adapter powered on");
                } else {
                    warn!("Bluetooth adapter state: {}", adapter);
                }
            }
        }
    }

    fn on_connect_failed(&self, handle: &PeripheralHandle, reason: String) {
        let mut state = self.shared.lock();
        if state.cancelling.remove(handle) {
            debug!("Cancelled attempt on {} acknowledged: {}", handle, reason);
            return;
        }
        state.pending.remove(handle);
        match state.peripherals.get_mut(handle) {
            Some(peripheral) => match peripheral.slot.kind() {
                OperationKind::Connect => {
                    warn!("Connect to {} failed: {}", handle, reason);
                    peripheral
                        .slot
                        .reject(SwitchLinkError::TransportFailure(reason));
                }
                OperationKind::CancelPendingConnection => {
                    peripheral.slot.fulfill(TaskValue::Void);
                }
                other => debug!(
                    "Stale connect failure for {} ignored (active: {:?})",
                    handle, other
                ),
            },
            None => debug!("Connect failure for unknown {} ignored", handle),
        }
        state.prune(handle);
    }

    fn on_connected(&self, handle: &PeripheralHandle) {
        let cancel = {
            let mut state = self.shared.lock();
            if state.pending.remove(handle) {
                state.cancelling.remove(handle);
                state
                    .active
                    .insert(handle.clone(), ActiveConnection::default());
                let peripheral = state.peripheral(handle);
                if peripheral.slot.kind() == OperationKind::Connect {
                    peripheral.slot.fulfill(TaskValue::Void);
                }
                info!("Connected to {}", handle);
                false
            } else if state.active.contains_key(handle) {
                debug!("Duplicate connect callback for {}", handle);
                false
            } else {
                warn!("Unexpected connect from {}, cancelling", handle);
                true
            }
        };
        if cancel {
            self.transport.cancel_connection(handle);
        }
    }

    fn on_disconnected(&self, handle: &PeripheralHandle, reason: Option<String>) {
        let mut state = self.shared.lock();
        if state.cancelling.remove(handle) {
            debug!("Cancelled attempt on {} acknowledged", handle);
            return;
        }
        let had_link = state.drop_link(handle);
        let Some(peripheral) = state.peripherals.get_mut(handle) else {
            debug!("Disconnect callback for unknown {}", handle);
            return;
        };

        match peripheral.slot.kind() {
            OperationKind::None => {
                if had_link {
                    warn!(
                        "{} disconnected unexpectedly: {}",
                        handle,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                }
            }
            kind if kind.completes_on_disconnect() => {
                info!("Disconnected from {}", handle);
                peripheral.slot.fulfill(TaskValue::Void);
            }
            OperationKind::Connect => {
                let reason = reason.unwrap_or_else(|| "Disconnected while connecting".to_string());
                warn!("Connect to {} failed: {}", handle, reason);
                peripheral
                    .slot
                    .reject(SwitchLinkError::TransportFailure(reason));
            }
            kind => {
                warn!("{} disconnected during {:?}", handle, kind);
                peripheral.slot.reject(SwitchLinkError::NotConnected);
            }
        }
        state.prune(handle);
    }

    fn on_notification_state(
        &self,
        handle: &PeripheralHandle,
        characteristic: CharacteristicId,
        result: std::result::Result<bool, String>,
    ) {
        let mut state = self.shared.lock();
        let target = TaskTarget::Characteristic(characteristic);
        let Some(peripheral) = state.peripherals.get_mut(handle) else {
            return;
        };

        let enabling = if peripheral
            .slot
            .is_waiting_for(OperationKind::EnableNotifications, &target)
        {
            true
        } else if peripheral
            .slot
            .is_waiting_for(OperationKind::DisableNotifications, &target)
        {
            false
        } else {
            debug!(
                "Stale notification state change for {} {} ignored",
                handle, characteristic
            );
            return;
        };

        match result {
            Ok(on) if on == enabling => {
                if enabling {
                    peripheral.bus.mark_enabled(&characteristic);
                }
                peripheral.slot.fulfill(TaskValue::Void);
            }
            Ok(on) => {
                // Leftover of an earlier unacknowledged request; the task
                // stays armed and its timer still applies.
                debug!(
                    "Stale notify state {} for {} {} ignored",
                    on, handle, characteristic
                );
            }
            Err(e) => {
                if enabling {
                    peripheral.bus.mark_failed(&characteristic);
                }
                peripheral.slot.reject(SwitchLinkError::TransportFailure(e));
            }
        }
    }

    // ========================================================================
    // ENGINE PLUMBING
    // ========================================================================

    /// Run `f` against the state of `handle` under the lock
    pub(crate) fn with_peripheral<R>(
        &self,
        handle: &PeripheralHandle,
        f: impl FnOnce(&mut PeripheralState) -> R,
    ) -> R {
        let mut state = self.shared.lock();
        f(state.peripheral(handle))
    }

    /// Like [`Self::with_peripheral`], without creating state for an unknown
    /// handle
    pub(crate) fn with_known<R>(
        &self,
        handle: &PeripheralHandle,
        f: impl FnOnce(&mut PeripheralState) -> R,
    ) -> Option<R> {
        let mut state = self.shared.lock();
        state.peripherals.get_mut(handle).map(f)
    }

    /// Like [`Self::with_peripheral`], but only while `handle` is connected
    pub(crate) fn with_active<R>(
        &self,
        handle: &PeripheralHandle,
        f: impl FnOnce(&mut PeripheralState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.shared.lock();
        if !state.active.contains_key(handle) {
            return Err(SwitchLinkError::NotConnected);
        }
        f(state.peripheral(handle))
    }

    pub(crate) fn cached_services(&self, handle: &PeripheralHandle) -> Result<Option<Vec<Uuid>>> {
        let state = self.shared.lock();
        let connection = state
            .active
            .get(handle)
            .ok_or(SwitchLinkError::NotConnected)?;
        Ok(connection.services.clone())
    }

    pub(crate) fn cached_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: &Uuid,
    ) -> Result<Option<Vec<CharacteristicInfo>>> {
        let state = self.shared.lock();
        let connection = state
            .active
            .get(handle)
            .ok_or(SwitchLinkError::NotConnected)?;
        Ok(connection.characteristics.get(service).cloned())
    }

    /// Arm an operation on a connected handle; the timer rejects with the
    /// given error
    pub(crate) fn arm_operation<T: SinkValue>(
        &self,
        handle: &PeripheralHandle,
        kind: OperationKind,
        target: TaskTarget,
        timeout: Option<(Duration, SwitchLinkError)>,
    ) -> Result<PendingTask<T>> {
        let mut state = self.shared.lock();
        if !state.active.contains_key(handle) {
            return Err(SwitchLinkError::NotConnected);
        }
        let (sink, rx) = ResultSink::channel::<T>();
        let id = state.peripheral(handle).slot.arm(kind, target, sink)?;
        if let Some((after, err)) = timeout {
            self.schedule(&mut state, handle, id, after, TimerAction::Reject(err));
        }
        Ok(self.pending_task(handle, id, rx))
    }

    /// Arm an operation the platform never acknowledges; it succeeds after
    /// `delay` unless resolved earlier
    pub(crate) fn arm_unacknowledged(
        &self,
        handle: &PeripheralHandle,
        kind: OperationKind,
        target: TaskTarget,
        delay: Duration,
    ) -> Result<PendingTask<()>> {
        let mut state = self.shared.lock();
        if !state.active.contains_key(handle) {
            return Err(SwitchLinkError::NotConnected);
        }
        let (sink, rx) = ResultSink::channel::<()>();
        let id = state.peripheral(handle).slot.arm(kind, target, sink)?;
        self.schedule(&mut state, handle, id, delay, TimerAction::Fulfill);
        Ok(self.pending_task(handle, id, rx))
    }

    fn pending_task<T>(
        &self,
        handle: &PeripheralHandle,
        id: TaskId,
        rx: oneshot::Receiver<Result<T>>,
    ) -> PendingTask<T> {
        PendingTask {
            registry: self.clone(),
            handle: handle.clone(),
            id,
            rx,
            settled: false,
        }
    }

    /// Free the slot of a task whose caller stopped waiting
    fn abandon(&self, handle: &PeripheralHandle, id: TaskId) {
        let mut state = self.shared.lock();
        let abandoned = state
            .peripherals
            .get_mut(handle)
            .map(|p| p.slot.abandon(id))
            .unwrap_or(false);
        if abandoned {
            state.prune(handle);
        }
    }

    fn schedule(
        &self,
        state: &mut RegistryState,
        handle: &PeripheralHandle,
        id: TaskId,
        after: Duration,
        action: TimerAction,
    ) {
        let timer = self.spawn_timer(handle.clone(), id, after, action);
        state.peripheral(handle).slot.attach_timer(id, timer);
    }

    fn spawn_timer(
        &self,
        handle: PeripheralHandle,
        id: TaskId,
        after: Duration,
        action: TimerAction,
    ) -> JoinHandle<()> {
        let shared: Weak<Mutex<RegistryState>> = Arc::downgrade(&self.shared);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let cancel = shared.lock().expire(&handle, id, action);
            if cancel {
                transport.cancel_connection(&handle);
            }
        })
    }
}

/// The peripheral state of `handle` if its live task is `kind` on `target`
fn waiting<'a>(
    state: &'a mut RegistryState,
    handle: &PeripheralHandle,
    kind: OperationKind,
    target: TaskTarget,
) -> Option<&'a mut PeripheralState> {
    let peripheral = state.peripherals.get_mut(handle)?;
    if peripheral.slot.is_waiting_for(kind, &target) {
        Some(peripheral)
    } else {
        debug!(
            "Stale {:?} callback for {} ignored (active: {:?})",
            kind,
            handle,
            peripheral.slot.kind()
        );
        None
    }
}

/// Receiving end of an armed task. Dropping it before the result arrives
/// abandons the task so the slot does not stay occupied.
pub(crate) struct PendingTask<T> {
    registry: ConnectionRegistry,
    handle: PeripheralHandle,
    id: TaskId,
    rx: oneshot::Receiver<Result<T>>,
    settled: bool,
}

impl<T> PendingTask<T> {
    /// Await the result; a sink dropped without resolution means the link
    /// state it belonged to is gone
    pub(crate) async fn wait(mut self) -> Result<T> {
        let result = (&mut self.rx)
            .await
            .unwrap_or(Err(SwitchLinkError::NotConnected));
        self.settled = true;
        result
    }
}

impl<T> Drop for PendingTask<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.abandon(&self.handle, self.id);
        }
    }
}

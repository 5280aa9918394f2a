//! Scripted in-memory transport for unit tests
//!
//! Records every command and answers through an mpsc channel that a pump
//! task drains into [`ConnectionRegistry::handle_event`], so callbacks
//! arrive asynchronously the way a platform delegate delivers them.

use super::abstraction::{
    BleTransport, CharacteristicId, CharacteristicInfo, CharacteristicProperties,
    PeripheralHandle, TransportEvent, WriteType,
};
use super::registry::ConnectionRegistry;
use crate::config::EngineConfig;
use crate::crypto::KeyStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportCall {
    Connect(PeripheralHandle),
    CancelConnection(PeripheralHandle),
    Disconnect(PeripheralHandle),
    DiscoverServices(PeripheralHandle),
    DiscoverCharacteristics(PeripheralHandle, Uuid),
    Read(PeripheralHandle, CharacteristicId),
    Write(PeripheralHandle, CharacteristicId, Vec<u8>, WriteType),
    SetNotify(PeripheralHandle, CharacteristicId, bool),
}

struct Behaviour {
    auto_connect: bool,
    auto_disconnect: bool,
    ack_writes: bool,
    ack_notify: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_disconnect: true,
            ack_writes: true,
            ack_notify: true,
        }
    }
}

/// Notification replies queued per written characteristic: each write pops
/// one reply and emits its fragments on the reply topic
type ReplyQueue = VecDeque<(CharacteristicId, Vec<Vec<u8>>)>;

#[derive(Default)]
struct Script {
    known: HashSet<PeripheralHandle>,
    services: HashMap<Uuid, Vec<CharacteristicInfo>>,
    reads: HashMap<CharacteristicId, Vec<u8>>,
    replies: HashMap<CharacteristicId, ReplyQueue>,
}

pub(crate) struct ScriptedTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Mutex<Vec<TransportCall>>,
    behaviour: Mutex<Behaviour>,
    script: Mutex<Script>,
}

/// Registry wired to a scripted transport, with the event pump running
pub(crate) fn harness() -> (ConnectionRegistry, Arc<ScriptedTransport>) {
    harness_with(KeyStore::new(), &EngineConfig::default())
}

pub(crate) fn harness_with(
    keys: KeyStore,
    config: &EngineConfig,
) -> (ConnectionRegistry, Arc<ScriptedTransport>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ScriptedTransport {
        events: tx,
        calls: Mutex::new(Vec::new()),
        behaviour: Mutex::new(Behaviour::default()),
        script: Mutex::new(Script::default()),
    });
    let registry = ConnectionRegistry::new(transport.clone(), keys, config);

    let pump = registry.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            pump.handle_event(event);
        }
    });
    (registry, transport)
}

impl ScriptedTransport {
    pub fn add_peripheral(&self, handle: &PeripheralHandle) {
        self.script.lock().known.insert(handle.clone());
    }

    /// Expose a characteristic with read/write/notify support
    pub fn add_characteristic(&self, id: CharacteristicId) {
        let properties = CharacteristicProperties {
            read: true,
            write: true,
            write_without_response: true,
            notify: true,
        };
        self.script
            .lock()
            .services
            .entry(id.service)
            .or_default()
            .push(CharacteristicInfo::new(id.characteristic, properties));
    }

    pub fn set_read_value(&self, id: CharacteristicId, value: Vec<u8>) {
        self.script.lock().reads.insert(id, value);
    }

    /// On the next write to `written`, emit `fragments` on `topic`
    pub fn reply_on_write(
        &self,
        written: CharacteristicId,
        topic: CharacteristicId,
        fragments: Vec<Vec<u8>>,
    ) {
        self.script
            .lock()
            .replies
            .entry(written)
            .or_default()
            .push_back((topic, fragments));
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.behaviour.lock().auto_connect = enabled;
    }

    pub fn set_auto_disconnect(&self, enabled: bool) {
        self.behaviour.lock().auto_disconnect = enabled;
    }

    pub fn set_ack_writes(&self, enabled: bool) {
        self.behaviour.lock().ack_writes = enabled;
    }

    pub fn set_ack_notify(&self, enabled: bool) {
        self.behaviour.lock().ack_notify = enabled;
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn notify_calls(&self, enabled: bool) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, TransportCall::SetNotify(_, _, on) if *on == enabled))
            .count()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write(_, _, data, _) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }
}

impl BleTransport for ScriptedTransport {
    fn has_peripheral(&self, handle: &PeripheralHandle) -> bool {
        self.script.lock().known.contains(handle)
    }

    fn connect(&self, handle: &PeripheralHandle) {
        self.record(TransportCall::Connect(handle.clone()));
        if self.behaviour.lock().auto_connect {
            self.emit(TransportEvent::Connected {
                handle: handle.clone(),
            });
        }
    }

    fn cancel_connection(&self, handle: &PeripheralHandle) {
        self.record(TransportCall::CancelConnection(handle.clone()));
        self.emit(TransportEvent::Disconnected {
            handle: handle.clone(),
            reason: None,
        });
    }

    fn disconnect(&self, handle: &PeripheralHandle) {
        self.record(TransportCall::Disconnect(handle.clone()));
        if self.behaviour.lock().auto_disconnect {
            self.emit(TransportEvent::Disconnected {
                handle: handle.clone(),
                reason: None,
            });
        }
    }

    fn discover_services(&self, handle: &PeripheralHandle) {
        self.record(TransportCall::DiscoverServices(handle.clone()));
        let services = self.script.lock().services.keys().copied().collect();
        self.emit(TransportEvent::ServicesDiscovered {
            handle: handle.clone(),
            result: Ok(services),
        });
    }

    fn discover_characteristics(&self, handle: &PeripheralHandle, service: Uuid) {
        self.record(TransportCall::DiscoverCharacteristics(handle.clone(), service));
        let chars = self
            .script
            .lock()
            .services
            .get(&service)
            .cloned()
            .unwrap_or_default();
        self.emit(TransportEvent::CharacteristicsDiscovered {
            handle: handle.clone(),
            service,
            result: Ok(chars),
        });
    }

    fn read_characteristic(&self, handle: &PeripheralHandle, characteristic: &CharacteristicId) {
        self.record(TransportCall::Read(handle.clone(), *characteristic));
        let value = self.script.lock().reads.get(characteristic).cloned();
        if let Some(value) = value {
            self.emit(TransportEvent::CharacteristicRead {
                handle: handle.clone(),
                characteristic: *characteristic,
                result: Ok(value),
            });
        }
    }

    fn write_characteristic(
        &self,
        handle: &PeripheralHandle,
        characteristic: &CharacteristicId,
        data: &[u8],
        write_type: WriteType,
    ) {
        self.record(TransportCall::Write(
            handle.clone(),
            *characteristic,
            data.to_vec(),
            write_type,
        ));
        if write_type == WriteType::WithResponse && self.behaviour.lock().ack_writes {
            self.emit(TransportEvent::CharacteristicWritten {
                handle: handle.clone(),
                characteristic: *characteristic,
                result: Ok(()),
            });
        }

        let reply = self
            .script
            .lock()
            .replies
            .get_mut(characteristic)
            .and_then(|queue| queue.pop_front());
        if let Some((topic, fragments)) = reply {
            for value in fragments {
                self.emit(TransportEvent::Notification {
                    handle: handle.clone(),
                    characteristic: topic,
                    value,
                });
            }
        }
    }

    fn set_notify(&self, handle: &PeripheralHandle, characteristic: &CharacteristicId, enabled: bool) {
        self.record(TransportCall::SetNotify(
            handle.clone(),
            *characteristic,
            enabled,
        ));
        if self.behaviour.lock().ack_notify {
            self.emit(TransportEvent::NotificationStateChanged {
                handle: handle.clone(),
                characteristic: *characteristic,
                result: Ok(enabled),
            });
        }
    }
}

// Transport module: BLE link management and request/response plumbing

pub mod abstraction;
pub mod engine;
pub mod notify;
pub mod reassembly;
pub mod registry;
pub mod stream;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use abstraction::{
    AdapterState, BleTransport, CharacteristicId, CharacteristicInfo, CharacteristicProperties,
    PeripheralHandle, TransportEvent, WriteType,
};
pub use engine::{NotificationSubscription, RequestResponseEngine};
pub use notify::{NotificationBus, NotificationCallback, NotifyState, SubscriberId, Unsubscribed};
pub use reassembly::{frame_notification, NotificationReassembler, LENGTH_HEADER_SIZE};
pub use registry::{ConnectionRegistry, ConnectionState};
pub use stream::{ProcessStep, StreamProcessor};
pub use task::{OperationKind, TaskId, TaskSlot, TaskTarget, TaskValue};

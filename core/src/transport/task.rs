//! Single-outstanding-operation holder per peripheral
//!
//! A [`TaskSlot`] stores the completion sink of the one operation currently
//! in flight for a handle. Transport callbacks and locally scheduled timers
//! race to resolve it; the first resolution takes the task out of the slot,
//! so every later attempt finds the slot empty (or re-armed with a different
//! [`TaskId`]) and becomes a no-op.

use super::abstraction::{CharacteristicId, CharacteristicInfo};
use crate::error::{Result, SwitchLinkError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

/// Kind of the operation held by a task slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    None,
    Connect,
    CancelPendingConnection,
    Disconnect,
    ErrorDisconnect,
    AwaitDisconnect,
    GetServices,
    GetCharacteristics,
    ReadCharacteristic,
    WriteCharacteristic,
    EnableNotifications,
    DisableNotifications,
}

impl OperationKind {
    /// Operations that complete when the link goes down
    pub fn completes_on_disconnect(&self) -> bool {
        matches!(
            self,
            OperationKind::CancelPendingConnection
                | OperationKind::Disconnect
                | OperationKind::ErrorDisconnect
                | OperationKind::AwaitDisconnect
        )
    }
}

/// What a task is waiting on, used to match completion callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTarget {
    Peripheral,
    Service(Uuid),
    Characteristic(CharacteristicId),
}

/// Identity of one armed task; timers carry it so a stale timer cannot
/// resolve a newer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

// Unique across slots, so a slot recreated for the same handle never reuses
// an id an old timer or waiter still holds.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// ============================================================================
// RESULT VALUES AND SINKS
// ============================================================================

/// A successful result, tagged by category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskValue {
    Void,
    Bytes(Vec<u8>),
    Services(Vec<Uuid>),
    Characteristics(Vec<CharacteristicInfo>),
}

impl TaskValue {
    pub fn category(&self) -> &'static str {
        match self {
            TaskValue::Void => "void",
            TaskValue::Bytes(_) => "bytes",
            TaskValue::Services(_) => "services",
            TaskValue::Characteristics(_) => "characteristics",
        }
    }
}

/// Typed completion channel of the caller waiting on a task
#[derive(Debug)]
pub enum ResultSink {
    Void(oneshot::Sender<Result<()>>),
    Bytes(oneshot::Sender<Result<Vec<u8>>>),
    Services(oneshot::Sender<Result<Vec<Uuid>>>),
    Characteristics(oneshot::Sender<Result<Vec<CharacteristicInfo>>>),
}

impl ResultSink {
    /// Create a sink for `T` together with the receiving end
    pub fn channel<T: SinkValue>() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (T::into_sink(tx), rx)
    }

    pub fn category(&self) -> &'static str {
        match self {
            ResultSink::Void(_) => "void",
            ResultSink::Bytes(_) => "bytes",
            ResultSink::Services(_) => "services",
            ResultSink::Characteristics(_) => "characteristics",
        }
    }

    fn deliver(self, value: TaskValue) {
        let delivered = match (self, value) {
            (ResultSink::Void(tx), TaskValue::Void) => tx.send(Ok(())).is_ok(),
            (ResultSink::Bytes(tx), TaskValue::Bytes(data)) => tx.send(Ok(data)).is_ok(),
            (ResultSink::Services(tx), TaskValue::Services(services)) => {
                tx.send(Ok(services)).is_ok()
            }
            (ResultSink::Characteristics(tx), TaskValue::Characteristics(chars)) => {
                tx.send(Ok(chars)).is_ok()
            }
            (sink, value) => {
                let expected = sink.category();
                let got = value.category();
                error!(
                    "Result type mismatch: sink expects {}, resolved with {}",
                    expected, got
                );
                sink.reject(SwitchLinkError::ResultTypeMismatch { expected, got });
                return;
            }
        };
        if !delivered {
            debug!("Task result dropped: caller no longer waiting");
        }
    }

    fn reject(self, err: SwitchLinkError) {
        let delivered = match self {
            ResultSink::Void(tx) => tx.send(Err(err)).is_ok(),
            ResultSink::Bytes(tx) => tx.send(Err(err)).is_ok(),
            ResultSink::Services(tx) => tx.send(Err(err)).is_ok(),
            ResultSink::Characteristics(tx) => tx.send(Err(err)).is_ok(),
        };
        if !delivered {
            debug!("Task rejection dropped: caller no longer waiting");
        }
    }
}

/// Value types a task can resolve with
pub trait SinkValue: Sized + Send + 'static {
    fn into_sink(tx: oneshot::Sender<Result<Self>>) -> ResultSink;
}

impl SinkValue for () {
    fn into_sink(tx: oneshot::Sender<Result<Self>>) -> ResultSink {
        ResultSink::Void(tx)
    }
}

impl SinkValue for Vec<u8> {
    fn into_sink(tx: oneshot::Sender<Result<Self>>) -> ResultSink {
        ResultSink::Bytes(tx)
    }
}

impl SinkValue for Vec<Uuid> {
    fn into_sink(tx: oneshot::Sender<Result<Self>>) -> ResultSink {
        ResultSink::Services(tx)
    }
}

impl SinkValue for Vec<CharacteristicInfo> {
    fn into_sink(tx: oneshot::Sender<Result<Self>>) -> ResultSink {
        ResultSink::Characteristics(tx)
    }
}

// ============================================================================
// TASK SLOT
// ============================================================================

#[derive(Debug)]
struct ArmedTask {
    id: TaskId,
    kind: OperationKind,
    target: TaskTarget,
    sink: ResultSink,
    timer: Option<JoinHandle<()>>,
}

impl ArmedTask {
    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskSlot {
    armed: Option<ArmedTask>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new operation. Fails without touching the live task when the
    /// slot is occupied.
    pub fn arm(
        &mut self,
        kind: OperationKind,
        target: TaskTarget,
        sink: ResultSink,
    ) -> Result<TaskId> {
        if let Some(active) = &self.armed {
            error!(
                "Task slot occupied by {:?} ({}), refusing to arm {:?}",
                active.kind, active.id, kind
            );
            return Err(SwitchLinkError::TaskSlotOccupied {
                active: active.kind,
                requested: kind,
            });
        }

        let id = TaskId::next();
        debug!("Armed {} {:?} on {:?}", id, kind, target);
        self.armed = Some(ArmedTask {
            id,
            kind,
            target,
            sink,
            timer: None,
        });
        Ok(id)
    }

    /// Attach a timer to the task `id`. A timer for a task that already
    /// resolved is aborted immediately.
    pub fn attach_timer(&mut self, id: TaskId, timer: JoinHandle<()>) {
        match &mut self.armed {
            Some(task) if task.id == id => {
                task.disarm_timer();
                task.timer = Some(timer);
            }
            _ => timer.abort(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Kind of the live task, `OperationKind::None` when idle
    pub fn kind(&self) -> OperationKind {
        self.armed
            .as_ref()
            .map(|task| task.kind)
            .unwrap_or(OperationKind::None)
    }

    pub fn target(&self) -> Option<TaskTarget> {
        self.armed.as_ref().map(|task| task.target)
    }

    pub fn current_id(&self) -> Option<TaskId> {
        self.armed.as_ref().map(|task| task.id)
    }

    /// Whether the live task is of `kind` and waits on `target`
    pub fn is_waiting_for(&self, kind: OperationKind, target: &TaskTarget) -> bool {
        self.armed
            .as_ref()
            .map(|task| task.kind == kind && &task.target == target)
            .unwrap_or(false)
    }

    /// Resolve the live task with `value`. Returns false if nothing was armed.
    pub fn fulfill(&mut self, value: TaskValue) -> bool {
        match self.take() {
            Some(task) => {
                debug!("Fulfilled {} {:?}", task.id, task.kind);
                task.sink.deliver(value);
                true
            }
            None => false,
        }
    }

    /// Reject the live task with `err`. Returns false if nothing was armed.
    pub fn reject(&mut self, err: SwitchLinkError) -> bool {
        match self.take() {
            Some(task) => {
                debug!("Rejected {} {:?}: {}", task.id, task.kind, err);
                task.sink.reject(err);
                true
            }
            None => false,
        }
    }

    /// Fulfill only if `id` is still the live task
    pub fn fulfill_task(&mut self, id: TaskId, value: TaskValue) -> bool {
        if self.current_id() != Some(id) {
            return false;
        }
        self.fulfill(value)
    }

    /// Reject only if `id` is still the live task
    pub fn reject_task(&mut self, id: TaskId, err: SwitchLinkError) -> bool {
        if self.current_id() != Some(id) {
            return false;
        }
        self.reject(err)
    }

    /// Drop task `id` without resolving it; its caller stopped waiting
    pub fn abandon(&mut self, id: TaskId) -> bool {
        if self.current_id() != Some(id) {
            return false;
        }
        match self.take() {
            Some(task) => {
                debug!("Abandoned {} {:?}", task.id, task.kind);
                true
            }
            None => false,
        }
    }

    // Taking the task out is the completion guard.
    fn take(&mut self) -> Option<ArmedTask> {
        let mut task = self.armed.take()?;
        task.disarm_timer();
        Some(task)
    }
}

//! Multi-packet notification streams
//!
//! Subscribe, trigger the peripheral with a write, then feed every
//! reassembled packet to an interpreter until it finishes, aborts or the
//! deadline passes. Notifications are turned off exactly once on every exit
//! path.

use super::abstraction::{CharacteristicId, PeripheralHandle};
use super::engine::{decrypt_incoming, RequestResponseEngine};
use super::reassembly::NotificationReassembler;
use crate::error::{Result, SwitchLinkError};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Verdict of a stream interpreter on one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStep {
    Continue,
    Finished,
    AbortError,
}

#[derive(Clone)]
pub struct StreamProcessor {
    engine: RequestResponseEngine,
}

impl StreamProcessor {
    pub fn new(engine: RequestResponseEngine) -> Self {
        Self { engine }
    }

    /// Run one stream on `topic`.
    ///
    /// `write_command` is awaited once the subscription is live. Every
    /// decrypted packet goes to `interpret`. When the deadline passes after a
    /// successful write and `success_if_write_succeeded` is set, the stream
    /// counts as finished.
    pub async fn run<W, I>(
        &self,
        handle: &PeripheralHandle,
        topic: CharacteristicId,
        write_command: W,
        mut interpret: I,
        timeout: Duration,
        success_if_write_succeeded: bool,
    ) -> Result<()>
    where
        W: Future<Output = Result<()>>,
        I: FnMut(&[u8]) -> ProcessStep,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<Vec<u8>>>();
        let reassembler = Mutex::new(NotificationReassembler::new());
        let registry = self.engine.registry().clone();
        let peer = handle.clone();

        let callback = move |fragment: &[u8]| {
            let mut current = reassembler.lock();
            let packet = match current.merge(fragment) {
                Ok(None) => return,
                Ok(Some(packet)) => {
                    *current = NotificationReassembler::new();
                    decrypt_incoming(&registry, &peer, packet)
                }
                Err(e) => {
                    *current = NotificationReassembler::new();
                    Err(e)
                }
            };
            let _ = tx.send(packet);
        };

        let subscription = self
            .engine
            .enable_notifications(handle, topic, callback)
            .await?;
        let deadline = Instant::now() + timeout;

        let outcome = match timeout_at(deadline, write_command).await {
            Err(_) => Err(SwitchLinkError::StreamTimeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => loop {
                match timeout_at(deadline, rx.recv()).await {
                    Err(_) if success_if_write_succeeded => {
                        debug!("Stream on {} ended by deadline after write", topic);
                        break Ok(());
                    }
                    Err(_) => break Err(SwitchLinkError::StreamTimeout),
                    // The bus dropped our callback: the link went down.
                    Ok(None) => break Err(SwitchLinkError::NotConnected),
                    Ok(Some(Err(e))) => break Err(e),
                    Ok(Some(Ok(packet))) => match interpret(&packet) {
                        ProcessStep::Continue => continue,
                        ProcessStep::Finished => break Ok(()),
                        ProcessStep::AbortError => break Err(SwitchLinkError::ProcessAborted),
                    },
                }
            },
        };

        if let Err(e) = subscription.unsubscribe().await {
            warn!("Failed to close stream on {} for {}: {}", topic, handle, e);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, interpret_result, ResultCode, ResultPacket, PROTOCOL_VERSION};
    use crate::transport::abstraction::WriteType;
    use crate::transport::reassembly::frame_notification;
    use crate::transport::testing::{harness, ScriptedTransport};
    use std::sync::Arc;

    const COMMAND: u16 = 60;

    fn plug() -> PeripheralHandle {
        PeripheralHandle::from("plug-1")
    }

    async fn connected() -> (StreamProcessor, Arc<ScriptedTransport>) {
        let (registry, transport) = harness();
        transport.add_peripheral(&plug());
        transport.add_characteristic(protocol::CONTROL);
        transport.add_characteristic(protocol::RESULT);
        registry.connect(&plug(), None).await.unwrap();
        let engine = RequestResponseEngine::new(registry);
        engine.set_encryption_enabled(&plug(), false);
        (StreamProcessor::new(engine), transport)
    }

    fn framed(codes: &[ResultCode]) -> Vec<Vec<u8>> {
        codes
            .iter()
            .flat_map(|code| {
                let packet = ResultPacket {
                    protocol: PROTOCOL_VERSION,
                    command: COMMAND,
                    result: *code,
                    payload: vec![0x11; 30],
                }
                .encode()
                .unwrap();
                frame_notification(&packet, 20).unwrap()
            })
            .collect()
    }

    async fn run(
        streams: &StreamProcessor,
        success_if_write_succeeded: bool,
    ) -> Result<()> {
        let engine = &streams.engine;
        streams
            .run(
                &plug(),
                protocol::RESULT,
                engine.write(&plug(), &protocol::CONTROL, &[1], WriteType::WithResponse),
                interpret_result(COMMAND),
                Duration::from_secs(5),
                success_if_write_succeeded,
            )
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_until_finished() {
        let (streams, transport) = connected().await;
        transport.reply_on_write(
            protocol::CONTROL,
            protocol::RESULT,
            framed(&[
                ResultCode::WaitForSuccess,
                ResultCode::WaitForSuccess,
                ResultCode::Success,
            ]),
        );

        assert_eq!(run(&streams, false).await, Ok(()));
        assert_eq!(transport.notify_calls(true), 1);
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_packet_reaches_interpreter() {
        let (streams, transport) = connected().await;
        transport.reply_on_write(
            protocol::CONTROL,
            protocol::RESULT,
            framed(&[ResultCode::WaitForSuccess; 4]),
        );

        let mut seen = 0;
        let result = streams
            .run(
                &plug(),
                protocol::RESULT,
                streams
                    .engine
                    .write(&plug(), &protocol::CONTROL, &[1], WriteType::WithResponse),
                |packet: &[u8]| {
                    seen += 1;
                    assert_eq!(packet.len(), 37);
                    if seen == 4 {
                        ProcessStep::Finished
                    } else {
                        ProcessStep::Continue
                    }
                },
                Duration::from_secs(5),
                false,
            )
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(seen, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_turns_notifications_off() {
        let (streams, transport) = connected().await;
        transport.reply_on_write(
            protocol::CONTROL,
            protocol::RESULT,
            framed(&[ResultCode::WaitForSuccess, ResultCode::NoAccess]),
        );

        assert_eq!(
            run(&streams, false).await,
            Err(SwitchLinkError::ProcessAborted)
        );
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_without_finish() {
        let (streams, transport) = connected().await;
        transport.reply_on_write(
            protocol::CONTROL,
            protocol::RESULT,
            framed(&[ResultCode::WaitForSuccess]),
        );

        assert_eq!(
            run(&streams, false).await,
            Err(SwitchLinkError::StreamTimeout)
        );
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_as_success_after_write() {
        let (streams, transport) = connected().await;
        assert_eq!(run(&streams, true).await, Ok(()));
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_not_success() {
        let (streams, transport) = connected().await;
        transport.set_ack_writes(false);
        // The write times out after 4s, before the 5s stream deadline.
        assert!(run(&streams, true).await.is_err());
        assert_eq!(transport.notify_calls(false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_write_frees_slot() {
        let (streams, transport) = connected().await;
        transport.set_ack_writes(false);

        let result = streams
            .run(
                &plug(),
                protocol::RESULT,
                streams
                    .engine
                    .write(&plug(), &protocol::CONTROL, &[1], WriteType::WithResponse),
                interpret_result(COMMAND),
                Duration::from_secs(1),
                true,
            )
            .await;

        assert_eq!(result, Err(SwitchLinkError::StreamTimeout));
        assert_eq!(
            streams.engine.registry().current_operation(&plug()),
            crate::transport::task::OperationKind::None
        );
        assert_eq!(transport.notify_calls(false), 1);
    }
}

// SwitchLink Core: BLE smart-plug protocol engine
//
// One outstanding operation per peripheral, session encryption over every
// characteristic exchange, reassembly of fragmented notifications and
// multi-packet control streams. The platform BLE stack sits behind
// `BleTransport` and reports back through `SwitchLink::handle_event`.

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use config::{ConfigError, EncryptionConfig, EngineConfig, TimeoutConfig};
pub use crypto::{AccessLevel, KeyStore, SessionState};
pub use error::{Result, SwitchLinkError};
pub use protocol::{ControlPacket, ResultCode, ResultPacket};
pub use transport::{
    BleTransport, CharacteristicId, ConnectionRegistry, ConnectionState, NotificationSubscription,
    OperationKind, PeripheralHandle, ProcessStep, RequestResponseEngine, StreamProcessor,
    TransportEvent, WriteType,
};

// ============================================================================
// SWITCHLINK FACADE
// ============================================================================

#[derive(Clone)]
pub struct SwitchLink {
    config: EngineConfig,
    registry: ConnectionRegistry,
    engine: RequestResponseEngine,
    streams: StreamProcessor,
}

impl SwitchLink {
    /// Wire a validated config, the application's keys and the platform
    /// transport together
    pub fn new(
        transport: Arc<dyn BleTransport>,
        keys: KeyStore,
        config: EngineConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SwitchLinkError::InvalidConfig(e.to_string()))?;

        // Initialize tracing (idempotent)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
            )
            .try_init();

        let registry = ConnectionRegistry::new(transport, keys, &config);
        let engine = RequestResponseEngine::new(registry.clone());
        let streams = StreamProcessor::new(engine.clone());
        info!(
            "SwitchLink ready (encryption {})",
            if config.encryption.enabled { "on" } else { "off" }
        );

        Ok(Self {
            config,
            registry,
            engine,
            streams,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &RequestResponseEngine {
        &self.engine
    }

    pub fn streams(&self) -> &StreamProcessor {
        &self.streams
    }

    /// Entry point for every platform callback
    pub fn handle_event(&self, event: TransportEvent) {
        self.registry.handle_event(event);
    }

    // ========================================================================
    // CONNECTION
    // ========================================================================

    pub async fn connect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.registry
            .connect(handle, Some(self.config.timeouts.connect()))
            .await
    }

    /// Connect and run the session handshake. A failed handshake tears the
    /// link down again.
    pub async fn connect_and_establish_session(&self, handle: &PeripheralHandle) -> Result<()> {
        self.connect(handle).await?;
        if let Err(e) = self.engine.establish_session(handle).await {
            if let Err(cleanup) = self.registry.error_disconnect(handle).await {
                warn!("Error disconnect from {} failed: {}", handle, cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        self.registry.disconnect(handle).await
    }

    // ========================================================================
    // CONTROL COMMANDS
    // ========================================================================

    /// Write one control packet and return the result packet answering it
    pub async fn control_command(
        &self,
        handle: &PeripheralHandle,
        command: u16,
        payload: Vec<u8>,
    ) -> Result<ResultPacket> {
        let bytes = ControlPacket::new(command, payload).encode()?;
        let raw = self
            .engine
            .read_once_via_notification(
                handle,
                protocol::RESULT,
                self.engine
                    .write(handle, &protocol::CONTROL, &bytes, WriteType::WithResponse),
            )
            .await?;

        let packet = ResultPacket::parse(&raw)?;
        if packet.command != command {
            return Err(SwitchLinkError::MalformedResultPacket(format!(
                "Result for command {}, expected {}",
                packet.command, command
            )));
        }
        Ok(packet)
    }

    /// Write one control packet and follow the result stream until the
    /// plug reports final success
    pub async fn control_command_until_finished(
        &self,
        handle: &PeripheralHandle,
        command: u16,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let bytes = ControlPacket::new(command, payload).encode()?;
        self.streams
            .run(
                handle,
                protocol::RESULT,
                self.engine
                    .write(handle, &protocol::CONTROL, &bytes, WriteType::WithResponse),
                protocol::interpret_result(command),
                timeout.unwrap_or_else(|| self.config.timeouts.stream()),
                false,
            )
            .await
    }
}

//! Core process
//!
//! Sits between the connection process (terminal traffic) and the site process
//! (user-facing requests). It owns the shared tables, each an injectable service
//! with its own lock:
//!
//! - [`DeviceRegistry`]: which terminal is on which connection, plus busy flags
//! - [`CommandMux`]: command routes correlating replies with waiting requests
//! - [`CooldownTable`]: uids whose logins are suppressed after enrollment
//!
//! [`CoreService::run`] drives one receive loop per inbound queue.
//!
//! ```text
//!  connection process ──► packet loop ──► registry / mux / login handler
//!  site process       ──► site loop   ──► submit / FOTA ──► connection process
//! ```

pub mod cooldown;
pub mod fota;
pub mod mux;
pub mod registry;
pub mod site;
pub mod txid;

pub use cooldown::CooldownTable;
pub use fota::{FirmwareImage, FirmwareStore, FotaFailure, FotaOutcome, FotaPlan, FotaSession};
pub use mux::{CommandMux, CommandReply, RouteDelivery};
pub use registry::{BusyGuard, DeviceRecord, DeviceRegistry};
pub use site::SiteLink;
pub use txid::{CORE_TRANSACTION_IDS, SITE_TRANSACTION_IDS, TransactionIds};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FotaConfig};
use crate::ipc::{EnvelopeSink, EnvelopeSource};
use crate::types::wire::{cmd_type, fota_layout, fota_status, fota_type};
use crate::types::{
    AddUser, CommandPayload, Envelope, FotaAck, FotaControl, Hello, Login, PacketType,
};
use crate::{ProtocolError, Result};

/// Receives terminal sign-in/out events that survive the cool-down filter.
#[async_trait::async_trait]
pub trait LoginHandler: Send + Sync + 'static {
    async fn on_login(&self, device_id: u64, login: Login);
}

/// Default handler: log the event.
#[derive(Debug, Default)]
pub struct LogLogins;

#[async_trait::async_trait]
impl LoginHandler for LogLogins {
    async fn on_login(&self, device_id: u64, login: Login) {
        info!(
            "Device {}: uid {} ({}) signed {} at {}",
            device_id,
            login.uid,
            login.name,
            if login.sign_in { "in" } else { "out" },
            login.temperature
        );
    }
}

pub struct CoreService {
    registry: Arc<DeviceRegistry>,
    mux: CommandMux,
    firmware: FirmwareStore,
    fota: FotaConfig,
    cooldown: CooldownTable,
    login: Arc<dyn LoginHandler>,
    site: Arc<dyn EnvelopeSink>,
}

impl CoreService {
    /// `downstream` feeds the connection process, `site` answers the site process.
    pub fn new(config: &Config, downstream: Arc<dyn EnvelopeSink>, site: Arc<dyn EnvelopeSink>) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        Self {
            mux: CommandMux::new(registry.clone(), downstream, config.commands.clone()),
            registry,
            firmware: FirmwareStore::new(&config.fota.firmware_dir),
            fota: config.fota.clone(),
            cooldown: CooldownTable::new(config.login.cooldown()),
            login: Arc::new(LogLogins),
            site,
        }
    }

    pub fn with_login_handler(mut self, handler: Arc<dyn LoginHandler>) -> Self {
        self.login = handler;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn mux(&self) -> &CommandMux {
        &self.mux
    }

    pub fn cooldown(&self) -> &CooldownTable {
        &self.cooldown
    }

    pub fn firmware(&self) -> &FirmwareStore {
        &self.firmware
    }

    pub async fn submit(
        &self,
        device_id: u64,
        command_type: u8,
        args: impl Into<Vec<u8>>,
    ) -> Result<CommandReply> {
        self.mux.submit(device_id, command_type, args).await
    }

    /// Stream stored firmware `version` to a terminal.
    pub async fn run_fota(&self, device_id: u64, version: u16) -> Result<FotaOutcome> {
        let image = self.firmware.load(version).await?;
        FotaSession::new(&self.mux, device_id, &image, self.fota.ack_timeout()).run().await
    }

    /// Whether a firmware transfer to `device_id` succeeded.
    pub async fn start_fota(&self, device_id: u64, version: u16) -> bool {
        match self.run_fota(device_id, version).await {
            Ok(outcome) => outcome.is_success(),
            Err(e) => {
                warn!("Device {}: FOTA to {} not started: {}", device_id, version, e);
                false
            }
        }
    }

    /// Run both receive loops until `cancel` fires or one of them fails.
    pub async fn run(
        self: Arc<Self>,
        packets: Box<dyn EnvelopeSource>,
        site: Box<dyn EnvelopeSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("Core running");
        let result = tokio::select! {
            result = self.clone().packet_loop(packets, cancel.clone()) => result,
            result = self.clone().site_loop(site, cancel.clone()) => result,
        };
        if let Err(e) = &result {
            error!("Core stopped: {}", e);
        }
        result
    }

    async fn packet_loop(
        self: Arc<Self>,
        mut source: Box<dyn EnvelopeSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                envelope = source.recv() => envelope?,
            };
            let Some(envelope) = envelope else {
                return Err(ProtocolError::queue_closed("connection process to core"));
            };
            self.handle_packet(envelope).await?;
        }
    }

    async fn handle_packet(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        let device_id = envelope.device_id;
        match envelope.packet_type() {
            PacketType::Hello => {
                let hello = match Hello::decode(&envelope.packet.payload) {
                    Ok(hello) => hello,
                    Err(e) => return self.reject_connection(&envelope, e).await,
                };
                let previous = self.registry.register(envelope.connection_id, &hello);
                if let Some(previous) =
                    previous.filter(|p| p.connection_id != envelope.connection_id)
                {
                    // One live connection per device: retire the old link
                    self.mux.close_route(hello.device_id);
                    self.mux.disconnect(previous.connection_id, hello.device_id).await?;
                }
                if self.fota.auto_update {
                    self.spawn_auto_update(hello);
                }
            }
            PacketType::CmdResponse | PacketType::FotaAck => {
                self.mux.route_response(envelope);
            }
            PacketType::Login => {
                let login = match Login::decode(&envelope.packet.payload) {
                    Ok(login) => login,
                    Err(e) => return self.reject_connection(&envelope, e).await,
                };
                if self.cooldown.is_cooling(login.uid, Instant::now()) {
                    info!("Device {}: ignoring login of freshly enrolled uid {}", device_id, login.uid);
                } else {
                    self.login.on_login(device_id, login).await;
                }
            }
            PacketType::Void | PacketType::Echo => {
                debug!("Device {}: dropping {:?}", device_id, envelope.packet_type());
            }
            PacketType::Goodbye => match self.registry.deregister_connection(envelope.connection_id) {
                Some(device_id) => {
                    self.mux.close_route(device_id);
                }
                None => debug!("Goodbye from unregistered connection {}", envelope.connection_id),
            },
            other => return Err(ProtocolError::unexpected(other, "connection process queue")),
        }
        Ok(())
    }

    /// A terminal sent a payload core cannot read: drop its connection, keep core up.
    async fn reject_connection(&self, envelope: &Envelope, error: ProtocolError) -> Result<()> {
        warn!(
            "Connection {}: malformed {:?}: {}",
            envelope.connection_id,
            envelope.packet_type(),
            error
        );
        self.mux.disconnect(envelope.connection_id, envelope.device_id).await
    }

    fn spawn_auto_update(self: &Arc<Self>, hello: Hello) {
        let service = self.clone();
        tokio::spawn(async move {
            let latest = match service.firmware.latest_version().await {
                Ok(Some(latest)) => latest,
                Ok(None) => return,
                Err(e) => {
                    warn!("Firmware store unavailable: {}", e);
                    return;
                }
            };
            if latest <= hello.fw_version || latest >= fota_layout::VALIDATION_VERSION_MIN {
                return;
            }
            info!("Device {}: updating fw {} -> {}", hello.device_id, hello.fw_version, latest);
            service.start_fota(hello.device_id, latest).await;
        });
    }

    async fn site_loop(
        self: Arc<Self>,
        mut source: Box<dyn EnvelopeSource>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ProtocolError>(1);
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(fatal) = fatal_rx.recv() => return Err(fatal),
                envelope = source.recv() => envelope?,
            };
            let Some(envelope) = envelope else {
                return Err(ProtocolError::queue_closed("site to core"));
            };

            let service = self.clone();
            let fatal_tx = fatal_tx.clone();
            match envelope.packet_type() {
                PacketType::Cmd => {
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_site_command(envelope).await {
                            let _ = fatal_tx.try_send(e);
                        }
                    });
                }
                PacketType::Fota => {
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_site_fota(envelope).await {
                            let _ = fatal_tx.try_send(e);
                        }
                    });
                }
                other => warn!("Site sent {:?}, dropped", other),
            }
        }
    }

    async fn handle_site_command(&self, envelope: Envelope) -> Result<()> {
        let device_id = envelope.device_id;
        let command = CommandPayload::decode(&envelope.packet.payload)?;
        let reply = self.mux.submit(device_id, command.command_type, command.args.clone()).await?;

        if command.command_type == cmd_type::ADD_USER && reply.is_success() {
            let user = AddUser::decode(&command.args)?;
            self.cooldown.add(user.uid, Instant::now());
            debug!("Device {}: uid {} cooling down", device_id, user.uid);
        }

        for part in &reply.parts {
            let packet = part.into_packet(envelope.packet.transaction_id)?;
            self.site.send(&Envelope::new(packet, envelope.connection_id, device_id)).await?;
        }
        Ok(())
    }

    async fn handle_site_fota(&self, envelope: Envelope) -> Result<()> {
        let device_id = envelope.device_id;
        let request = FotaControl::decode(&envelope.packet.payload)?;
        if request.fota_type != fota_type::START {
            warn!("Device {}: site sent FOTA type {}, dropped", device_id, request.fota_type);
            return Ok(());
        }

        let status = match self.run_fota(device_id, request.fw_version).await {
            Ok(outcome) => outcome.status(),
            Err(e) if !e.is_fatal() => {
                warn!("Device {}: FOTA to {} not started: {}", device_id, request.fw_version, e);
                fota_status::FAILED
            }
            Err(e) => return Err(e),
        };
        let ack = FotaAck { fota_type: fota_type::FINAL_ACK, status };
        let packet = ack.into_packet(envelope.packet.transaction_id);
        self.site.send(&Envelope::new(packet, envelope.connection_id, device_id)).await
    }
}

#[cfg(test)]
mod tests;

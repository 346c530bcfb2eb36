//! Firmware over the air
//!
//! A transfer is a lockstep exchange with the terminal:
//!
//! 1. START carries the new version, image CRC32 and block count; the terminal
//!    answers START_ACK (or FAILED_SAME_FW when it already runs that version).
//! 2. Each 4 KiB block goes out as one META packet with the block's CRC16 followed
//!    by eight 512 byte DATA segments; the terminal answers META_ACK once it has
//!    checked the CRC16.
//! 3. FINAL (or FINAL_TEST_ONLY for validation builds) asks the terminal to check
//!    the whole-image CRC32 and commit.
//!
//! The protocol decisions are a pure transition function, [`FotaPlan::step`]; the
//! async [`FotaSession`] only moves packets and feeds events back in.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::mux::CommandMux;
use crate::crc;
use crate::types::wire::{fota_layout, fota_status, fota_type};
use crate::types::{FotaAck, FotaControl, Packet, PacketType};
use crate::{ProtocolError, Result};

/// A block-aligned firmware image ready to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    version: u16,
    bytes: Vec<u8>,
    crc32: u32,
}

impl FirmwareImage {
    /// Wrap an aligned image. Empty or misaligned images are rejected.
    pub fn new(version: u16, bytes: Vec<u8>) -> Result<Self> {
        Self::checked(Path::new("<memory>"), version, bytes)
    }

    fn checked(path: &Path, version: u16, bytes: Vec<u8>) -> Result<Self> {
        let blocks = bytes.len() / fota_layout::BLOCK_LEN;
        if bytes.is_empty() || bytes.len() % fota_layout::BLOCK_LEN != 0 || blocks > u16::MAX as usize
        {
            return Err(ProtocolError::MisalignedImage {
                path: path.to_path_buf(),
                size: bytes.len(),
                block: fota_layout::BLOCK_LEN,
            });
        }
        let crc32 = crc::crc32(&bytes);
        Ok(Self { version, bytes, crc32 })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn blocks(&self) -> u16 {
        (self.bytes.len() / fota_layout::BLOCK_LEN) as u16
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Validation builds verify without committing.
    pub fn is_validation_build(&self) -> bool {
        self.version >= fota_layout::VALIDATION_VERSION_MIN
    }

    pub fn block(&self, index: u16) -> &[u8] {
        let start = index as usize * fota_layout::BLOCK_LEN;
        &self.bytes[start..start + fota_layout::BLOCK_LEN]
    }

    pub fn block_crc16(&self, index: u16) -> u16 {
        crc::crc16(self.block(index))
    }

    pub fn segments(&self, index: u16) -> impl Iterator<Item = &[u8]> {
        self.block(index).chunks(fota_layout::SEGMENT_LEN)
    }
}

/// Directory of firmware images.
///
/// `fw_<version>.bin` is the raw build; `fw_<version>_aligned.bin` is the same
/// image zero-padded to whole blocks and is what gets streamed.
#[derive(Debug, Clone)]
pub struct FirmwareStore {
    dir: PathBuf,
}

impl FirmwareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn raw_path(&self, version: u16) -> PathBuf {
        self.dir.join(format!("fw_{version}.bin"))
    }

    pub fn aligned_path(&self, version: u16) -> PathBuf {
        self.dir.join(format!("fw_{version}_aligned.bin"))
    }

    /// Write the aligned image for `version` next to its raw build.
    pub async fn align(&self, version: u16) -> Result<PathBuf> {
        let raw = self.raw_path(version);
        let mut bytes =
            tokio::fs::read(&raw).await.map_err(|e| ProtocolError::firmware(raw.clone(), e))?;
        let padded = bytes.len().div_ceil(fota_layout::BLOCK_LEN).max(1) * fota_layout::BLOCK_LEN;
        bytes.resize(padded, 0);

        let aligned = self.aligned_path(version);
        tokio::fs::write(&aligned, &bytes)
            .await
            .map_err(|e| ProtocolError::firmware(aligned.clone(), e))?;
        info!("Aligned {} to {} bytes at {}", raw.display(), padded, aligned.display());
        Ok(aligned)
    }

    pub async fn load(&self, version: u16) -> Result<FirmwareImage> {
        let path = self.aligned_path(version);
        let bytes =
            tokio::fs::read(&path).await.map_err(|e| ProtocolError::firmware(path.clone(), e))?;
        FirmwareImage::checked(&path, version, bytes)
    }

    /// Highest version with an aligned image, if any.
    pub async fn latest_version(&self) -> Result<Option<u16>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ProtocolError::firmware(self.dir.clone(), e))?;
        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProtocolError::firmware(self.dir.clone(), e))?
        {
            let name = entry.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix("fw_"))
                .and_then(|n| n.strip_suffix("_aligned.bin"))
                .and_then(|n| n.parse::<u16>().ok());
            latest = latest.max(version);
        }
        Ok(latest)
    }
}

/// Where in the transfer something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaStage {
    Start,
    Block(u16),
    Final,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FotaFailure {
    #[error("terminal is not connected")]
    Inactive,
    #[error("terminal is busy with another operation")]
    Busy,
    #[error("terminal already runs this firmware")]
    SameFirmware,
    #[error("block {block} failed its CRC16 check")]
    BlockCrc { block: u16 },
    #[error("image failed its CRC32 check")]
    ImageCrc,
    #[error("terminal rejected {stage:?} with status {status}")]
    Rejected { stage: FotaStage, status: u8 },
    #[error("expected ack type {expected} during {stage:?}, got {found}")]
    WrongAck { stage: FotaStage, expected: u8, found: u8 },
    #[error("no acknowledgment for {stage:?}")]
    TimedOut { stage: FotaStage },
    #[error("route closed during {stage:?}")]
    RouteClosed { stage: FotaStage },
    #[error("unexpected {packet_type:?} during {stage:?}")]
    Unexpected { stage: FotaStage, packet_type: PacketType },
    #[error("malformed acknowledgment during {stage:?}")]
    Malformed { stage: FotaStage },
}

impl FotaFailure {
    /// FOTA status code reported for this failure.
    pub fn status(&self) -> u8 {
        match self {
            FotaFailure::SameFirmware => fota_status::FAILED_SAME_FW,
            FotaFailure::BlockCrc { .. } => fota_status::FAILED_CRC16,
            FotaFailure::ImageCrc => fota_status::FAILED_CRC32,
            FotaFailure::TimedOut { .. } => fota_status::TIMEDOUT,
            FotaFailure::Rejected { status, .. } => *status,
            FotaFailure::Inactive | FotaFailure::Busy | FotaFailure::RouteClosed { .. } => {
                fota_status::FAILED
            }
            FotaFailure::WrongAck { .. }
            | FotaFailure::Unexpected { .. }
            | FotaFailure::Malformed { .. } => {
                fota_status::FAILED_REASON_UNKNOWN
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaOutcome {
    Complete,
    Failed(FotaFailure),
}

impl FotaOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FotaOutcome::Complete)
    }

    pub fn status(&self) -> u8 {
        match self {
            FotaOutcome::Complete => fota_status::GOOD,
            FotaOutcome::Failed(failure) => failure.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaState {
    Idle,
    AwaitingStartAck,
    AwaitingBlockAck { block: u16 },
    AwaitingFinalAck,
    Complete,
    Failed(FotaFailure),
}

impl FotaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FotaState::Complete | FotaState::Failed(_))
    }

    fn stage(&self) -> FotaStage {
        match self {
            FotaState::AwaitingBlockAck { block } => FotaStage::Block(*block),
            FotaState::AwaitingFinalAck | FotaState::Complete => FotaStage::Final,
            _ => FotaStage::Start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaEvent {
    Begin,
    Ack(FotaAck),
    Timeout,
    RouteClosed,
    Unexpected(PacketType),
    /// A FOTA_ACK whose payload could not be decoded
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaAction {
    SendStart,
    SendBlock(u16),
    SendFinal,
}

/// Shape of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FotaPlan {
    pub blocks: u16,
    pub validation_only: bool,
}

impl FotaPlan {
    pub fn for_image(image: &FirmwareImage) -> Self {
        Self { blocks: image.blocks(), validation_only: image.is_validation_build() }
    }

    fn final_ack_type(&self) -> u8 {
        if self.validation_only { fota_type::FINAL_TEST_ACK } else { fota_type::FINAL_ACK }
    }

    fn after_block(&self, next: u16) -> (FotaState, Option<FotaAction>) {
        if next < self.blocks {
            (FotaState::AwaitingBlockAck { block: next }, Some(FotaAction::SendBlock(next)))
        } else {
            (FotaState::AwaitingFinalAck, Some(FotaAction::SendFinal))
        }
    }

    /// Transition function of the transfer.
    pub fn step(&self, state: FotaState, event: FotaEvent) -> (FotaState, Option<FotaAction>) {
        let fail = |failure| (FotaState::Failed(failure), None);
        let stage = state.stage();
        match (state, event) {
            (done, _) if done.is_terminal() => (done, None),
            (FotaState::Idle, FotaEvent::Begin) => {
                (FotaState::AwaitingStartAck, Some(FotaAction::SendStart))
            }
            (FotaState::Idle, _) => (FotaState::Idle, None),
            (_, FotaEvent::Begin) => fail(FotaFailure::Unexpected { stage, packet_type: PacketType::Fota }),
            (_, FotaEvent::Timeout) => fail(FotaFailure::TimedOut { stage }),
            (_, FotaEvent::RouteClosed) => fail(FotaFailure::RouteClosed { stage }),
            (_, FotaEvent::Unexpected(packet_type)) => {
                fail(FotaFailure::Unexpected { stage, packet_type })
            }
            (_, FotaEvent::Malformed) => fail(FotaFailure::Malformed { stage }),
            (state, FotaEvent::Ack(ack)) => {
                let expected = match state {
                    FotaState::AwaitingStartAck => fota_type::START_ACK,
                    FotaState::AwaitingBlockAck { .. } => fota_type::META_ACK,
                    _ => self.final_ack_type(),
                };
                if ack.fota_type != expected {
                    return fail(FotaFailure::WrongAck { stage, expected, found: ack.fota_type });
                }
                match (state, ack.status) {
                    (FotaState::AwaitingStartAck, fota_status::GOOD) => self.after_block(0),
                    (FotaState::AwaitingStartAck, fota_status::FAILED_SAME_FW) => {
                        fail(FotaFailure::SameFirmware)
                    }
                    (FotaState::AwaitingBlockAck { block }, fota_status::GOOD) => {
                        self.after_block(block + 1)
                    }
                    (FotaState::AwaitingBlockAck { block }, fota_status::FAILED_CRC16) => {
                        fail(FotaFailure::BlockCrc { block })
                    }
                    (_, fota_status::GOOD) => (FotaState::Complete, None),
                    (FotaState::AwaitingFinalAck, fota_status::FAILED_CRC32) => {
                        fail(FotaFailure::ImageCrc)
                    }
                    (_, status) => fail(FotaFailure::Rejected { stage, status }),
                }
            }
        }
    }
}

/// One firmware transfer to one terminal.
pub struct FotaSession<'a> {
    mux: &'a CommandMux,
    device_id: u64,
    image: &'a FirmwareImage,
    ack_timeout: Duration,
}

impl<'a> FotaSession<'a> {
    pub fn new(
        mux: &'a CommandMux,
        device_id: u64,
        image: &'a FirmwareImage,
        ack_timeout: Duration,
    ) -> Self {
        Self { mux, device_id, image, ack_timeout }
    }

    /// Run the transfer to completion. `Err` only for fatal queue or codec failures.
    pub async fn run(self) -> Result<FotaOutcome> {
        let device_id = self.device_id;
        let registry = self.mux.registry();
        let Some(connection_id) = registry.connection_for(device_id) else {
            warn!("Device {}: FOTA requested for inactive terminal", device_id);
            return Ok(FotaOutcome::Failed(FotaFailure::Inactive));
        };
        let Some(_busy) = registry.try_acquire(device_id) else {
            warn!("Device {}: FOTA rejected, terminal busy", device_id);
            return Ok(FotaOutcome::Failed(FotaFailure::Busy));
        };
        let mut route = self.mux.open_route(device_id)?;

        let plan = FotaPlan::for_image(self.image);
        info!(
            "Device {}: FOTA to version {} ({} blocks, crc32 {:#010x})",
            device_id,
            self.image.version(),
            plan.blocks,
            self.image.crc32()
        );

        let (mut state, mut action) = plan.step(FotaState::Idle, FotaEvent::Begin);
        loop {
            if let Some(action) = action.take() {
                self.perform(connection_id, action).await?;
            }
            match state {
                FotaState::Complete => {
                    info!("Device {}: FOTA complete", device_id);
                    return Ok(FotaOutcome::Complete);
                }
                FotaState::Failed(failure) => {
                    warn!("Device {}: FOTA failed: {}", device_id, failure);
                    return Ok(FotaOutcome::Failed(failure));
                }
                _ => {}
            }

            let event = match tokio::time::timeout(self.ack_timeout, route.recv()).await {
                Err(_) => FotaEvent::Timeout,
                Ok(None) => FotaEvent::RouteClosed,
                Ok(Some(packet)) if packet.packet_type == PacketType::FotaAck => {
                    match FotaAck::decode(&packet.payload) {
                        Ok(ack) => FotaEvent::Ack(ack),
                        Err(e) => {
                            warn!("Device {}: undecodable FOTA_ACK: {}", device_id, e);
                            FotaEvent::Malformed
                        }
                    }
                }
                Ok(Some(packet)) => FotaEvent::Unexpected(packet.packet_type),
            };
            debug!("Device {}: {:?} on {:?}", device_id, event, state);
            (state, action) = plan.step(state, event);
        }
    }

    async fn perform(&self, connection_id: u64, action: FotaAction) -> Result<()> {
        let image = self.image;
        let send = |packet: Packet| self.mux.forward(connection_id, self.device_id, packet);
        match action {
            FotaAction::SendStart => {
                let control = FotaControl::start(image.version(), image.crc32(), image.blocks());
                send(control.into_packet(self.mux.next_transaction_id()).with_ack_required()).await
            }
            FotaAction::SendBlock(block) => {
                let meta = FotaControl::meta(block, image.block_crc16(block));
                send(meta.into_packet(self.mux.next_transaction_id())).await?;
                for segment in image.segments(block) {
                    let txid = self.mux.next_transaction_id();
                    send(Packet::new(PacketType::Data, txid, segment).with_ack_required()).await?;
                }
                Ok(())
            }
            FotaAction::SendFinal => {
                let control = FotaControl::finish(
                    image.version(),
                    image.crc32(),
                    image.blocks(),
                    image.is_validation_build(),
                );
                send(control.into_packet(self.mux.next_transaction_id()).with_ack_required()).await
            }
        }
    }
}

//! End-to-end tests for the core process
//!
//! Every test wires the full stack in one runtime: scripted terminals on loopback
//! TCP, the packet server, core, and a site link, joined by in-memory queues.

use super::*;
use crate::config::Config;
use crate::connection::PacketServer;
use crate::ipc::QueuePair;
use crate::test_utils::{FakeTerminal, TerminalReport, TerminalScript};
use crate::types::wire::{cmd_status, cmd_type, fota_layout, fota_status, fota_type};
use crate::types::{AddUser, CommandResponse, Login, Packet, PacketType};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingLogins {
    seen: Mutex<Vec<(u64, u32)>>,
}

#[async_trait::async_trait]
impl LoginHandler for RecordingLogins {
    async fn on_login(&self, device_id: u64, login: Login) {
        self.seen.lock().push((device_id, login.uid));
    }
}

struct System {
    addr: std::net::SocketAddr,
    core: Arc<CoreService>,
    site: SiteLink,
    logins: Arc<RecordingLogins>,
    cancel: CancellationToken,
}

impl Drop for System {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.fota.ack_timeout_secs = 5;
    config
}

async fn start(config: Config) -> System {
    let (packet_side, core_side) = QueuePair::memory_link("packet", config.ipc.queue_depth);
    let (site_side, core_site) = QueuePair::memory_link("site", config.ipc.queue_depth);
    let logins = Arc::new(RecordingLogins::default());
    let core = Arc::new(
        CoreService::new(&config, core_side.sink, core_site.sink).with_login_handler(logins.clone()),
    );
    let server = Arc::new(PacketServer::new(config.link.clone(), packet_side.sink));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn(core.clone().run(core_side.source, core_site.source, cancel.clone()));
    tokio::spawn(server.run(listener, packet_side.source, cancel.clone()));
    System { addr, core, site: SiteLink::new(site_side), logins, cancel }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl System {
    /// Connect and announce a terminal, without running a script.
    async fn attach(&self, device_id: u64, fw_version: u16) -> FakeTerminal {
        let mut terminal = FakeTerminal::connect(self.addr).await;
        terminal.hello(device_id, fw_version).await;
        let registry = self.core.registry().clone();
        wait_until("registration", || registry.is_active(device_id)).await;
        terminal
    }

    /// Attach a terminal and play `script` in the background.
    async fn spawn_terminal(&self, device_id: u64, script: TerminalScript) -> Arc<Mutex<TerminalReport>> {
        let terminal = self.attach(device_id, script.fw_version).await;
        let report = Arc::new(Mutex::new(TerminalReport::default()));
        tokio::spawn(terminal.run(script, report.clone()));
        report
    }
}

fn firmware_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("clockwire-e2e-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_image(dir: &Path, version: u16, blocks: usize) -> Vec<u8> {
    let image: Vec<u8> =
        (0..blocks * fota_layout::BLOCK_LEN).map(|i| ((i * 7) ^ (i >> 9)) as u8).collect();
    std::fs::write(FirmwareStore::new(dir).aligned_path(version), &image).unwrap();
    image
}

fn fota_config(dir: &Path) -> Config {
    let mut config = test_config();
    config.fota.firmware_dir = dir.to_path_buf();
    config
}

#[tokio::test]
async fn add_user_round_trip() {
    let mut system = start(test_config()).await;
    let report = system.spawn_terminal(42, TerminalScript::obedient(3)).await;

    let alice = AddUser { uid: 7, replace: false, name: "Alice".into() };
    let parts = system.site.command(42, cmd_type::ADD_USER, alice.encode().unwrap()).await.unwrap();

    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].status, cmd_status::GOOD);
    assert_eq!(parts[0].total_packets, 1);
    assert_eq!(parts[0].sequence_number, 0);
    assert!(!system.core.registry().is_busy(42));

    let commands = report.lock().commands.clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_type, cmd_type::ADD_USER);
    assert_eq!(AddUser::decode(&commands[0].args).unwrap(), alice);
    assert!(system.core.cooldown().is_cooling(7, Instant::now()));
}

#[tokio::test]
async fn logins_of_freshly_enrolled_users_are_suppressed() {
    let system = start(test_config()).await;
    let mut terminal = system.attach(42, 3).await;
    system.core.cooldown().add(7, Instant::now());

    for uid in [7u32, 8] {
        let login = Login { temperature: 366, sign_in: true, uid, name: format!("user{uid}") };
        let txid = terminal.next_txid();
        terminal
            .send(Packet::new(PacketType::Login, txid, login.encode().unwrap()).with_ack_required())
            .await;
        terminal.expect(PacketType::ServerAck).await;
    }

    let logins = system.logins.clone();
    wait_until("login delivery", || !logins.seen.lock().is_empty()).await;
    assert_eq!(*system.logins.seen.lock(), vec![(42, 8)]);
}

#[tokio::test]
async fn multi_part_reply_is_reassembled_in_sequence() {
    let mut system = start(test_config()).await;
    let script = TerminalScript::obedient(3).with_handler(|cmd, txid| {
        assert_eq!(cmd.command_type, cmd_type::GET_ALL_USERS);
        [3u8, 0, 4, 1, 2]
            .into_iter()
            .map(|seq| CommandResponse {
                status: cmd_status::GOOD,
                transaction_id: txid,
                total_packets: 5,
                sequence_number: seq,
                body: vec![seq; 10],
            })
            .collect()
    });
    system.spawn_terminal(42, script).await;

    let parts = system.site.command(42, cmd_type::GET_ALL_USERS, Vec::new()).await.unwrap();
    assert_eq!(parts.len(), 5);
    for (i, part) in parts.iter().enumerate() {
        assert_eq!(part.sequence_number as usize, i);
        assert_eq!(part.body, vec![i as u8; 10]);
    }
}

#[tokio::test]
async fn second_hello_for_a_device_retires_the_first_connection() {
    let system = start(test_config()).await;
    let mut first = system.attach(42, 3).await;
    let registry = system.core.registry().clone();
    let first_connection = registry.connection_for(42).unwrap();

    let mut second = FakeTerminal::connect(system.addr).await;
    second.hello(42, 3).await;
    wait_until("re-registration", || registry.connection_for(42) != Some(first_connection)).await;
    assert!(first.recv().await.is_none());

    let report = Arc::new(Mutex::new(TerminalReport::default()));
    tokio::spawn(second.run(TerminalScript::obedient(3), report.clone()));
    let reply = system.core.submit(42, cmd_type::GET_ALL_USERS, Vec::new()).await.unwrap();
    assert_eq!(reply.status, cmd_status::GOOD);
    assert_eq!(report.lock().commands.len(), 1);
    assert!(registry.is_active(42));
    assert_ne!(registry.connection_for(42), Some(first_connection));
}

#[tokio::test]
async fn malformed_response_fails_only_its_command() {
    let system = start(test_config()).await;
    let mut terminal = system.attach(42, 3).await;

    let core = system.core.clone();
    let pending =
        tokio::spawn(async move { core.submit(42, cmd_type::GET_ALL_USERS, Vec::new()).await });
    let cmd = terminal.expect(PacketType::Cmd).await;
    if cmd.ack_required {
        terminal.send(Packet::device_ack(cmd.transaction_id)).await;
    }
    // Claims more body than a part can carry
    let mut payload = vec![0u8; crate::types::MEDIUM_PAYLOAD];
    payload[5] = 251;
    let txid = terminal.next_txid();
    terminal.send(Packet::new(PacketType::CmdResponse, txid, payload)).await;

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.status, cmd_status::MALFORMED_RESPONSE);
    assert!(!system.core.registry().is_busy(42));

    let report = Arc::new(Mutex::new(TerminalReport::default()));
    tokio::spawn(terminal.run(TerminalScript::obedient(3), report));
    let reply = system.core.submit(42, cmd_type::GET_ALL_USERS, Vec::new()).await.unwrap();
    assert_eq!(reply.status, cmd_status::GOOD);
}

#[tokio::test]
async fn concurrent_submits_admit_one() {
    let system = start(test_config()).await;
    system.spawn_terminal(42, TerminalScript::obedient(3)).await;

    let (first, second) = tokio::join!(
        system.core.submit(42, cmd_type::GET_ALL_USERS, Vec::new()),
        system.core.submit(42, cmd_type::DISPLAY_MSG_LCD, b"hello".to_vec()),
    );
    let mut statuses = vec![first.unwrap().status, second.unwrap().status];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![cmd_status::GOOD, cmd_status::TOO_MANY_OUTSTANDING_COMMANDS]);
    assert!(!system.core.registry().is_busy(42));

    // Reversed submission order, same outcome
    let (first, second) = tokio::join!(
        system.core.submit(42, cmd_type::DISPLAY_MSG_LCD, b"again".to_vec()),
        system.core.submit(42, cmd_type::GET_ALL_USERS, Vec::new()),
    );
    assert_eq!(first.unwrap().status, cmd_status::GOOD);
    assert_eq!(second.unwrap().status, cmd_status::TOO_MANY_OUTSTANDING_COMMANDS);
}

#[tokio::test]
async fn commands_for_unknown_devices_are_rejected() {
    let mut system = start(test_config()).await;
    let parts = system.site.command(77, cmd_type::SYNC, Vec::new()).await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].status, cmd_status::SENT_TO_INACTIVE_CLIENT);
}

#[tokio::test]
async fn silent_terminal_times_out() {
    let mut config = test_config();
    config.commands.timeout_secs = 1;
    let system = start(config).await;
    system.spawn_terminal(42, TerminalScript::obedient(3).with_handler(|_, _| Vec::new())).await;

    let start = Instant::now();
    let reply = system.core.submit(42, cmd_type::DELETE_SPECIFIC_USER, vec![7, 0, 0, 0]).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(reply.status, cmd_status::CMD_TIME_OUT);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert!(!system.core.registry().is_busy(42));
}

#[tokio::test]
async fn disconnect_deregisters_the_device() {
    let system = start(test_config()).await;
    let terminal = system.attach(42, 3).await;
    drop(terminal);

    let registry = system.core.registry().clone();
    wait_until("deregistration", || !registry.is_active(42)).await;
    let reply = system.core.submit(42, cmd_type::SYNC, Vec::new()).await.unwrap();
    assert_eq!(reply.status, cmd_status::SENT_TO_INACTIVE_CLIENT);
}

#[tokio::test]
async fn fota_streams_every_block() {
    let dir = firmware_dir("success");
    let image = write_image(&dir, 9, 3);
    let mut system = start(fota_config(&dir)).await;
    let report = system.spawn_terminal(42, TerminalScript::obedient(3)).await;

    let ack = system.site.fota(42, 9).await.unwrap();
    assert_eq!(ack.status, fota_status::GOOD);

    let report = report.lock().clone();
    assert_eq!(report.fota_starts, 1);
    assert_eq!(report.metas, 3);
    assert_eq!(report.data_packets, 3 * fota_layout::SEGMENTS_PER_BLOCK);
    assert_eq!(report.finals, vec![fota_type::FINAL]);
    assert!(report.crc32_checked);
    assert_eq!(FirmwareImage::new(9, image).unwrap().blocks(), 3);
    assert!(!system.core.registry().is_busy(42));
    assert!(!system.core.mux().has_route(42));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn corrupt_block_fails_before_image_crc() {
    let dir = firmware_dir("corrupt");
    write_image(&dir, 9, 4);
    let system = start(fota_config(&dir)).await;
    let script = TerminalScript { corrupt_block: Some(1), ..TerminalScript::obedient(3) };
    let report = system.spawn_terminal(42, script).await;

    let outcome = system.core.run_fota(42, 9).await.unwrap();
    assert_eq!(outcome, FotaOutcome::Failed(FotaFailure::BlockCrc { block: 1 }));
    assert_eq!(outcome.status(), fota_status::FAILED_CRC16);

    let report = report.lock().clone();
    assert_eq!(report.metas, 2);
    assert!(report.finals.is_empty());
    assert!(!report.crc32_checked);
    assert!(!system.core.registry().is_busy(42));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn same_firmware_is_refused() {
    let dir = firmware_dir("same");
    write_image(&dir, 9, 1);
    let mut system = start(fota_config(&dir)).await;
    let report = system.spawn_terminal(42, TerminalScript::obedient(9)).await;

    let ack = system.site.fota(42, 9).await.unwrap();
    assert_eq!(ack.status, fota_status::FAILED_SAME_FW);
    assert_eq!(report.lock().metas, 0);
    assert!(!system.core.registry().is_busy(42));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn validation_builds_finish_test_only() {
    let dir = firmware_dir("validation");
    write_image(&dir, 0xFF02, 1);
    let system = start(fota_config(&dir)).await;
    let report = system.spawn_terminal(42, TerminalScript::obedient(3)).await;

    assert!(system.core.start_fota(42, 0xFF02).await);
    assert_eq!(report.lock().finals, vec![fota_type::FINAL_TEST_ONLY]);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_firmware_reports_failure() {
    let dir = firmware_dir("missing");
    let mut system = start(fota_config(&dir)).await;
    let report = system.spawn_terminal(42, TerminalScript::obedient(3)).await;

    assert!(!system.core.start_fota(42, 12).await);
    let ack = system.site.fota(42, 12).await.unwrap();
    assert_eq!(ack.status, fota_status::FAILED);
    assert_eq!(report.lock().fota_starts, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn outdated_terminals_are_updated_on_hello() {
    let dir = firmware_dir("auto");
    write_image(&dir, 4, 1);
    write_image(&dir, 6, 2);
    let mut config = fota_config(&dir);
    config.fota.auto_update = true;
    let system = start(config).await;
    let report = system.spawn_terminal(42, TerminalScript::obedient(5)).await;

    wait_until("automatic update", || !report.lock().finals.is_empty()).await;
    let report = report.lock().clone();
    assert_eq!(report.metas, 2);
    assert_eq!(report.finals, vec![fota_type::FINAL]);
    let _ = std::fs::remove_dir_all(&dir);
}

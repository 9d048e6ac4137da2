//! hds-diagnostics 統合テスト
//!
//! 設定 → サービス組み立て → open → 準備 → チャンク送信 → ack → close の
//! 一連の流れを、記録用ディスパッチャと手動タイマー/時計で再現する。

use std::cell::Cell;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hds_diagnostics::{DiagnosticsConfig, DiagnosticsService, SnapshotBackend};
use hds_logbuf::CircularLogBuffer;
use hds_proto::{
    AckEvent, CloseEvent, CloseReason, DataEvent, OpenMetadata, OpenRequest, RejectReason, SnapshotFormat,
    SnapshotType, DIAGNOSTICS_SNAPSHOT_TYPE,
};
use hds_session::{
    Clock, Dispatcher, OpenOutcome, SessionError, SessionState, StreamHandle, Timer, TimerId, TransportKind,
    PREPARE_TIMEOUT_MS,
};
use prost::Message;
use tracing_subscriber::fmt::MakeWriter;

// ==============================================================
// ヘルパー: 外部協調者のテストダブル
// ==============================================================

/// ディスパッチャへの呼び出し記録
#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Accept(StreamHandle),
    Reject(StreamHandle, RejectReason),
    Data(DataEvent),
    Cancel(StreamHandle, CloseReason),
}

#[derive(Default)]
struct RecordingDispatcher {
    log: Vec<Sent>,
}

impl RecordingDispatcher {
    fn data(&self) -> Vec<&DataEvent> {
        self.log
            .iter()
            .filter_map(|s| match s {
                Sent::Data(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn cancels(&self) -> Vec<CloseReason> {
        self.log
            .iter()
            .filter_map(|s| match s {
                Sent::Cancel(_, r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    fn payload(&self) -> Vec<u8> {
        self.data().iter().flat_map(|e| e.data.iter().copied()).collect()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn accept(&mut self, stream: StreamHandle) {
        self.log.push(Sent::Accept(stream));
    }

    fn reject(&mut self, stream: StreamHandle, reason: RejectReason) {
        self.log.push(Sent::Reject(stream, reason));
    }

    fn send_data(&mut self, _stream: StreamHandle, frame: &[u8], _end_of_stream: bool) -> Result<(), SessionError> {
        self.log.push(Sent::Data(DataEvent::decode_from_bytes(frame)?));
        Ok(())
    }

    fn cancel(&mut self, stream: StreamHandle, reason: CloseReason) {
        self.log.push(Sent::Cancel(stream, reason));
    }
}

#[derive(Default)]
struct ManualTimer {
    next: u64,
    armed: Vec<(TimerId, u64)>,
}

impl Timer for ManualTimer {
    fn register(&mut self, deadline_ms: u64) -> Result<TimerId, SessionError> {
        self.next += 1;
        let id = TimerId(self.next);
        self.armed.push((id, deadline_ms));
        Ok(id)
    }

    fn deregister(&mut self, id: TimerId) {
        self.armed.retain(|(armed, _)| *armed != id);
    }
}

struct ManualClock(Cell<u64>);

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

type Service = DiagnosticsService<RecordingDispatcher, ManualTimer, ManualClock>;

// ==============================================================
// ヘルパー: 設定・メッセージ
// ==============================================================

fn files_config(dir: &Path, format: SnapshotFormat) -> DiagnosticsConfig {
    let mut config = DiagnosticsConfig::default();
    config.snapshot.format = format;
    config.storage.folder = dir.join("diagnostics");
    config.storage.zip_file = dir.join("snapshot.zip");
    config.storage.text_file = dir.join("snapshot.txt");
    config.storage.log_capture_mib = 1;
    config
}

fn ring_config(capacity: usize) -> DiagnosticsConfig {
    let mut config = DiagnosticsConfig::default();
    config.snapshot.backend = SnapshotBackend::LogBuffer;
    config.snapshot.format = SnapshotFormat::Text;
    config.buffer.capacity_bytes = capacity;
    config
}

fn build(config: &DiagnosticsConfig, now_ms: u64) -> Service {
    DiagnosticsService::new(
        config,
        RecordingDispatcher::default(),
        ManualTimer::default(),
        ManualClock(Cell::new(now_ms)),
        None,
    )
    .unwrap()
}

fn open_bytes(max_log_size: u64, snapshot_type: SnapshotType) -> Vec<u8> {
    OpenRequest {
        target: "accessory".into(),
        r#type: DIAGNOSTICS_SNAPSHOT_TYPE.into(),
        stream_id: 1,
        metadata: Some(OpenMetadata {
            max_log_size,
            snapshot_type: snapshot_type.bits(),
        }),
    }
    .encode_to_vec()
}

fn ack_bytes(stream: StreamHandle) -> Vec<u8> {
    AckEvent {
        stream_id: stream.0,
        end_of_stream: true,
    }
    .encode_to_vec()
}

fn close_bytes(stream: StreamHandle, reason: CloseReason) -> Vec<u8> {
    CloseEvent::new(stream.0, reason).encode_to_vec()
}

fn write_log(service: &Service, bytes: &[u8]) {
    let writer = service.capture().make_writer();
    writer.make_writer().write_all(bytes).unwrap();
}

/// ワーカーの準備イベントが届くまで消費ループを回す
fn pump_until_event(service: &mut Service) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while service.poll() == 0 {
        assert!(Instant::now() < deadline, "no prepare event within 10s");
        thread::sleep(Duration::from_millis(5));
    }
}

/// 最終チャンクまで送信完了を返し続ける
fn complete_all_sends(service: &mut Service, stream: StreamHandle) {
    loop {
        let last = service
            .manager()
            .dispatcher()
            .data()
            .last()
            .map(|e| e.end_of_stream)
            .unwrap();
        service.manager_mut().on_send_complete(stream, Ok(()));
        if last {
            return;
        }
    }
}

// ==============================================================
// シナリオ
// ==============================================================

#[test]
fn test_ip_text_snapshot_single_chunk_closes_normally() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = build(&files_config(dir.path(), SnapshotFormat::Text), 0);
    write_log(&service, &[b'L'; 100]);

    let stream = StreamHandle(11);
    let outcome = service
        .handle_open(stream, TransportKind::Ip, &open_bytes(8_388_608, SnapshotType::Adk))
        .unwrap();
    assert_eq!(outcome, OpenOutcome::Accepted);
    service.manager_mut().on_stream_open(stream);
    assert_eq!(service.manager().state(), Some(SessionState::Preparing));

    pump_until_event(&mut service);
    let data = service.manager().dispatcher().data();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].data, vec![b'L'; 100]);
    assert_eq!(data[0].data_sequence_number, 1);
    assert!(data[0].end_of_stream);
    assert!(service.manager().timer().armed.is_empty());

    service.manager_mut().on_send_complete(stream, Ok(()));
    service.handle_ack(stream, &ack_bytes(stream)).unwrap();
    assert_eq!(service.manager().dispatcher().cancels(), vec![CloseReason::Normal]);

    service
        .handle_close(stream, &close_bytes(stream, CloseReason::Normal))
        .unwrap();
    assert_eq!(service.manager().state(), None);
    assert_eq!(service.stats().sessions_completed, 1);
}

#[test]
fn test_second_open_rejected_busy_without_disturbing_first() {
    let mut config = ring_config(8 * 1024);
    config.transfer.stream_chunk_bytes = Some(1000);
    let mut service = build(&config, 0);
    write_log(&service, &[b'r'; 3000]);

    let first = StreamHandle(1);
    service
        .handle_open(first, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(first);
    assert_eq!(service.poll(), 1);
    let before = service.stats();
    assert_eq!(before.remaining_bytes, 2000);

    let second = StreamHandle(2);
    let outcome = service
        .handle_open(second, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    assert_eq!(outcome, OpenOutcome::Rejected(RejectReason::Busy));

    let after = service.stats();
    assert_eq!(after.sequence_number, before.sequence_number);
    assert_eq!(after.remaining_bytes, before.remaining_bytes);
    assert_eq!(service.manager().active_stream(), Some(first));
    assert!(service
        .manager()
        .dispatcher()
        .log
        .contains(&Sent::Reject(second, RejectReason::Busy)));

    // 最初のセッションはそのまま最後まで送れる
    complete_all_sends(&mut service, first);
    assert_eq!(service.manager().dispatcher().payload(), vec![b'r'; 3000]);
}

#[test]
fn test_ring_rejects_oversize_write() {
    let mut ring = CircularLogBuffer::new(10).unwrap();
    assert!(ring.enqueue(&[0u8; 18]).is_err());
    assert_eq!(ring.used_space(), 0);
    assert_eq!(ring.remaining_space(), 10);
}

#[test]
fn test_ring_keeps_all_writes_within_capacity() {
    let mut ring = CircularLogBuffer::new(1000).unwrap();
    for i in 0..10u8 {
        assert_eq!(ring.enqueue(&[i; 9]).unwrap(), 0);
    }
    assert_eq!(ring.used_space(), 90);
    assert_eq!(ring.used_space() + ring.remaining_space(), ring.total_size());
}

#[test]
fn test_manufacturer_zip_snapshot_over_many_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = files_config(dir.path(), SnapshotFormat::Zip);
    config.transfer.stream_chunk_bytes = Some(64);
    config.transfer.low_mtu_chunk_bytes = Some(32);
    config.transfer.scratch_bytes = Some(512);
    config.url_parameters.push(hds_diagnostics::config::UrlParameterConfig {
        key: "serial".into(),
        value: "HDS-0001".into(),
    });
    let mut service = build(&config, 1_700_000_000_123);

    let folder = config.storage.folder.clone();
    std::fs::create_dir_all(folder.join("audio")).unwrap();
    std::fs::write(folder.join("audio/clip.log"), b"private").unwrap();
    std::fs::write(folder.join("notes.txt"), b"firmware 1.2.3").unwrap();
    write_log(&service, b"boot\nwifi up\n");

    let stream = StreamHandle(3);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Manufacturer))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    pump_until_event(&mut service);
    complete_all_sends(&mut service, stream);

    let dispatcher = service.manager().dispatcher();
    let data = dispatcher.data();
    assert!(data.len() > 1);
    for (i, event) in data.iter().enumerate() {
        assert_eq!(event.data_sequence_number, i as i64 + 1);
        assert_eq!(event.end_of_stream, i == data.len() - 1);
        assert!(event.data.len() <= 64);
        if i > 0 {
            assert!(event.url_parameters.is_empty());
        }
    }
    let params: Vec<(&str, &str)> = data[0]
        .url_parameters
        .iter()
        .map(|p| (p.key.as_str(), p.value.as_str()))
        .collect();
    assert_eq!(
        params,
        vec![("signed-timestamp", "1700000000123"), ("serial", "HDS-0001")]
    );

    let mut archive = zip::ZipArchive::new(Cursor::new(dispatcher.payload())).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_owned).collect();
    names.sort();
    assert_eq!(names, vec!["diagnostics/adk.log", "diagnostics/notes.txt"]);
    let mut log = String::new();
    archive
        .by_name("diagnostics/adk.log")
        .unwrap()
        .read_to_string(&mut log)
        .unwrap();
    assert_eq!(log, "boot\nwifi up\n");
    assert_eq!(service.stats().remaining_bytes, 0);
}

#[test]
fn test_ble_uses_small_chunks() {
    let mut service = build(&ring_config(8 * 1024), 0);
    write_log(&service, &[b'b'; 2500]);

    let stream = StreamHandle(4);
    service
        .handle_open(stream, TransportKind::Ble, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    service.poll();
    complete_all_sends(&mut service, stream);

    let sizes: Vec<usize> = service
        .manager()
        .dispatcher()
        .data()
        .iter()
        .map(|e| e.data.len())
        .collect();
    assert_eq!(sizes, vec![1024, 1024, 452]);
}

#[test]
fn test_watchdog_expiry_during_file_preparation() {
    let dir = tempfile::tempdir().unwrap();
    let mut service = build(&files_config(dir.path(), SnapshotFormat::Zip), 500);
    write_log(&service, b"something\n");

    let stream = StreamHandle(5);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    let (timer, deadline) = service.manager().timer().armed[0];
    assert_eq!(deadline, 500 + PREPARE_TIMEOUT_MS);

    service.manager_mut().on_timer_fired(timer);
    assert_eq!(
        service.manager().dispatcher().cancels(),
        vec![CloseReason::UnexpectedFailure]
    );

    // ワーカーが先に終わっていても Closing では何も送らない
    thread::sleep(Duration::from_millis(50));
    service.poll();
    assert!(service.manager().dispatcher().data().is_empty());

    service
        .handle_close(stream, &close_bytes(stream, CloseReason::UnexpectedFailure))
        .unwrap();
    assert_eq!(service.manager().state(), None);

    // 作り直しは受理される
    let retry = StreamHandle(6);
    assert_eq!(
        service
            .handle_open(retry, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
            .unwrap(),
        OpenOutcome::Accepted
    );
}

#[test]
fn test_transport_invalidation_mid_stream() {
    let mut config = ring_config(8 * 1024);
    config.transfer.stream_chunk_bytes = Some(500);
    let mut service = build(&config, 0);
    write_log(&service, &[b'i'; 1200]);

    let stream = StreamHandle(7);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    service.poll();
    service.manager_mut().on_send_complete(stream, Ok(()));
    service
        .manager_mut()
        .on_send_complete(stream, Err(SessionError::StreamInvalidated));

    assert_eq!(service.manager().dispatcher().data().len(), 2);
    assert_eq!(
        service.manager().dispatcher().cancels(),
        vec![CloseReason::UnexpectedFailure]
    );
    assert_eq!(service.manager().state(), Some(SessionState::Closing));
}

#[test]
fn test_close_notification_twice_is_harmless() {
    let mut service = build(&ring_config(4096), 0);
    write_log(&service, &[b'c'; 3000]);

    let stream = StreamHandle(8);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    service.poll();

    let close = close_bytes(stream, CloseReason::Canceled);
    service.handle_close(stream, &close).unwrap();
    service.handle_close(stream, &close).unwrap();
    assert_eq!(service.manager().state(), None);
    assert!(service.manager().dispatcher().cancels().is_empty());

    // ログバッファの freeze は解除されている
    let hds_diagnostics::CaptureSink::Buffer(ring) = service.capture() else {
        panic!("log buffer backend expected");
    };
    assert!(!ring.is_frozen());
}

#[test]
fn test_log_buffer_frozen_while_streaming() {
    let mut config = ring_config(4096);
    config.transfer.stream_chunk_bytes = Some(100);
    let mut service = build(&config, 0);
    write_log(&service, &[b'a'; 250]);

    let stream = StreamHandle(9);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    service.poll();

    // 転送中のログは捨てられ、送信量は報告サイズのまま
    write_log(&service, &[b'z'; 50]);
    complete_all_sends(&mut service, stream);
    assert_eq!(service.manager().dispatcher().payload(), vec![b'a'; 250]);

    // 転送後は再び書ける
    write_log(&service, b"after");
    let hds_diagnostics::CaptureSink::Buffer(ring) = service.capture() else {
        panic!("log buffer backend expected");
    };
    assert_eq!(ring.used_space(), 5);
}

#[test]
fn test_missing_folder_cancels_with_unexpected_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = files_config(dir.path(), SnapshotFormat::Zip);
    let mut service = build(&config, 0);
    std::fs::remove_dir_all(&config.storage.folder).unwrap();

    let stream = StreamHandle(10);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    pump_until_event(&mut service);
    assert_eq!(
        service.manager().dispatcher().cancels(),
        vec![CloseReason::UnexpectedFailure]
    );
    assert!(service.manager().timer().armed.is_empty());
}

#[test]
fn test_wake_hook_signals_consumer_loop() {
    let dir = tempfile::tempdir().unwrap();
    let wakes = Arc::new(AtomicUsize::new(0));
    let counter = wakes.clone();
    let mut service = DiagnosticsService::new(
        &files_config(dir.path(), SnapshotFormat::Text),
        RecordingDispatcher::default(),
        ManualTimer::default(),
        ManualClock(Cell::new(0)),
        Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    let stream = StreamHandle(12);
    service
        .handle_open(stream, TransportKind::Ip, &open_bytes(0, SnapshotType::Adk))
        .unwrap();
    service.manager_mut().on_stream_open(stream);
    pump_until_event(&mut service);
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_malformed_open_is_an_error() {
    let mut service = build(&ring_config(1024), 0);
    assert!(service
        .handle_open(StreamHandle(1), TransportKind::Ip, &[0xff, 0xff, 0xff])
        .is_err());
    assert_eq!(service.manager().state(), None);
}

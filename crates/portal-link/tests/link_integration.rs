//! End-to-end tests over a simulated reader.
//!
//! `MockReader` stands in for the serial port: the test queues inbound frames
//! and the mock answers commands the way an R2000 reader does (status byte
//! for settings, a round summary for fast-switch inventory).

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portal_core::codec::{CommandAck, InventoryRound, TagRead};
use portal_core::{
    AnalyzerConfig, AntennaId, Command, Direction, FrameCodec, Message, PowerDbm, ReaderConfig,
    Rssi, SensorEdge, SensorId, TagIdentity,
};
use portal_link::{
    CommandError, EngineConfig, LinkConfig, LinkError, PortalEngine, ReaderPort, RetryPolicy,
    SensorPort, SerialLink,
};
use portal_store::{InventoryStore, SessionPhase, StopReason, StoreConfig};

const READER: u8 = 0x01;
const FAST_SWITCH_INVENTORY: u8 = 0x8A;
const STOP_INVENTORY: u8 = 0x8C;

// =============================================================================
// Mock Reader
// =============================================================================

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    /// Status byte for setting commands; `None` leaves commands unanswered.
    reply_status: Option<u8>,
    broken: bool,
}

#[derive(Clone, Default)]
struct MockReader {
    state: Arc<Mutex<MockState>>,
    codec: FrameCodec,
}

impl MockReader {
    fn answering() -> Self {
        let reader = MockReader::default();
        reader.state.lock().unwrap().reply_status = Some(0x10);
        reader
    }

    fn silent() -> Self {
        MockReader::default()
    }

    fn push(&self, message: Message) {
        let frame = self.codec.encode_message(&message, READER).unwrap();
        self.push_bytes(frame);
    }

    fn push_bytes(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().inbound.push_back(bytes);
    }

    fn break_port(&self) {
        self.state.lock().unwrap().broken = true;
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    fn written_count(&self, command: u8) -> usize {
        self.written().iter().filter(|frame| frame[3] == command).count()
    }

    fn go_silent(&self) {
        self.state.lock().unwrap().reply_status = None;
    }

    fn reply_to(&self, state: &mut MockState, frame: &[u8]) {
        let Some(status) = state.reply_status else {
            return;
        };
        let command = frame[3];
        let reply = if command == FAST_SWITCH_INVENTORY && status == 0x10 {
            Message::InventoryRound(InventoryRound {
                total_reads: 0,
                duration_ms: 25,
            })
        } else {
            Message::CommandAck(CommandAck { command, status })
        };
        let bytes = self.codec.encode_message(&reply, READER).unwrap();
        state.inbound.push_back(bytes);
    }
}

impl ReaderPort for MockReader {
    /// One queued frame per read, like a reader trickling frames out.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = {
            let mut state = self.state.lock().unwrap();
            if state.broken {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            state.inbound.pop_front()
        };
        match next {
            Some(bytes) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }

    fn write_all(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.written.push(frame.to_vec());
        self.reply_to(&mut state, frame);
        Ok(())
    }
}

fn tag_read(epc: &TagIdentity, antenna: AntennaId, dbm: i16) -> Message {
    Message::TagRead(TagRead {
        antenna,
        pc: 0x3000,
        epc: epc.clone(),
        rssi: Rssi::from_dbm(dbm),
        frequency_code: 7,
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Link Tests
// =============================================================================

#[tokio::test]
async fn test_command_is_acknowledged() {
    let reader = MockReader::answering();
    let (link, _events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();

    let command = Command::SetPower(PowerDbm::try_from(30).unwrap());
    let ack = link.send_command(&command).await.unwrap();
    assert_eq!(ack.command, 0x76);
    assert_eq!(ack.status, 0x10);
    assert_eq!(ack.round, None);

    let expected = FrameCodec::default().encode(&command, 0xFF).unwrap();
    assert_eq!(reader.written(), vec![expected]);
    link.close();
}

#[tokio::test]
async fn test_inventory_round_answers_start() {
    let reader = MockReader::answering();
    let (link, _events) = SerialLink::spawn(reader, LinkConfig::default()).unwrap();

    let ack = link
        .send_command(&Command::StartInventory(Default::default()))
        .await
        .unwrap();
    assert_eq!(ack.command, FAST_SWITCH_INVENTORY);
    assert_eq!(ack.round.map(|r| r.duration_ms), Some(25));
    link.close();
}

#[tokio::test]
async fn test_rejected_command() {
    let reader = MockReader::answering();
    reader.state.lock().unwrap().reply_status = Some(0x41);
    let (link, _events) = SerialLink::spawn(reader, LinkConfig::default()).unwrap();

    let result = link.send_command(&Command::StopInventory).await;
    assert_eq!(
        result,
        Err(CommandError::Rejected {
            command: 0x8C,
            status: 0x41
        })
    );
    link.close();
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let config = LinkConfig {
        command_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (link, _events) = SerialLink::spawn(MockReader::silent(), config).unwrap();

    let result = link.send_command(&Command::StopInventory).await;
    assert_eq!(
        result,
        Err(CommandError::Timeout {
            command: 0x8C,
            timeout_ms: 50
        })
    );
    // A timeout does not take the link down.
    assert!(link.is_connected());
    link.close();
}

#[tokio::test]
async fn test_overflow_drops_reads_but_keeps_replies() {
    let reader = MockReader::silent();
    let config = LinkConfig {
        event_queue_capacity: 4,
        ..Default::default()
    };
    let (link, mut events) = SerialLink::spawn(reader.clone(), config).unwrap();

    let epc: TagIdentity = "E2000017221101441890".parse().unwrap();
    for i in 0..10 {
        reader.push(tag_read(&epc, AntennaId::ONE, -70 + i));
    }
    reader.push(Message::CommandAck(CommandAck {
        command: 0x76,
        status: 0x10,
    }));
    wait_until(|| {
        let stats = link.stats();
        stats.frames_decoded == 11 && stats.dropped_events == 7
    })
    .await;

    let stats = link.stats();
    assert_eq!(stats.queued_events, 4);
    assert_eq!(stats.dropped_events, 7);

    let mut kept = Vec::new();
    for _ in 0..4 {
        kept.push(events.next().await.unwrap().message);
    }
    // The newest reads survive, in order, followed by the reply.
    assert!(matches!(&kept[0], Message::TagRead(r) if r.rssi.dbm() == -63));
    assert!(matches!(&kept[2], Message::TagRead(r) if r.rssi.dbm() == -61));
    assert_eq!(kept[3].type_name(), "command_ack");
    link.close();
}

#[tokio::test]
async fn test_persistent_garbage_desynchronizes() {
    let reader = MockReader::silent();
    let config = LinkConfig {
        max_decode_failures: 3,
        ..Default::default()
    };
    let (link, mut events) = SerialLink::spawn(reader.clone(), config).unwrap();

    for _ in 0..3 {
        reader.push_bytes(vec![0x00, 0x55, 0x13]);
    }

    assert_eq!(link.closed().await, LinkError::Desynchronized { failures: 3 });
    assert!(events.next().await.is_none());
    assert_eq!(link.stats().bytes_discarded, 9);
}

#[tokio::test]
async fn test_port_error_fails_link() {
    let reader = MockReader::silent();
    let (link, mut events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();

    reader.break_port();
    assert!(matches!(link.closed().await, LinkError::Io(_)));
    assert!(events.next().await.is_none());
    assert!(!link.state().is_connected());
}

// =============================================================================
// Engine Tests
// =============================================================================

fn engine_store() -> Arc<InventoryStore> {
    // Loose thresholds: these tests exercise the pipeline, not the analyzer.
    Arc::new(InventoryStore::new(StoreConfig {
        analyzer: AnalyzerConfig {
            slope_threshold: 1.0,
            variance_threshold: 1000.0,
            min_span_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    }))
}

#[tokio::test]
async fn test_inbound_passage_with_tag() {
    let reader = MockReader::answering();
    let (link, events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();
    let store = engine_store();
    let engine = PortalEngine::spawn(link, events, store.clone(), EngineConfig::default());
    let mut passages = engine.subscribe_directions();

    engine.start_session(ReaderConfig::default()).await.unwrap();
    assert!(store.is_running());

    let epc: TagIdentity = "E2000017221101441890".parse().unwrap();
    reader.push(Message::SensorEdge(SensorEdge::rising(SensorId::One)));
    for i in 0..6 {
        reader.push(tag_read(&epc, AntennaId::ONE, -70 + 2 * i));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_until(|| store.detected_tags().len() == 1).await;

    reader.push(Message::SensorEdge(SensorEdge::rising(SensorId::Two)));
    reader.push(Message::SensorEdge(SensorEdge::falling(SensorId::One)));
    reader.push(Message::SensorEdge(SensorEdge::falling(SensorId::Two)));

    let passage = tokio::time::timeout(Duration::from_secs(5), passages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(passage.direction, Direction::In);
    assert_eq!(passage.first_sensor, SensorId::One);
    assert_eq!(passage.tags, vec![epc.clone()]);
    assert_eq!(engine.status().direction_events, 1);

    let record = store.get(&epc).unwrap();
    assert_eq!(record.read_count(), 6);

    let status = engine.stop_session().await.unwrap();
    assert_eq!(status.phase, SessionPhase::Stopped);
    assert_eq!(status.stop_reason, Some(StopReason::Requested));
    // Inventory survives the stop.
    assert_eq!(store.len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outbound_passage_without_tags() {
    let reader = MockReader::answering();
    let (link, events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();
    let engine = PortalEngine::spawn(link, events, engine_store(), EngineConfig::default());
    let mut passages = engine.subscribe_directions();

    reader.push(Message::SensorEdge(SensorEdge::rising(SensorId::Two)));
    reader.push(Message::SensorEdge(SensorEdge::rising(SensorId::One)));
    reader.push(Message::SensorEdge(SensorEdge::falling(SensorId::Two)));
    reader.push(Message::SensorEdge(SensorEdge::falling(SensorId::One)));

    let passage = tokio::time::timeout(Duration::from_secs(5), passages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(passage.direction, Direction::Out);
    assert!(passage.tags.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_link_loss_ends_session() {
    let reader = MockReader::answering();
    let (link, events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();
    let store = engine_store();
    let engine = PortalEngine::spawn(link, events, store.clone(), EngineConfig::default());

    engine.start_session(ReaderConfig::default()).await.unwrap();
    reader.break_port();

    wait_until(|| !store.is_running()).await;
    let status = store.session_status();
    assert_eq!(status.phase, SessionPhase::Stopped);
    assert!(matches!(status.stop_reason, Some(StopReason::LinkFailure(_))));
    assert!(!engine.status().link.is_connected());
}

#[tokio::test]
async fn test_start_session_fails_when_reader_rejects() {
    let reader = MockReader::answering();
    reader.state.lock().unwrap().reply_status = Some(0x41);
    let (link, events) = SerialLink::spawn(reader, LinkConfig::default()).unwrap();
    let store = engine_store();
    let engine = PortalEngine::spawn(link, events, store.clone(), EngineConfig::default());

    let err = engine.start_session(ReaderConfig::default()).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(store.session_status().phase, SessionPhase::Idle);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_round_loop_repeats_inventory_until_stopped() {
    let reader = MockReader::answering();
    let (link, events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();
    let config = EngineConfig {
        round_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let engine = PortalEngine::spawn(link, events, engine_store(), config);

    engine.start_session(ReaderConfig::default()).await.unwrap();
    // The start command plus at least three follow-up rounds.
    wait_until(|| reader.written_count(FAST_SWITCH_INVENTORY) >= 4).await;

    engine.stop_session().await.unwrap();
    let rounds = reader.written_count(FAST_SWITCH_INVENTORY);
    assert_eq!(reader.written().last().map(|frame| frame[3]), Some(STOP_INVENTORY));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reader.written_count(FAST_SWITCH_INVENTORY), rounds);
    assert_eq!(reader.written_count(STOP_INVENTORY), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_rounds_end_session_with_command_failure() {
    let reader = MockReader::answering();
    let link_config = LinkConfig {
        command_timeout: Duration::from_millis(30),
        ..Default::default()
    };
    let (link, events) = SerialLink::spawn(reader.clone(), link_config).unwrap();
    let store = engine_store();
    let config = EngineConfig {
        round_interval: Duration::from_millis(5),
        retry: RetryPolicy {
            retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..Default::default()
    };
    let engine = PortalEngine::spawn(link, events, store.clone(), config);

    engine.start_session(ReaderConfig::default()).await.unwrap();
    wait_until(|| reader.written_count(FAST_SWITCH_INVENTORY) >= 2).await;
    let answered = reader.written_count(FAST_SWITCH_INVENTORY);
    reader.go_silent();

    wait_until(|| !store.is_running()).await;
    let status = store.session_status();
    assert_eq!(status.phase, SessionPhase::Stopped);
    assert!(
        matches!(status.stop_reason, Some(StopReason::CommandFailure(_))),
        "unexpected stop reason {:?}",
        status.stop_reason
    );

    // The failing round is sent once and retried once. One more answered
    // round may slip in before the reader goes quiet.
    let sent = reader.written_count(FAST_SWITCH_INVENTORY);
    assert!(sent - answered >= 2 && sent - answered <= 3, "sent {} after {}", sent, answered);
    // A command timeout leaves the link up.
    assert!(engine.status().link.is_connected());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reader.written_count(FAST_SWITCH_INVENTORY), sent);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_default_analyzer_separates_moving_and_static_tags() {
    let reader = MockReader::answering();
    let (link, events) = SerialLink::spawn(reader.clone(), LinkConfig::default()).unwrap();
    let store = Arc::new(InventoryStore::new(StoreConfig::default()));
    let engine = PortalEngine::spawn(link, events, store.clone(), EngineConfig::default());
    engine.start_session(ReaderConfig::default()).await.unwrap();

    // A shelf tag answering in a burst, 1 dB apart.
    let shelf: TagIdentity = "E2000017221101441891".parse().unwrap();
    for i in 0..6 {
        reader.push(tag_read(&shelf, AntennaId::ONE, -60 - (i % 2)));
    }
    wait_until(|| store.get(&shelf).map_or(false, |r| r.read_count() == 6)).await;

    // A carried tag approaching the antenna: +3 dB every 60 ms.
    let carried: TagIdentity = "E2000017221101441890".parse().unwrap();
    for i in 0..6 {
        reader.push(tag_read(&carried, AntennaId::ONE, -70 + 3 * i));
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    wait_until(|| store.get(&carried).map_or(false, |r| r.read_count() == 6)).await;

    let detected = store.detected_tags();
    assert_eq!(detected, vec![carried]);

    engine.stop_session().await.unwrap();
    engine.shutdown().await.unwrap();
}

// =============================================================================
// Sensor Port Tests
// =============================================================================

/// Sensor adapter printing one queued line per read.
#[derive(Clone, Default)]
struct MockSensor {
    lines: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl MockSensor {
    fn print(&self, line: &str) {
        self.lines.lock().unwrap().push_back(line.as_bytes().to_vec());
    }
}

impl ReaderPort for MockSensor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.lines.lock().unwrap().pop_front() {
            Some(line) => {
                buf[..line.len()].copy_from_slice(&line);
                Ok(line.len())
            }
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Err(io::ErrorKind::TimedOut.into())
            }
        }
    }

    fn write_all(&mut self, _frame: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sensor_port_reports_drive_passage() {
    let reader = MockReader::answering();
    let (link, events) = SerialLink::spawn(reader, LinkConfig::default()).unwrap();
    let sensor = MockSensor::default();
    let sensors = SensorPort::spawn(sensor.clone(), &link).unwrap();
    let engine = PortalEngine::spawn(link.clone(), events, engine_store(), EngineConfig::default());
    let mut passages = engine.subscribe_directions();

    sensor.print("#2\r\n");
    sensor.print("#1\r\n");

    let passage = tokio::time::timeout(Duration::from_secs(5), passages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(passage.direction, Direction::Out);
    assert_eq!(passage.first_sensor, SensorId::Two);

    engine.shutdown().await.unwrap();
    link.close();
    wait_until(|| sensors.is_finished()).await;
}

#[tokio::test]
async fn test_sensor_port_failure_keeps_link_up() {
    struct BrokenSensor;

    impl ReaderPort for BrokenSensor {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn write_all(&mut self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    let reader = MockReader::answering();
    let (link, _events) = SerialLink::spawn(reader, LinkConfig::default()).unwrap();
    let sensors = SensorPort::spawn(BrokenSensor, &link).unwrap();

    wait_until(|| sensors.is_finished()).await;
    assert!(link.is_connected());
    link.send_command(&Command::StopInventory).await.unwrap();
    link.close();
}

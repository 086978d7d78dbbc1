//! Endpoint manager integration tests
//!
//! A scripted transport records every callback it receives so the tests can
//! check dispatch order, deficit draining and shutdown behaviour.

use bytes::Bytes;
use codec::{make, AckBatch, Close, StreamMessage};
use network::{
    memory_pair, ActorClock, Application, EndpointContext, EndpointManager, ManualClock,
    Multiplexer, PushResult, ReadinessSet, Result, SocketHandle, TimeoutKind, Transport,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use streaming_config::EndpointSettings;
use types::{ActorAddr, ErrorCode, StreamId};

type Log = Arc<Mutex<Vec<String>>>;

/// Application recording callbacks and echoing nothing
#[derive(Default)]
struct RecordingApp {
    log: Log,
    frames: Vec<Vec<u8>>,
    outgoing: VecDeque<Bytes>,
    errors: Vec<ErrorCode>,
    timeout_args: Vec<(u64, &'static str)>,
    fail_init: bool,
    /// Push one more resolve request when the first timeout fires
    chain_on_timeout: bool,
}

impl RecordingApp {
    fn with_log(log: Log) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }
}

impl Application for RecordingApp {
    type TimeoutArgs = &'static str;

    fn init(&mut self, ctx: &mut EndpointContext) -> Result<()> {
        if self.fail_init {
            return Err(TransportError::init(ctx.handle(), "refused"));
        }
        self.log.lock().push("init".into());
        Ok(())
    }

    fn handle_data(&mut self, _ctx: &mut EndpointContext, frame: &[u8]) -> Result<()> {
        let msg = codec::decode(frame)?;
        self.log.lock().push(format!("data:{}", msg.tag()));
        self.frames.push(frame.to_vec());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.outgoing.pop_front())
    }

    fn has_pending_writes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn resolve(&mut self, _ctx: &mut EndpointContext, path: &str, _listener: ActorAddr) {
        self.log.lock().push(format!("resolve:{}", path));
    }

    fn timeout(&mut self, ctx: &mut EndpointContext, kind: TimeoutKind, id: u64) {
        self.log.lock().push(format!("timeout:{}:{}", kind, id));
        if self.chain_on_timeout {
            self.chain_on_timeout = false;
            ctx.endpoint_handle().resolve("chained", ActorAddr::from_u128(9));
        }
    }

    fn set_timeout(&mut self, id: u64, _kind: TimeoutKind, args: &'static str) {
        self.timeout_args.push((id, args));
    }

    fn handle_error(&mut self, code: ErrorCode) {
        self.log.lock().push(format!("error:{}", code));
        self.errors.push(code);
    }
}

/// Transport logging its own write events around the application
struct ScriptedTransport {
    handle: SocketHandle,
    app: RecordingApp,
    log: Log,
}

impl Transport for ScriptedTransport {
    type Application = RecordingApp;

    fn handle(&self) -> SocketHandle {
        self.handle
    }

    fn application(&self) -> &RecordingApp {
        &self.app
    }

    fn application_mut(&mut self) -> &mut RecordingApp {
        &mut self.app
    }

    fn init(&mut self, ctx: &mut EndpointContext) -> Result<()> {
        self.app.init(ctx)
    }

    fn handle_read_event(&mut self, _ctx: &mut EndpointContext) -> bool {
        self.log.lock().push("read".into());
        true
    }

    fn handle_write_event(&mut self, _ctx: &mut EndpointContext) -> bool {
        self.log.lock().push("write".into());
        false
    }

    fn handle_error(&mut self, code: ErrorCode) {
        self.app.handle_error(code);
    }
}

struct Fixture {
    manager: EndpointManager<ScriptedTransport>,
    clock: Arc<ManualClock>,
    mpx: Arc<ReadinessSet>,
    log: Log,
}

fn fixture() -> Fixture {
    let log = Log::default();
    let transport = ScriptedTransport {
        handle: SocketHandle(42),
        app: RecordingApp::with_log(log.clone()),
        log: log.clone(),
    };
    let clock = Arc::new(ManualClock::new());
    let mpx = Arc::new(ReadinessSet::new());
    let manager = EndpointManager::new(
        transport,
        mpx.clone(),
        clock.clone(),
        EndpointSettings::default(),
    );
    Fixture {
        manager,
        clock,
        mpx,
        log,
    }
}

fn take_log(log: &Log) -> Vec<String> {
    std::mem::take(&mut *log.lock())
}

#[test]
fn test_write_event_drains_backlog_before_writing() {
    let mut f = fixture();
    let handle = f.manager.endpoint_handle();
    let listener = ActorAddr::from_u128(1);

    assert_eq!(handle.resolve("a", listener), PushResult::UnblockedReader);
    handle.deliver_timeout(TimeoutKind::Idle, 0);
    handle.resolve("b", listener);
    handle.deliver_timeout(TimeoutKind::FailureGrace, 1);
    handle.resolve("c", listener);
    assert_eq!(f.mpx.take_ready(), vec![SocketHandle(42)]);

    assert!(!f.manager.handle_write_event());

    assert_eq!(
        take_log(&f.log),
        vec![
            "resolve:a",
            "timeout:idle:0",
            "resolve:b",
            "timeout:failure_grace:1",
            "resolve:c",
            "write",
        ]
    );
}

#[test]
fn test_queue_reblocks_after_drain() {
    let mut f = fixture();
    let handle = f.manager.endpoint_handle();

    handle.resolve("a", ActorAddr::from_u128(1));
    f.manager.handle_write_event();
    take_log(&f.log);

    // Empty queue: only the transport write runs
    f.manager.handle_write_event();
    assert_eq!(take_log(&f.log), vec!["write"]);

    // Blocked again, so the next push wakes the reader
    assert_eq!(
        handle.resolve("b", ActorAddr::from_u128(1)),
        PushResult::UnblockedReader
    );
}

#[test]
fn test_events_pushed_during_drain_are_handled_in_same_pass() {
    let mut f = fixture();
    f.manager.application_mut().chain_on_timeout = true;
    let handle = f.manager.endpoint_handle();

    handle.deliver_timeout(TimeoutKind::Idle, 0);
    f.manager.handle_write_event();

    assert_eq!(
        take_log(&f.log),
        vec!["timeout:idle:0", "resolve:chained", "write"]
    );
    // The chained push found the reader active and did not re-register
    assert_eq!(f.mpx.take_ready(), vec![SocketHandle(42)]);
}

#[test]
fn test_timeout_ids_are_monotonic_and_routed_back() {
    let mut f = fixture();
    let now = f.clock.now();

    let first = f
        .manager
        .set_timeout(now + Duration::from_millis(10), TimeoutKind::Idle, "first");
    let second = f.manager.with_application(|_, ctx| {
        ctx.schedule_timeout(now + Duration::from_millis(20), TimeoutKind::FailureGrace)
    });
    let third = f
        .manager
        .set_timeout(now + Duration::from_millis(5), TimeoutKind::Idle, "third");

    assert_eq!((first, second, third), (0, 1, 2));
    assert_eq!(f.manager.next_timeout_id(), 3);
    assert_eq!(
        f.manager.application().timeout_args,
        vec![(0, "first"), (2, "third")]
    );

    // Nothing is delivered until the clock moves
    f.manager.handle_write_event();
    assert_eq!(take_log(&f.log), vec!["write"]);

    assert_eq!(f.clock.advance(Duration::from_millis(25)), 3);
    assert_eq!(f.mpx.take_ready(), vec![SocketHandle(42)]);
    f.manager.handle_write_event();
    assert_eq!(
        take_log(&f.log),
        vec![
            "timeout:idle:2",
            "timeout:idle:0",
            "timeout:failure_grace:1",
            "write"
        ]
    );
}

#[test]
fn test_handle_error_closes_endpoint() {
    let mut f = fixture();
    let handle = f.manager.endpoint_handle();
    handle.resolve("pending", ActorAddr::from_u128(1));

    f.manager.handle_error(ErrorCode::SocketDisconnected);
    f.manager.handle_error(ErrorCode::SocketDisconnected);

    assert!(f.manager.is_failed());
    assert_eq!(f.manager.application().errors, vec![ErrorCode::SocketDisconnected]);
    assert_eq!(
        handle.deliver_timeout(TimeoutKind::Idle, 0),
        PushResult::QueueClosed
    );
    assert!(!f.manager.handle_write_event());
    assert!(!f.manager.handle_read_event());
    assert!(matches!(
        f.manager.init(),
        Err(TransportError::Closed { .. })
    ));
    // The pending resolve was dropped, never dispatched
    assert_eq!(take_log(&f.log), vec!["error:socket_disconnected"]);
}

#[test]
fn test_init_failure_is_reported() {
    let mut f = fixture();
    f.manager.application_mut().fail_init = true;
    assert!(matches!(f.manager.init(), Err(TransportError::Init { .. })));

    f.manager.application_mut().fail_init = false;
    assert!(f.manager.init().is_ok());
}

#[test]
fn test_serialize_fun_is_the_stream_encoder() {
    let f = fixture();
    let serialize = f.manager.serialize_fun();
    let msg = make(StreamId::new(ActorAddr::from_u128(1), 0), Close);

    let bytes = serialize(&msg).unwrap();
    assert_eq!(bytes, codec::encode(&msg).unwrap());
    assert_eq!(codec::decode(&bytes).unwrap(), msg);
}

#[test]
fn test_read_events_are_forwarded() {
    let mut f = fixture();
    assert!(f.manager.handle_read_event());
    assert_eq!(take_log(&f.log), vec!["read"]);
}

fn memory_managers(
    settings: EndpointSettings,
) -> (
    EndpointManager<network::MemoryTransport<RecordingApp>>,
    EndpointManager<network::MemoryTransport<RecordingApp>>,
    Log,
) {
    let log = Log::default();
    let (a, b) = memory_pair(RecordingApp::with_log(log.clone()), RecordingApp::with_log(log.clone()));
    let clock = Arc::new(ManualClock::new());
    let mpx: Arc<dyn Multiplexer> = Arc::new(ReadinessSet::new());
    (
        EndpointManager::new(a, mpx.clone(), clock.clone(), settings.clone()),
        EndpointManager::new(b, mpx, clock, settings),
        log,
    )
}

fn frames(n: usize) -> Vec<StreamMessage> {
    let sid = StreamId::new(ActorAddr::from_u128(5), 1);
    (0..n)
        .map(|i| {
            make(
                sid,
                AckBatch {
                    new_capacity: 1,
                    acknowledged_id: i as i64,
                },
            )
        })
        .collect()
}

#[test]
fn test_memory_transport_moves_frames_between_managers() {
    let settings = EndpointSettings {
        max_frames_per_write: 2,
        read_buffer_size: 7,
        ..Default::default()
    };
    let (mut left, mut right, log) = memory_managers(settings);
    left.init().unwrap();
    right.init().unwrap();
    take_log(&log);

    for msg in frames(3) {
        left.application_mut()
            .outgoing
            .push_back(codec::encode(&msg).unwrap());
    }

    // Two frames per write event, so one is still pending
    assert!(left.handle_write_event());
    assert!(!left.handle_write_event());

    // Tiny read buffer: frames are reassembled across read events
    while left.transport().unread_outbound() > 0 {
        assert!(right.handle_read_event());
    }

    let received: Vec<StreamMessage> = right
        .application()
        .frames
        .iter()
        .map(|f| codec::decode(f).unwrap())
        .collect();
    assert_eq!(received, frames(3));
    assert_eq!(take_log(&log), vec!["data:demand"; 3]);
}

#[test]
fn test_memory_transport_fails_on_garbage() {
    let (_left, mut right, _log) = memory_managers(EndpointSettings::default());
    right.transport().inject_inbound(&[0xFF; 32]);

    assert!(!right.handle_read_event());
    assert!(right.transport().is_failed());
    assert_eq!(right.application().errors, vec![ErrorCode::MalformedMessage]);

    // A later manager-level error is not reported twice
    right.handle_error(ErrorCode::MalformedMessage);
    assert_eq!(right.application().errors.len(), 1);
}

#[test]
fn test_transport_failure_closes_the_endpoint() {
    let (_left, mut right, _log) = memory_managers(EndpointSettings::default());
    let handle = right.endpoint_handle();
    right.transport().inject_inbound(&[0xAB; 32]);

    assert!(!right.handle_read_event());
    assert!(right.is_failed());
    assert_eq!(
        handle.resolve("late", ActorAddr::from_u128(1)),
        PushResult::QueueClosed
    );
    assert!(!right.handle_write_event());
    assert!(matches!(right.init(), Err(TransportError::Closed { .. })));
    assert_eq!(right.application().errors, vec![ErrorCode::MalformedMessage]);
}

#[test]
fn test_memory_transport_reports_peer_shutdown() {
    let (left, mut right, _log) = memory_managers(EndpointSettings::default());
    left.transport().shutdown();

    assert!(!right.handle_read_event());
    assert_eq!(right.application().errors, vec![ErrorCode::SocketDisconnected]);
}

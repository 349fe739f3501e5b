//! Shared helpers for loopback integration tests.
//!
//! Provides a service runtime, a launch manager with short timeouts, a
//! simulated worker that speaks the handshake and accepts control
//! connections, and recorders for lifecycle events and debugger sessions.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_tether::agent::AgentState;
use agent_tether::launch::handshake::encode_handshake;
use agent_tether::{
    Agent, Connection, DebuggerSession, LaunchEvent, LaunchListener, LaunchManager, TetherConfig,
};
use tokio::runtime::Runtime;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Build a `TetherConfig` with timeouts short enough for tests.
pub fn test_config() -> TetherConfig {
    TetherConfig::from_toml_str(
        r#"
bind_address = "127.0.0.1"

[timeouts]
handshake_millis = 300
connect_millis = 2000
write_millis = 300
"#,
    )
    .expect("valid test config")
}

/// Multi-thread runtime that hosts the manager's background loops.
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime")
}

/// Start a manager with `config`; the runtime must outlive it.
pub fn start(config: TetherConfig) -> (Runtime, LaunchManager) {
    let rt = runtime();
    let manager = LaunchManager::start(config, rt.handle().clone()).expect("manager starts");
    (rt, manager)
}

/// Poll `condition` every 10ms until it holds or `WAIT` elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Wait until the accept loop has armed `agent`'s handshake listener.
pub fn wait_listening(agent: &Agent) {
    assert!(
        wait_until(|| agent.state() != AgentState::Allocated),
        "handshake listener was never armed"
    );
}

/// A worker process stand-in: owns a control listener on loopback.
pub struct FakeWorker {
    control: TcpListener,
}

impl FakeWorker {
    pub fn bind() -> Self {
        let control = TcpListener::bind("127.0.0.1:0").expect("bind control listener");
        control.set_nonblocking(true).expect("non-blocking");
        Self { control }
    }

    pub fn port(&self) -> u16 {
        self.control.local_addr().expect("local addr").port()
    }

    pub fn address(&self) -> SocketAddr {
        self.control.local_addr().expect("local addr")
    }

    /// Call back to `agent` with its key and this worker's control port.
    pub fn handshake(&self, agent: &Agent) -> TcpStream {
        send_handshake(agent.listen_address(), agent.key().as_str(), self.port())
    }

    /// Accept the next control connection the host opens.
    pub fn accept(&self) -> TcpStream {
        let deadline = Instant::now() + WAIT;
        loop {
            match self.control.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).expect("blocking");
                    stream
                        .set_read_timeout(Some(WAIT))
                        .expect("read timeout");
                    return stream;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "host never connected");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => panic!("control accept failed: {err}"),
            }
        }
    }
}

/// Open a socket to `listen` and write one handshake frame on it.
pub fn send_handshake(listen: SocketAddr, key: &str, port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(listen).expect("connect to handshake listener");
    stream
        .write_all(&encode_handshake(key, port).expect("frame"))
        .expect("write handshake");
    stream.set_read_timeout(Some(WAIT)).expect("read timeout");
    stream
}

/// Allocate an agent, complete its handshake, and open one connection.
pub struct Linked {
    pub manager: LaunchManager,
    pub agent: Arc<Agent>,
    pub worker: FakeWorker,
    pub connection: Arc<Connection>,
    /// Worker side of `connection`.
    pub peer: TcpStream,
    pub events: Arc<EventRecorder>,
    _handshake: TcpStream,
    /// Dropped last so sockets deregister from a live reactor.
    pub rt: Runtime,
}

pub fn linked(config: TetherConfig) -> Linked {
    let (rt, manager) = start(config);
    let events = EventRecorder::install(&manager);
    let agent = manager
        .open_for_project("linked", false)
        .expect("agent allocated");
    let worker = FakeWorker::bind();
    let handshake = worker.handshake(&agent);
    assert!(agent.wait_ready(WAIT), "agent never became ready");

    let connection = agent.create_connection().expect("connection opens");
    let peer = worker.accept();
    Linked {
        rt,
        manager,
        agent,
        worker,
        connection,
        peer,
        events,
        _handshake: handshake,
    }
}

/// Records every lifecycle event in arrival order.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<LaunchEvent>>,
}

impl EventRecorder {
    pub fn install(manager: &LaunchManager) -> Arc<Self> {
        let recorder = Arc::new(Self::default());
        manager.add_listener(Arc::clone(&recorder) as Arc<dyn LaunchListener>);
        recorder
    }

    pub fn events(&self) -> Vec<LaunchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&LaunchEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl LaunchListener for EventRecorder {
    fn on_event(&self, event: &LaunchEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Debugger session stand-in with a fixed id and reported key.
pub struct FakeDebugger {
    pub id: String,
    pub key: Option<String>,
}

impl FakeDebugger {
    pub fn for_agent(id: &str, agent: &Agent) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            key: Some(agent.key().as_str().to_owned()),
        })
    }
}

impl DebuggerSession for FakeDebugger {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn authorization_key(&self) -> Option<String> {
        self.key.clone()
    }
}

//! Dual-path readiness: handshake plus debugger attach, in either order.

use std::sync::Arc;
use std::time::Duration;

use agent_tether::agent::AgentState;
use agent_tether::{AppError, DebuggerSession, LaunchEvent};

use super::test_helpers::{
    start, test_config, wait_until, EventRecorder, FakeDebugger, FakeWorker, WAIT,
};

#[test]
fn ready_only_after_debugger_follows_handshake() {
    let (_rt, manager) = start(test_config());
    let events = EventRecorder::install(&manager);
    let agent = manager
        .open_for_project("debug-run", true)
        .expect("agent allocated");
    let worker = FakeWorker::bind();
    let _handshake = worker.handshake(&agent);

    assert!(wait_until(|| agent.callback_address().is_some()));
    assert_eq!(agent.state(), AgentState::AwaitingReadiness);
    assert!(!agent.wait_ready(Duration::from_millis(50)));
    assert!(matches!(
        agent.create_connection(),
        Err(AppError::IllegalState(_))
    ));
    assert_eq!(
        events.count(|e| matches!(e, LaunchEvent::HandshakeCompleted { .. })),
        1
    );

    let paired = manager
        .attach_debugger(FakeDebugger::for_agent("session-1", &agent))
        .expect("debugger attaches");

    assert!(Arc::ptr_eq(&paired, &agent));
    assert!(agent.wait_ready(WAIT));
    agent.create_connection().expect("connection opens");
    drop(worker.accept());
}

#[test]
fn debugger_before_handshake_reaches_same_state() {
    let (_rt, manager) = start(test_config());
    let agent = manager
        .open_for_project("debug-run", true)
        .expect("agent allocated");

    manager
        .attach_debugger(FakeDebugger::for_agent("session-1", &agent))
        .expect("debugger attaches");
    assert!(!agent.is_ready());

    let worker = FakeWorker::bind();
    let _handshake = worker.handshake(&agent);

    assert!(agent.wait_ready(WAIT));
    assert_eq!(agent.callback_address(), Some(worker.address()));
    assert_eq!(
        agent.debugger().map(|d| d.session_id().to_owned()),
        Some("session-1".to_owned())
    );
}

#[test]
fn debugger_is_optional_when_not_expected() {
    let (_rt, manager) = start(test_config());
    let agent = manager
        .open_for_project("run", false)
        .expect("agent allocated");
    let worker = FakeWorker::bind();
    let _handshake = worker.handshake(&agent);
    assert!(agent.wait_ready(WAIT));

    manager
        .attach_debugger(FakeDebugger::for_agent("late", &agent))
        .expect("attach still allowed");
    assert_eq!(agent.state(), AgentState::Ready);
}

#[test]
fn same_session_reattach_is_noop() {
    let (_rt, manager) = start(test_config());
    let agent = manager
        .open_for_project("debug-run", true)
        .expect("agent allocated");
    let session = FakeDebugger::for_agent("session-1", &agent);

    agent.attach_debugger(session.clone()).expect("first attach");
    agent
        .attach_debugger(session)
        .expect("second attach of the same session");
    agent
        .attach_debugger(FakeDebugger::for_agent("session-1", &agent))
        .expect("same id from another handle");
}

#[test]
fn different_session_is_rejected() {
    let (_rt, manager) = start(test_config());
    let agent = manager
        .open_for_project("debug-run", true)
        .expect("agent allocated");
    agent
        .attach_debugger(FakeDebugger::for_agent("session-1", &agent))
        .expect("first attach");

    let result = agent.attach_debugger(FakeDebugger::for_agent("session-2", &agent));

    assert!(matches!(result, Err(AppError::IllegalState(_))));
    assert_eq!(
        agent.debugger().map(|d| d.session_id().to_owned()),
        Some("session-1".to_owned())
    );
}

#[test]
fn session_without_key_is_protocol_error() {
    let (_rt, manager) = start(test_config());
    for key in [None, Some(String::new())] {
        let session: Arc<dyn DebuggerSession> = Arc::new(FakeDebugger {
            id: "anon".into(),
            key,
        });
        assert!(matches!(
            manager.attach_debugger(session),
            Err(AppError::ProtocolAuth(_))
        ));
    }
}

#[test]
fn session_with_unknown_key_is_not_found() {
    let (_rt, manager) = start(test_config());
    let session = Arc::new(FakeDebugger {
        id: "stray".into(),
        key: Some("0000".into()),
    });

    assert!(matches!(
        manager.attach_debugger(session),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn debugger_detach_tears_agent_down() {
    let (_rt, manager) = start(test_config());
    let events = EventRecorder::install(&manager);
    let agent = manager
        .open_for_project("debug-run", true)
        .expect("agent allocated");
    manager
        .attach_debugger(FakeDebugger::for_agent("session-1", &agent))
        .expect("debugger attaches");

    assert!(!manager.debugger_detached("someone-else"));
    assert!(manager.debugger_detached("session-1"));

    assert_eq!(agent.state(), AgentState::Destroyed);
    assert!(manager.agent(agent.key()).is_none());
    assert!(!manager.debugger_detached("session-1"));
    assert_eq!(
        events.count(|e| matches!(e, LaunchEvent::AgentDestroyed { .. })),
        1
    );
}

#[test]
fn destroyed_agent_refuses_debugger() {
    let (_rt, manager) = start(test_config());
    let agent = manager
        .open_for_project("debug-run", true)
        .expect("agent allocated");
    assert!(agent.destroy());
    assert!(!agent.destroy());

    let result = agent.attach_debugger(FakeDebugger::for_agent("session-1", &agent));

    assert!(matches!(result, Err(AppError::IllegalState(_))));
    assert!(manager.agent(agent.key()).is_none());
}

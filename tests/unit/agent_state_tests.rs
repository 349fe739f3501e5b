use agent_tether::agent::{AgentState, Readiness};

#[test]
fn handshake_alone_readies_plain_agent() {
    let mut readiness = Readiness::new(false);
    assert!(readiness.fire_handshake());
    assert_eq!(
        AgentState::AwaitingReadiness.advance(&readiness),
        AgentState::Ready
    );
}

#[test]
fn handshake_alone_does_not_ready_debug_agent() {
    let mut readiness = Readiness::new(true);
    readiness.fire_handshake();
    assert!(!readiness.is_satisfied());
    assert_eq!(
        AgentState::AwaitingReadiness.advance(&readiness),
        AgentState::AwaitingReadiness
    );
}

#[test]
fn events_commute() {
    let mut handshake_first = Readiness::new(true);
    handshake_first.fire_handshake();
    handshake_first.fire_debugger();

    let mut debugger_first = Readiness::new(true);
    debugger_first.fire_debugger();
    debugger_first.fire_handshake();

    assert_eq!(handshake_first, debugger_first);
    assert!(handshake_first.is_satisfied());
}

#[test]
fn events_fire_once() {
    let mut readiness = Readiness::new(true);
    assert!(readiness.fire_handshake());
    assert!(!readiness.fire_handshake());
    assert!(readiness.fire_debugger());
    assert!(!readiness.fire_debugger());
    assert!(readiness.handshake_fired() && readiness.debugger_fired());
}

#[test]
fn allocated_agent_can_become_ready_directly() {
    let mut readiness = Readiness::new(false);
    readiness.fire_handshake();
    assert_eq!(AgentState::Allocated.advance(&readiness), AgentState::Ready);
}

#[test]
fn ready_and_destroyed_are_stable() {
    let readiness = Readiness::new(false);
    assert_eq!(AgentState::Ready.advance(&readiness), AgentState::Ready);
    assert_eq!(
        AgentState::Destroyed.advance(&readiness),
        AgentState::Destroyed
    );
    assert!(!AgentState::Destroyed.is_live());
    assert!(AgentState::Ready.is_live());
}

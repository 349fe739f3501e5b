//! Handshake accept loop.
//!
//! One task serves every agent's handshake listener. Newly allocated
//! listeners arrive through an unbounded queue; each armed listener waits
//! for one connection at a time, reads the handshake under a deadline, and
//! routes the result to the agent that holds the presented key. A rejected
//! or timed-out handshake only costs that one socket: the listener is
//! re-armed until its agent completes the handshake or is destroyed.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::agent::Agent;
use crate::launch::handshake::{read_handshake_within, Handshake};
use crate::launch::key::AuthorizationKey;
use crate::launch::ManagerInner;
use crate::AppError;

/// Pause after a failed `accept` so a persistent error cannot spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound, non-blocking listener waiting to be armed by the loop.
pub(crate) struct PendingListener {
    pub(crate) agent: Weak<Agent>,
    pub(crate) listener: std::net::TcpListener,
}

struct Armed {
    key: AuthorizationKey,
    token: CancellationToken,
    listener: TcpListener,
}

enum AcceptOutcome {
    Handshake {
        stream: TcpStream,
        peer: SocketAddr,
        handshake: Handshake,
    },
    Rejected {
        peer: Option<SocketAddr>,
        error: AppError,
    },
    Closed,
}

pub(crate) async fn run_accept_loop(
    mut queue: mpsc::UnboundedReceiver<PendingListener>,
    manager: Weak<ManagerInner>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut armed = FuturesUnordered::new();
    info!("accept loop running");

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                info!(pending = armed.len(), "accept loop shutting down");
                break;
            }

            registration = queue.recv() => {
                let Some(pending) = registration else {
                    debug!("listener queue closed");
                    break;
                };
                if let Some(listener) = arm(pending) {
                    armed.push(accept_next(listener, handshake_timeout));
                }
            }

            Some((listener, outcome)) = armed.next(), if !armed.is_empty() => {
                route(&manager, &listener, outcome);
                if listener.token.is_cancelled() {
                    trace!(key = %listener.key, "handshake listener retired");
                } else {
                    armed.push(accept_next(listener, handshake_timeout));
                }
            }
        }
    }
}

fn arm(pending: PendingListener) -> Option<Armed> {
    let agent = pending.agent.upgrade()?;
    let token = agent.listener_token().clone();
    if token.is_cancelled() {
        return None;
    }

    match TcpListener::from_std(pending.listener) {
        Ok(listener) => {
            agent.mark_listening();
            debug!(key = %agent.key(), address = %agent.listen_address(), "handshake listener armed");
            Some(Armed {
                key: agent.key().clone(),
                token,
                listener,
            })
        }
        Err(err) => {
            // The agent stays Allocated; nothing else is affected.
            warn!(key = %agent.key(), %err, "failed to register handshake listener");
            None
        }
    }
}

async fn accept_next(armed: Armed, timeout: Duration) -> (Armed, AcceptOutcome) {
    let accepted = tokio::select! {
        () = armed.token.cancelled() => None,
        accepted = armed.listener.accept() => Some(accepted),
    };

    let outcome = match accepted {
        None => AcceptOutcome::Closed,
        Some(Err(err)) => {
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            AcceptOutcome::Rejected {
                peer: None,
                error: err.into(),
            }
        }
        Some(Ok((mut stream, peer))) => {
            let read = tokio::select! {
                () = armed.token.cancelled() => None,
                read = read_handshake_within(&mut stream, timeout) => Some(read),
            };
            match read {
                None => AcceptOutcome::Closed,
                Some(Ok(handshake)) => AcceptOutcome::Handshake {
                    stream,
                    peer,
                    handshake,
                },
                Some(Err(error)) => AcceptOutcome::Rejected {
                    peer: Some(peer),
                    error,
                },
            }
        }
    };
    (armed, outcome)
}

fn route(manager: &Weak<ManagerInner>, armed: &Armed, outcome: AcceptOutcome) {
    match outcome {
        AcceptOutcome::Closed => {}
        AcceptOutcome::Rejected { peer, error } => {
            warn!(listener = %armed.key, ?peer, %error, "handshake rejected");
        }
        AcceptOutcome::Handshake {
            stream,
            peer,
            handshake,
        } => {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let Some(agent) = manager.find(&handshake.key) else {
                warn!(listener = %armed.key, %peer, "handshake presented an unknown key; dropping socket");
                return;
            };

            let callback = SocketAddr::new(peer.ip(), handshake.port);
            let socket = if agent.context().config.reuse_handshake_socket {
                match stream.into_std() {
                    Ok(socket) => Some(socket),
                    Err(err) => {
                        warn!(key = %agent.key(), %err, "could not keep handshake socket");
                        None
                    }
                }
            } else {
                None
            };

            if let Err(err) = agent.accept_handshake(callback, socket) {
                warn!(key = %agent.key(), %peer, %err, "handshake not accepted");
            }
        }
    }
}

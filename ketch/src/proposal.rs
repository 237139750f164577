use crate::counters;
use ketch_types::{PersonIdent, RefUpdate, UpdateResult};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle of a proposal. `Executed` and `Aborted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalState {
    New,
    Queued,
    Running,
    Executed,
    Aborted,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Executed | ProposalState::Aborted)
    }
}

/// A batch of reference updates a client wants committed, plus its lifecycle.
///
/// Created by the push handler, handed to [`Leader::queue_proposal`] and then
/// driven by the leader: the caller observes progress through the `await_*`
/// methods or a terminal listener. Once terminal the proposal never changes
/// again.
///
/// [`Leader::queue_proposal`]: crate::leader::Leader::queue_proposal
pub struct Proposal {
    author: Option<PersonIdent>,
    message: Option<String>,
    push_certificate: Option<String>,
    inner: Mutex<Inner>,
    state_rx: watch::Receiver<ProposalState>,
}

struct Inner {
    state: ProposalState,
    commands: Vec<RefUpdate>,
    listeners: Vec<Box<dyn FnOnce() + Send>>,
    state_tx: watch::Sender<ProposalState>,
}

impl Proposal {
    pub fn new(commands: Vec<RefUpdate>) -> Self {
        let (state_tx, state_rx) = watch::channel(ProposalState::New);
        Proposal {
            author: None,
            message: None,
            push_certificate: None,
            inner: Mutex::new(Inner {
                state: ProposalState::New,
                commands,
                listeners: Vec::new(),
                state_tx,
            }),
            state_rx,
        }
    }

    pub fn with_author(mut self, author: PersonIdent) -> Self {
        self.author = Some(author);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_push_certificate(mut self, cert: impl Into<String>) -> Self {
        self.push_certificate = Some(cert.into());
        self
    }

    pub fn author(&self) -> Option<&PersonIdent> {
        self.author.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn push_certificate(&self) -> Option<&str> {
        self.push_certificate.as_deref()
    }

    pub fn state(&self) -> ProposalState {
        self.inner.lock().expect("proposal lock poisoned").state
    }

    /// Snapshot of the commands with their current results.
    pub fn commands(&self) -> Vec<RefUpdate> {
        self.inner
            .lock()
            .expect("proposal lock poisoned")
            .commands
            .clone()
    }

    /// Run `f` over the live command list.
    pub(crate) fn with_commands<R>(&self, f: impl FnOnce(&mut Vec<RefUpdate>) -> R) -> R {
        let mut inner = self.inner.lock().expect("proposal lock poisoned");
        f(&mut inner.commands)
    }

    /// Block until the proposal reaches a terminal state.
    pub async fn await_terminal(&self) {
        let mut rx = self.state_rx.clone();
        // The sender lives inside self, so wait_for cannot observe a closed
        // channel while we hold &self.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Like [`await_terminal`](Self::await_terminal) with a timeout; returns
    /// whether the proposal is terminal.
    pub async fn await_terminal_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.await_terminal())
            .await
            .is_ok()
    }

    /// Wait until the state differs from `state`; returns false on timeout.
    pub async fn await_state_change(&self, state: ProposalState, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| *s != state)).await;
        result.is_ok()
    }

    /// Register a callback to run exactly once when the proposal becomes
    /// terminal. If it already is, the callback runs synchronously on the
    /// caller.
    pub fn on_terminal(&self, cb: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut inner = self.inner.lock().expect("proposal lock poisoned");
            if inner.state.is_terminal() {
                true
            } else {
                inner.listeners.push(Box::new(cb));
                return;
            }
        };
        if run_now {
            cb();
        }
    }

    /// Advance the lifecycle. Terminal states are sticky; moving past one is
    /// a no-op. On `Executed`, unreported commands are promoted to `Ok`.
    pub(crate) fn transition(&self, to: ProposalState) {
        let listeners = {
            let mut inner = self.inner.lock().expect("proposal lock poisoned");
            if inner.state.is_terminal() {
                return;
            }
            inner.state = to;
            if to == ProposalState::Executed {
                for cmd in &mut inner.commands {
                    if cmd.result() == UpdateResult::NotAttempted {
                        cmd.set_result(UpdateResult::Ok);
                    }
                }
                counters::PROPOSALS_EXECUTED.inc();
            }
            inner.state_tx.send_replace(to);
            if to.is_terminal() {
                std::mem::take(&mut inner.listeners)
            } else {
                Vec::new()
            }
        };
        for cb in listeners {
            cb();
        }
    }

    /// Abort with a reason. Idempotent on terminal proposals. Every command
    /// still lacking a terminal result is marked `Aborted` with the reason.
    pub(crate) fn abort(&self, reason: &str) {
        let listeners = {
            let mut inner = self.inner.lock().expect("proposal lock poisoned");
            if inner.state.is_terminal() {
                return;
            }
            inner.state = ProposalState::Aborted;
            for cmd in &mut inner.commands {
                if !cmd.result().is_terminal() {
                    cmd.set_result_with_message(UpdateResult::Aborted, reason);
                }
            }
            counters::PROPOSALS_ABORTED.inc();
            inner.state_tx.send_replace(ProposalState::Aborted);
            std::mem::take(&mut inner.listeners)
        };
        for cb in listeners {
            cb();
        }
    }
}

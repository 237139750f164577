use crate::config::ReplicaConfig;
use crate::counters;
use crate::error::KetchError;
use crate::proposal::{Proposal, ProposalState};
use crate::ref_tree::RefTree;
use crate::replica::{
    classify, next_retry_delay, CommitMethod, CommitSpeed, Participation, RefAdvertisement,
    Replica, ReplicaSnapshot, ReplicaStatus, ReplicaTransport, TransportError,
};
use crate::round::{ElectionRound, ProposalRound, RoundError, RoundKind, StartedRound};
use crate::store::{read_commit, Repository};
use crate::system::KetchSystem;
use futures::future::{AbortHandle, Abortable};
use itertools::Itertools;
use ketch_types::{LogIndex, ObjectId, RefTarget, RefUpdate};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[cfg(test)]
#[path = "leader_test.rs"]
mod leader_test;

/// Lifecycle of a leader instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LeaderState {
    /// No election won yet; the first round will propose a new term.
    Candidate,
    /// Holds the current term and drives proposal rounds.
    Leader,
    /// A competing leader with a higher term took over; new work is refused
    /// and callers must rediscover the leader elsewhere.
    Deposed,
    Shutdown,
}

/// Atomic view of a leader and its replicas.
#[derive(Clone, Debug, Serialize)]
pub struct LeaderSnapshot {
    pub state: LeaderState,
    pub term: u64,
    pub head: LogIndex,
    pub committed: LogIndex,
    pub idle: bool,
    pub replicas: Vec<ReplicaSnapshot>,
}

/// Per-repository orchestrator of the replication protocol.
///
/// One mutex guards all mutable leader state together with the live state of
/// every owned replica. The lock is held only for bounded local work;
/// network pushes and round preparation run on executor tasks outside it.
pub struct Leader {
    system: Arc<KetchSystem>,
    repo: Repository,
    mutable: Mutex<LeaderMut>,
}

struct LeaderMut {
    state: LeaderState,
    term: u64,
    head: LogIndex,
    committed: LogIndex,
    /// In-memory reference tree: the tree at `head` plus every queued
    /// proposal. Rounds hold a clone of the `Arc` while serializing it;
    /// `Arc::make_mut` in `queue_proposal` then deep-copies before mutating.
    tree: Option<Arc<RefTree>>,
    queue: VecDeque<Arc<Proposal>>,
    running: Option<RunningRound>,
    idle: bool,
    /// Voters first, then followers.
    replicas: Vec<ReplicaRuntime>,
    voter_count: usize,
}

struct RunningRound {
    accepted_new: LogIndex,
    stage: Vec<RefUpdate>,
    kind: RoundKind,
}

struct ReplicaMeta {
    name: String,
    config: ReplicaConfig,
    transport: Arc<dyn ReplicaTransport>,
}

/// Live replica record; guarded by the owning leader's mutex.
struct ReplicaRuntime {
    meta: Arc<ReplicaMeta>,
    accepted: Option<ObjectId>,
    committed_id: Option<ObjectId>,
    known_refs: BTreeMap<String, ObjectId>,
    status: ReplicaStatus,
    error: Option<String>,
    retry_at: Option<Instant>,
    last_delay: Option<std::time::Duration>,
    in_flight: bool,
    pending: Option<PushSpec>,
    retry_abort: Option<AbortHandle>,
}

impl ReplicaRuntime {
    fn new(replica: Replica) -> Self {
        ReplicaRuntime {
            meta: Arc::new(ReplicaMeta {
                name: replica.name,
                config: replica.config,
                transport: replica.transport,
            }),
            accepted: None,
            committed_id: None,
            known_refs: BTreeMap::new(),
            status: ReplicaStatus::Unknown,
            error: None,
            retry_at: None,
            last_delay: None,
            in_flight: false,
            pending: None,
            retry_abort: None,
        }
    }
}

/// What a single push should carry to one replica.
#[derive(Clone, Default)]
struct PushSpec {
    accepted: Option<LogIndex>,
    committed: Option<LogIndex>,
    stage: Vec<RefUpdate>,
}

fn merge_pending(pending: &mut Option<PushSpec>, spec: PushSpec) {
    match pending {
        None => *pending = Some(spec),
        Some(p) => {
            if spec.accepted.is_some() {
                p.accepted = spec.accepted;
            }
            if spec.committed.is_some() {
                p.committed = spec.committed;
            }
            if !spec.stage.is_empty() {
                p.stage = spec.stage;
            }
        }
    }
}

fn should_push_unbatched_commit(config: &ReplicaConfig, leader_is_idle: bool) -> bool {
    match config.commit_speed {
        CommitSpeed::Fast => true,
        CommitSpeed::Batched => leader_is_idle,
    }
}

fn has_accepted(repo: &Repository, head: &LogIndex, peer_accepted: Option<ObjectId>) -> bool {
    match peer_accepted {
        None => false,
        Some(peer) => {
            peer == head.id || crate::store::is_ancestor(repo.objects.as_ref(), &head.id, &peer)
        }
    }
}

impl Leader {
    /// Build a leader over `repo` with the given replica set.
    ///
    /// The voter set must be odd, between 1 and 9, and contain the local
    /// replica; anything else is refused. Reconfiguration after construction
    /// is not supported.
    pub fn new(
        system: Arc<KetchSystem>,
        repo: Repository,
        replicas: Vec<Replica>,
    ) -> Result<Arc<Self>, KetchError> {
        let (voters, followers): (Vec<_>, Vec<_>) = replicas
            .into_iter()
            .partition(|r| r.config.participation == Participation::Full);
        let voter_count = voters.len();
        if voter_count == 0 || voter_count % 2 == 0 || voter_count > 9 {
            return Err(KetchError::InvalidConfig(format!(
                "voter count must be odd and between 1 and 9, got {voter_count}"
            )));
        }
        if !voters.iter().any(|r| r.local) {
            return Err(KetchError::InvalidConfig(
                "the local replica must be among the voters".to_string(),
            ));
        }
        for replica in voters.iter().chain(followers.iter()) {
            replica.config.validate()?;
        }

        let accepted_name = system.config().accepted_ref_name();
        let committed_name = system.config().committed_ref_name();
        let replicas = voters
            .into_iter()
            .chain(followers)
            .map(|replica| {
                let local = replica.local;
                let mut runtime = ReplicaRuntime::new(replica);
                // The local replica's state is its own reference database;
                // prime it so the first push carries the right old values.
                if local {
                    if let Ok(refs) = repo.refs.advertised() {
                        runtime.accepted = refs.get(&accepted_name).copied();
                        runtime.committed_id = refs.get(&committed_name).copied();
                        runtime.known_refs = refs;
                    }
                }
                runtime
            })
            .collect_vec();
        Ok(Arc::new(Leader {
            system,
            repo,
            mutable: Mutex::new(LeaderMut {
                state: LeaderState::Candidate,
                term: 0,
                head: LogIndex::unknown(ObjectId::zero()),
                committed: LogIndex::unknown(ObjectId::zero()),
                tree: None,
                queue: VecDeque::new(),
                running: None,
                idle: true,
                replicas,
                voter_count,
            }),
        }))
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Accept a proposal for replication, or abort it.
    ///
    /// Returns promptly. A conflict with the current reference state aborts
    /// the proposal without being an error; the caller observes the outcome
    /// through the proposal itself.
    pub fn queue_proposal(self: &Arc<Self>, proposal: &Arc<Proposal>) -> Result<(), KetchError> {
        enum Outcome {
            Queued,
            Conflict,
            Deposed,
            Shutdown,
        }

        let outcome = {
            let mut m = self.mutable.lock().expect("leader lock poisoned");
            if m.state == LeaderState::Shutdown {
                Outcome::Shutdown
            } else if m.state == LeaderState::Deposed {
                Outcome::Deposed
            } else {
                if m.tree.is_none() {
                    let (mut tree, head) = match self.load_initial_state() {
                        Ok(loaded) => loaded,
                        Err(err) => {
                            drop(m);
                            proposal.abort("failed to initialize the reference tree");
                            return Err(err);
                        }
                    };
                    // Replay anything already queued onto the fresh tree.
                    for queued in &m.queue {
                        let _ = queued.with_commands(|cmds| tree.apply(cmds));
                    }
                    m.head = head;
                    m.tree = Some(Arc::new(tree));
                }
                let tree = Arc::make_mut(m.tree.as_mut().expect("tree just initialized"));
                if proposal.with_commands(|cmds| tree.apply(cmds)) {
                    proposal.transition(ProposalState::Queued);
                    m.queue.push_back(proposal.clone());
                    counters::QUEUED_PROPOSALS.set(m.queue.len() as i64);
                    if m.idle {
                        m.idle = false;
                        self.spawn_worker();
                    }
                    Outcome::Queued
                } else {
                    Outcome::Conflict
                }
            }
        };

        match outcome {
            Outcome::Queued => Ok(()),
            Outcome::Conflict => {
                debug!("aborting proposal: conflicts with current reference state");
                proposal.abort("command conflicts with current reference state");
                Ok(())
            }
            Outcome::Deposed => {
                proposal.abort("leader deposed; discover the current leader elsewhere");
                Ok(())
            }
            Outcome::Shutdown => {
                proposal.abort("leader is shut down");
                Ok(())
            }
        }
    }

    /// Atomic observability snapshot.
    pub fn snapshot(&self) -> LeaderSnapshot {
        let m = self.mutable.lock().expect("leader lock poisoned");
        let now = Instant::now();
        LeaderSnapshot {
            state: m.state,
            term: m.term,
            head: m.head,
            committed: m.committed,
            idle: m.idle,
            replicas: m
                .replicas
                .iter()
                .map(|r| ReplicaSnapshot {
                    name: r.meta.name.clone(),
                    participation: r.meta.config.participation,
                    accepted: r.accepted,
                    committed: r.committed_id,
                    status: r.status,
                    error: r.error.clone(),
                    retry_in_ms: r
                        .retry_at
                        .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                })
                .collect_vec(),
        }
    }

    /// Stop scheduling rounds and cancel replica retries. Future
    /// `queue_proposal` calls abort their proposal; proposals already in
    /// flight are not drained.
    pub fn shutdown(&self) {
        let mut m = self.mutable.lock().expect("leader lock poisoned");
        if m.state == LeaderState::Shutdown {
            return;
        }
        info!("shutting down leader");
        m.state = LeaderState::Shutdown;
        for r in &mut m.replicas {
            if let Some(handle) = r.retry_abort.take() {
                handle.abort();
            }
            r.retry_at = None;
            r.pending = None;
        }
    }

    fn load_initial_state(&self) -> Result<(RefTree, LogIndex), KetchError> {
        let accepted_name = self.system.config().accepted_ref_name();
        match self.repo.refs.lookup(&accepted_name)? {
            Some(RefTarget::Id(id)) if !id.is_zero() => {
                let commit = read_commit(self.repo.objects.as_ref(), &id)?;
                let tree = RefTree::read_from(self.repo.objects.as_ref(), &commit.tree)?;
                Ok((tree, LogIndex::unknown(id)))
            }
            _ => Ok((RefTree::empty(), LogIndex::unknown(ObjectId::zero()))),
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let leader = self.clone();
        self.system.spawn(async move {
            Leader::run_worker(leader).await;
        });
    }

    /// The leader worker: picks the next round under the lock, prepares it
    /// outside the lock, then hands it to `run_async`.
    async fn run_worker(leader: Arc<Leader>) {
        enum Work {
            Election(ElectionRound),
            Proposals(ProposalRound),
            Abandon,
        }

        let work = {
            let mut m = leader.mutable.lock().expect("leader lock poisoned");
            match m.state {
                LeaderState::Candidate => Work::Election(ElectionRound::new(m.head)),
                LeaderState::Leader => {
                    if m.queue.is_empty() {
                        m.idle = true;
                        Work::Abandon
                    } else {
                        let todo = m.queue.drain(..).collect_vec();
                        counters::QUEUED_PROPOSALS.set(0);
                        let tree = m.tree.clone();
                        Work::Proposals(ProposalRound::new(m.head, m.term, todo, tree))
                    }
                }
                LeaderState::Deposed | LeaderState::Shutdown => Work::Abandon,
            }
        };

        match work {
            Work::Abandon => {}
            Work::Election(round) => {
                match round.start(&leader.system, &leader.repo).await {
                    Ok(started) => leader.run_async(started),
                    Err(err) => {
                        warn!("election round failed: {err}");
                        leader.next_round_after_failure();
                    }
                }
            }
            Work::Proposals(round) => {
                let proposals = round.proposals().to_vec();
                match round.start(&leader.system, &leader.repo).await {
                    Ok(started) => leader.run_async(started),
                    Err(RoundError::NoOp) => {
                        debug!(
                            "round is a no-op; {} proposal(s) succeed vacuously",
                            proposals.len()
                        );
                        for proposal in &proposals {
                            proposal.transition(ProposalState::Executed);
                        }
                        leader.next_round_after_failure();
                    }
                    Err(err) => {
                        warn!("proposal round failed: {err}");
                        for proposal in &proposals {
                            proposal.abort(&format!("round failed: {err}"));
                        }
                        leader.reset_tree_to_head();
                        leader.next_round_after_failure();
                    }
                }
            }
        }
    }

    /// Reschedule (or idle) after a round ended without replication.
    fn next_round_after_failure(self: &Arc<Self>) {
        let mut m = self.mutable.lock().expect("leader lock poisoned");
        m.running = None;
        if m.queue.is_empty() {
            m.idle = true;
        } else {
            self.spawn_worker();
        }
    }

    /// Rebuild the in-memory tree from `head` after a failed round left it
    /// carrying aborted updates, re-applying (or aborting) whatever queued
    /// up in the meantime.
    fn reset_tree_to_head(self: &Arc<Self>) {
        let mut aborted = Vec::new();
        {
            let mut m = self.mutable.lock().expect("leader lock poisoned");
            let mut tree = if m.head.id.is_zero() {
                RefTree::empty()
            } else {
                match read_commit(self.repo.objects.as_ref(), &m.head.id)
                    .and_then(|c| RefTree::read_from(self.repo.objects.as_ref(), &c.tree))
                {
                    Ok(tree) => tree,
                    Err(err) => {
                        warn!("failed to reload reference tree: {err}");
                        m.tree = None;
                        return;
                    }
                }
            };
            m.queue.retain(|p| {
                if p.with_commands(|cmds| tree.apply(cmds)) {
                    true
                } else {
                    aborted.push(p.clone());
                    false
                }
            });
            counters::QUEUED_PROPOSALS.set(m.queue.len() as i64);
            m.tree = Some(Arc::new(tree));
        }
        for proposal in aborted {
            proposal.abort("command conflicts with current reference state");
        }
    }

    /// Adopt the round's entry as the new head and offer it to every
    /// replica. Invoked by the worker once the round's commit is flushed.
    fn run_async(self: &Arc<Self>, started: StartedRound) {
        let mut m = self.mutable.lock().expect("leader lock poisoned");
        if matches!(m.state, LeaderState::Shutdown | LeaderState::Deposed) {
            drop(m);
            if let RoundKind::Proposals { proposals } = started.kind {
                for proposal in proposals {
                    proposal.abort("leader is shut down");
                }
            }
            return;
        }

        // The head advances speculatively; at least one replica is expected
        // to accept it.
        m.head = started.accepted_new;
        m.running = Some(RunningRound {
            accepted_new: started.accepted_new,
            stage: started.stage.clone(),
            kind: started.kind,
        });

        let committed = m.committed;
        for idx in 0..m.replicas.len() {
            let mut spec = PushSpec {
                accepted: Some(started.accepted_new),
                committed: None,
                stage: started.stage.clone(),
            };
            let r = &m.replicas[idx];
            if r.meta.config.commit_speed == CommitSpeed::Batched
                && committed.index > 0
                && r.committed_id != Some(committed.id)
            {
                spec.committed = Some(committed);
            }
            self.queue_push(&mut m, idx, spec);
        }
    }

    /// Schedule a push, coalescing with any push already in flight.
    fn queue_push(self: &Arc<Self>, m: &mut LeaderMut, idx: usize, spec: PushSpec) {
        if m.state == LeaderState::Shutdown {
            return;
        }
        {
            let r = &mut m.replicas[idx];
            if r.in_flight {
                merge_pending(&mut r.pending, spec);
                return;
            }
            if let Some(handle) = r.retry_abort.take() {
                handle.abort();
                r.retry_at = None;
            }
        }
        let commands = self.build_commands(&m.replicas[idx], &spec);
        if commands.is_empty() {
            return;
        }
        let r = &mut m.replicas[idx];
        r.in_flight = true;
        let transport = r.meta.transport.clone();
        let leader = self.clone();
        self.system.spawn(async move {
            let mut commands = commands;
            let outcome = transport.push(&mut commands).await;
            leader.finish_push(idx, outcome);
        });
    }

    /// Translate a push spec into concrete commands for one replica, using
    /// its last-known positions as expected old values.
    fn build_commands(&self, r: &ReplicaRuntime, spec: &PushSpec) -> Vec<RefUpdate> {
        let config = self.system.config();
        let mut commands = Vec::new();
        if let Some(committed) = spec.committed {
            if r.meta.config.commit_method == CommitMethod::AllRefs {
                match self.all_refs_delta(r, &committed.id) {
                    Ok(delta) => commands.extend(delta),
                    Err(err) => warn!(
                        "skipping ref expansion for replica {}: {err}",
                        r.meta.name
                    ),
                }
            }
        }
        commands.extend(spec.stage.iter().cloned());
        if let Some(accepted) = spec.accepted {
            if r.accepted != Some(accepted.id) {
                commands.push(RefUpdate::update(
                    config.accepted_ref_name(),
                    r.accepted.unwrap_or_else(ObjectId::zero),
                    accepted.id,
                ));
            }
        }
        if let Some(committed) = spec.committed {
            if r.committed_id != Some(committed.id) {
                commands.push(RefUpdate::update(
                    config.committed_ref_name(),
                    r.committed_id.unwrap_or_else(ObjectId::zero),
                    committed.id,
                ));
            }
        }
        commands
    }

    /// Commands updating each ordinary reference to the committed tree, for
    /// replicas publishing with `AllRefs`.
    fn all_refs_delta(
        &self,
        r: &ReplicaRuntime,
        committed: &ObjectId,
    ) -> Result<Vec<RefUpdate>, KetchError> {
        let config = self.system.config();
        let commit = read_commit(self.repo.objects.as_ref(), committed)?;
        let tree = RefTree::read_from(self.repo.objects.as_ref(), &commit.tree)?;
        let mut commands = Vec::new();
        for (name, target) in tree.iter() {
            if config.in_txn_namespace(name) {
                continue;
            }
            let RefTarget::Id(new_id) = target else { continue };
            let old = r.known_refs.get(name).copied().unwrap_or_else(ObjectId::zero);
            if old != *new_id {
                commands.push(RefUpdate::update(name.clone(), old, *new_id));
            }
        }
        for (name, old) in &r.known_refs {
            if config.in_txn_namespace(name) || tree.get(name).is_some() {
                continue;
            }
            commands.push(RefUpdate::delete(name.clone(), *old));
        }
        Ok(commands)
    }

    /// Record a completed push, reclassify the replica and, when the push
    /// succeeded, tally the vote.
    fn finish_push(self: &Arc<Self>, idx: usize, outcome: Result<RefAdvertisement, TransportError>) {
        let mut executed = Vec::new();
        {
            let mut m = self.mutable.lock().expect("leader lock poisoned");
            if m.state == LeaderState::Shutdown {
                m.replicas[idx].in_flight = false;
                return;
            }
            let head = m.head;
            let accepted_name = self.system.config().accepted_ref_name();
            let committed_name = self.system.config().committed_ref_name();
            {
                let r = &mut m.replicas[idx];
                r.in_flight = false;
                match &outcome {
                    Ok(advert) => {
                        r.known_refs = advert.refs.clone();
                        r.accepted = advert.get(&accepted_name);
                        r.committed_id = advert.get(&committed_name);
                        r.status = classify(self.repo.objects.as_ref(), head, r.accepted);
                        r.error = None;
                        r.last_delay = None;
                        r.retry_at = None;
                        counters::REPLICA_PUSHES.with_label_values(&["ok"]).inc();
                    }
                    Err(TransportError::LockFailure { advertised }) => {
                        r.known_refs = advertised.refs.clone();
                        r.accepted = advertised.get(&accepted_name);
                        r.committed_id = advertised.get(&committed_name);
                        r.status = classify(self.repo.objects.as_ref(), head, r.accepted);
                        warn!(
                            "replica {} rejected push, now {:?}",
                            r.meta.name, r.status
                        );
                        counters::REPLICA_PUSHES.with_label_values(&["failed"]).inc();
                    }
                    Err(TransportError::Unreachable(msg)) => {
                        r.status = ReplicaStatus::Offline;
                        r.error = Some(msg.clone());
                        warn!("replica {} unreachable: {msg}", r.meta.name);
                        counters::REPLICA_PUSHES.with_label_values(&["failed"]).inc();
                    }
                }
            }
            match outcome {
                Ok(_) => {
                    if let Some(pending) = m.replicas[idx].pending.take() {
                        self.queue_push(&mut m, idx, pending);
                    }
                    self.on_replica_update(&mut m, idx, &mut executed);
                    self.catch_up_committed(&mut m, idx);
                }
                Err(_) => self.schedule_retry(&mut m, idx),
            }
        }
        // External notification runs outside the lock.
        for proposal in executed {
            proposal.transition(ProposalState::Executed);
        }
    }

    /// Vote tally after a replica reported progress. Promotes a winning
    /// candidate and commits the running round once a majority of voters
    /// holds `head`.
    fn on_replica_update(
        self: &Arc<Self>,
        m: &mut LeaderMut,
        caller_idx: usize,
        executed: &mut Vec<Arc<Proposal>>,
    ) {
        if caller_idx >= m.voter_count {
            // Followers mirror but do not vote.
            return;
        }
        let election_term = match &m.running {
            // Stale callback from an earlier round.
            None => return,
            Some(running) => match &running.kind {
                RoundKind::Election { new_term } => Some(*new_term),
                RoundKind::Proposals { .. } => None,
            },
        };

        let head = m.head;
        let votes = m.replicas[..m.voter_count]
            .iter()
            .filter(|r| has_accepted(&self.repo, &head, r.accepted))
            .count();
        if votes < m.voter_count / 2 + 1 {
            return;
        }

        match m.state {
            LeaderState::Candidate => {
                if let Some(new_term) = election_term {
                    m.term = new_term;
                    counters::LEADER_TERM.set(new_term as i64);
                }
                m.state = LeaderState::Leader;
                info!("won election for term {} at {}", m.term, head);
                self.commit_round(m, caller_idx, executed);
            }
            LeaderState::Leader => self.commit_round(m, caller_idx, executed),
            other => {
                warn!("ignoring quorum in state {other:?}");
            }
        }
    }

    /// A majority holds `head`: advance committed, line up the next round
    /// and publish the committed position.
    fn commit_round(
        self: &Arc<Self>,
        m: &mut LeaderMut,
        caller_idx: usize,
        executed: &mut Vec<Arc<Proposal>>,
    ) {
        m.committed = m.head;
        debug!("committed {}", m.committed);
        let running = m.running.take().expect("running round present");

        // Next round must go through a fresh executor task, never a direct
        // call under this lock.
        if m.queue.is_empty() {
            m.idle = true;
        } else {
            self.spawn_worker();
        }

        let committed = m.committed;
        for idx in 0..m.replicas.len() {
            if idx == caller_idx {
                // The caller learned the commit from its own push.
                continue;
            }
            let r = &m.replicas[idx];
            if r.committed_id == Some(committed.id) {
                continue;
            }
            if !should_push_unbatched_commit(&r.meta.config, m.idle) {
                continue;
            }
            self.queue_push(
                m,
                idx,
                PushSpec {
                    accepted: None,
                    committed: Some(committed),
                    stage: vec![],
                },
            );
        }

        if let RoundKind::Proposals { proposals } = running.kind {
            executed.extend(proposals);
        }
    }

    /// Let the replica whose callback committed the round pick up the
    /// committed pointer it does not carry yet.
    fn catch_up_committed(self: &Arc<Self>, m: &mut LeaderMut, idx: usize) {
        if m.committed.index == 0 {
            return;
        }
        let r = &m.replicas[idx];
        if r.committed_id == Some(m.committed.id) {
            return;
        }
        if !should_push_unbatched_commit(&r.meta.config, m.idle) {
            return;
        }
        let committed = m.committed;
        self.queue_push(
            m,
            idx,
            PushSpec {
                accepted: None,
                committed: Some(committed),
                stage: vec![],
            },
        );
    }

    fn schedule_retry(self: &Arc<Self>, m: &mut LeaderMut, idx: usize) {
        let r = &mut m.replicas[idx];
        let delay = next_retry_delay(r.meta.config.min_retry, r.meta.config.max_retry, r.last_delay);
        r.last_delay = Some(delay);
        r.retry_at = Some(Instant::now() + delay);
        let (handle, registration) = AbortHandle::new_pair();
        r.retry_abort = Some(handle);
        let leader = self.clone();
        self.system.spawn(async move {
            if Abortable::new(tokio::time::sleep(delay), registration)
                .await
                .is_ok()
            {
                leader.retry_push(idx);
            }
        });
    }

    /// Re-issue a failed push with whatever the leader currently wants the
    /// replica to hold.
    fn retry_push(self: &Arc<Self>, idx: usize) {
        let mut m = self.mutable.lock().expect("leader lock poisoned");
        if m.state == LeaderState::Shutdown {
            return;
        }
        {
            let r = &mut m.replicas[idx];
            r.retry_abort = None;
            r.retry_at = None;
        }
        let mut spec = m.replicas[idx].pending.take().unwrap_or_default();
        if spec.accepted.is_none() && m.head.index > 0 {
            spec.accepted = Some(m.head);
        }
        if spec.stage.is_empty() {
            if let Some(running) = &m.running {
                spec.stage = running.stage.clone();
            }
        }
        let r = &m.replicas[idx];
        if spec.committed.is_none()
            && m.committed.index > 0
            && r.committed_id != Some(m.committed.id)
            && should_push_unbatched_commit(&r.meta.config, m.idle)
        {
            spec.committed = Some(m.committed);
        }
        if spec.accepted.is_none() && spec.committed.is_none() && spec.stage.is_empty() {
            return;
        }
        self.queue_push(&mut m, idx, spec);
    }
}

use super::stage::build_stage_commands;
use super::{RoundError, RoundKind, StartedRound};
use crate::counters;
use crate::proposal::{Proposal, ProposalState};
use crate::ref_tree::RefTree;
use crate::store::{insert_commit, read_commit, Repository};
use crate::system::KetchSystem;
use ketch_types::commit::TERM_FOOTER;
use ketch_types::{CommitData, LogIndex, ObjectId, PersonIdent, RefTarget};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Round advancing the log by one entry built from queued proposals.
pub(crate) struct ProposalRound {
    accepted_old: LogIndex,
    term: u64,
    todo: Vec<Arc<Proposal>>,
    /// Pre-applied tree snapshot handed over by the leader; enables the
    /// single-combined-commit fast path.
    tree: Option<Arc<RefTree>>,
}

impl ProposalRound {
    pub(crate) fn new(
        accepted_old: LogIndex,
        term: u64,
        todo: Vec<Arc<Proposal>>,
        tree: Option<Arc<RefTree>>,
    ) -> Self {
        ProposalRound {
            accepted_old,
            term,
            todo,
            tree,
        }
    }

    pub(crate) fn proposals(&self) -> &[Arc<Proposal>] {
        &self.todo
    }

    pub(crate) async fn start(
        self,
        system: &KetchSystem,
        repo: &Repository,
    ) -> Result<StartedRound, RoundError> {
        counters::ROUNDS_STARTED.with_label_values(&["proposal"]).inc();
        for proposal in &self.todo {
            proposal.transition(ProposalState::Running);
        }
        let ts = system.time().propose();
        let objects = repo.objects.as_ref();

        let old_tree_id = if self.accepted_old.id.is_zero() {
            RefTree::empty().tree_id()
        } else {
            read_commit(objects, &self.accepted_old.id)?.tree
        };

        let head_id = match (&self.tree, can_combine(&self.todo)) {
            (Some(tree), true) => {
                // Fast path: one commit carrying every proposal.
                let tree_id = tree.write_tree(objects)?;
                if tree_id == old_tree_id {
                    return Err(RoundError::NoOp);
                }
                let first = &self.todo[0];
                let commit = CommitData {
                    tree: tree_id,
                    parents: parents_of(self.accepted_old.id),
                    author: author_of(first, system, ts.millis()),
                    committer: system.committer(ts),
                    message: proposal_message(first.message(), self.term),
                };
                insert_commit(objects, &commit)?
            }
            _ => {
                // General path: replay each proposal in queue order onto the
                // tree at the previous accepted position, one commit per
                // tree-changing step.
                let mut tree = if self.accepted_old.id.is_zero() {
                    RefTree::empty()
                } else {
                    RefTree::read_from(objects, &old_tree_id)?
                };
                let mut last_tree_id = old_tree_id;
                let mut head = self.accepted_old.id;
                for proposal in &self.todo {
                    let applied = proposal.with_commands(|cmds| tree.apply(cmds));
                    if !applied {
                        // Validated at queue time; failing here means the
                        // queue and tree fell out of sync.
                        return Err(RoundError::Internal(
                            "queued proposal no longer applies".to_string(),
                        ));
                    }
                    let tree_id = tree.tree_id();
                    if tree_id == last_tree_id {
                        continue;
                    }
                    tree.write_tree(objects)?;
                    let commit = CommitData {
                        tree: tree_id,
                        parents: parents_of(head),
                        author: author_of(proposal, system, ts.millis()),
                        committer: system.committer(ts),
                        message: proposal_message(proposal.message(), self.term),
                    };
                    head = insert_commit(objects, &commit)?;
                    last_tree_id = tree_id;
                }
                if head == self.accepted_old.id {
                    return Err(RoundError::NoOp);
                }
                head
            }
        };

        let accepted_new = self.accepted_old.next(head_id);
        let stage = build_stage_commands(
            objects,
            system.config(),
            &system.committer(ts),
            accepted_new.id,
            new_object_ids(&self.todo),
        )?;
        repo.objects.flush()?;

        system
            .time()
            .sleep_until_past(ts, system.config().max_wait_for_monotonic_clock)
            .await
            .map_err(|_| RoundError::TimeUncertain)?;

        Ok(StartedRound {
            accepted_old: self.accepted_old,
            accepted_new,
            stage,
            kind: RoundKind::Proposals {
                proposals: self.todo,
            },
        })
    }
}

fn parents_of(id: ObjectId) -> Vec<ObjectId> {
    if id.is_zero() {
        vec![]
    } else {
        vec![id]
    }
}

fn author_of(proposal: &Proposal, system: &KetchSystem, when_ms: u64) -> PersonIdent {
    match proposal.author() {
        Some(author) => PersonIdent::new(author.name.clone(), author.email.clone(), when_ms),
        None => PersonIdent::new(
            system.config().committer_name.clone(),
            system.config().committer_email.clone(),
            when_ms,
        ),
    }
}

/// Proposals combine into one commit only when they agree on message and
/// author identity (absent values count as the empty message and the system
/// identity respectively).
fn can_combine(todo: &[Arc<Proposal>]) -> bool {
    let key = |p: &Arc<Proposal>| {
        (
            p.message().unwrap_or("").to_string(),
            p.author().map(|a| (a.name.clone(), a.email.clone())),
        )
    };
    let first = key(&todo[0]);
    todo.iter().skip(1).all(|p| key(p) == first)
}

fn proposal_message(message: Option<&str>, term: u64) -> String {
    let mut out = String::new();
    if let Some(message) = message {
        let message = message.trim_end();
        if !message.is_empty() {
            out.push_str(message);
            out.push_str("\n\n");
        }
    }
    out.push_str(TERM_FOOTER);
    out.push_str(&term.to_string());
    out.push('\n');
    out
}

/// Latest non-symbolic target per reference across the batch, deduplicated.
fn new_object_ids(todo: &[Arc<Proposal>]) -> Vec<ObjectId> {
    let mut latest: BTreeMap<String, ObjectId> = BTreeMap::new();
    for proposal in todo {
        for cmd in proposal.commands() {
            match &cmd.new {
                RefTarget::Id(id) if !id.is_zero() => {
                    latest.insert(cmd.name.clone(), *id);
                }
                _ => {}
            }
        }
    }
    let mut ids: Vec<ObjectId> = latest.into_values().collect();
    ids.sort();
    ids.dedup();
    ids
}

use super::{RoundError, RoundKind, StartedRound};
use crate::counters;
use crate::ref_tree::RefTree;
use crate::store::{insert_commit, read_commit, Repository};
use crate::system::KetchSystem;
use ketch_types::commit::TERM_FOOTER;
use ketch_types::{CommitData, LogIndex};
use log::info;

/// Round that bumps the term so this leader can start accepting proposals.
///
/// The election commit inherits the previous accepted tree (or starts empty
/// on a brand-new repository) and records the new term in its message
/// footer, plus a random tag so two candidates racing within one clock
/// second cannot mint byte-identical commits.
pub(crate) struct ElectionRound {
    accepted_old: LogIndex,
}

impl ElectionRound {
    pub(crate) fn new(accepted_old: LogIndex) -> Self {
        ElectionRound { accepted_old }
    }

    pub(crate) async fn start(
        self,
        system: &KetchSystem,
        repo: &Repository,
    ) -> Result<StartedRound, RoundError> {
        counters::ROUNDS_STARTED.with_label_values(&["election"]).inc();
        let ts = system.time().propose();

        let (new_term, tree, parents) = if self.accepted_old.id.is_zero() {
            let tree = RefTree::empty().write_tree(repo.objects.as_ref())?;
            (1, tree, vec![])
        } else {
            let prior = read_commit(repo.objects.as_ref(), &self.accepted_old.id)?;
            if system.config().require_monotonic_leader_elections
                && ts.millis() < prior.committer.when_ms
            {
                return Err(RoundError::TimeUncertain);
            }
            (prior.term()? + 1, prior.tree, vec![self.accepted_old.id])
        };

        let tag: u32 = rand::random();
        let ident = system.committer(ts);
        let commit = CommitData {
            tree,
            parents,
            author: ident.clone(),
            committer: ident,
            message: format!("{TERM_FOOTER}{new_term} {tag:08x}\n"),
        };
        let id = insert_commit(repo.objects.as_ref(), &commit)?;
        repo.objects.flush()?;

        system
            .time()
            .sleep_until_past(ts, system.config().max_wait_for_monotonic_clock)
            .await
            .map_err(|_| RoundError::TimeUncertain)?;

        info!("proposing term {} in {}", new_term, id.short());
        Ok(StartedRound {
            accepted_old: self.accepted_old,
            accepted_new: self.accepted_old.next(id),
            stage: vec![],
            kind: RoundKind::Election { new_term },
        })
    }
}

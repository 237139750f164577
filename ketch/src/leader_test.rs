use super::{Leader, LeaderState};
use crate::config::{KetchConfig, ReplicaConfig};
use crate::proposal::{Proposal, ProposalState};
use crate::ref_tree::RefTree;
use crate::replica::{
    CommitMethod, CommitSpeed, LocalTransport, Participation, Replica, ReplicaStatus,
};
use crate::store::{insert_commit, read_commit, MemObjectStore, MemRefStore, Repository};
use crate::system::KetchSystem;
use crate::test_utils::{
    init_logger, ref_id, seed_commit, test_system, wait_until, FailingTransport, GatedTime,
};
use ketch_types::{CommitData, ObjectId, PersonIdent, RefTarget, RefUpdate, UpdateResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

const WAIT: Duration = Duration::from_secs(10);

fn local_voter(repo: &Repository, system: &KetchSystem) -> Replica {
    Replica::local("local", ReplicaConfig::default(), repo, system.config())
}

fn remote_replica(
    name: &str,
    config: ReplicaConfig,
    system: &KetchSystem,
) -> (Replica, Repository) {
    let peer = Repository::in_memory();
    let transport = Arc::new(LocalTransport::new(
        peer.clone(),
        system.config().accepted_ref_name(),
        system.config().committed_ref_name(),
    ));
    (Replica::remote(name, config, transport), peer)
}

fn create_main(repo: &Repository, n: u8) -> (Arc<Proposal>, ObjectId) {
    let target = seed_commit(repo, n);
    let proposal = Arc::new(Proposal::new(vec![RefUpdate::create(
        "refs/heads/main",
        target,
    )]));
    (proposal, target)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_voter_push_commits() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    let (proposal, target) = create_main(&repo, 1);
    assert_eq!(proposal.state(), ProposalState::New);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);
    assert_eq!(proposal.state(), ProposalState::Executed);
    assert!(proposal
        .commands()
        .iter()
        .all(|c| c.result() == UpdateResult::Ok));

    let snapshot = leader.snapshot();
    assert_eq!(snapshot.state, LeaderState::Leader);
    assert_eq!(snapshot.term, 1);
    // Election entry then the proposal entry.
    assert_eq!(snapshot.head.index, 2);
    assert_eq!(snapshot.committed.id, snapshot.head.id);

    // The committed tree carries the new branch.
    let head = read_commit(repo.objects.as_ref(), &snapshot.head.id).unwrap();
    let tree = RefTree::read_from(repo.objects.as_ref(), &head.tree).unwrap();
    assert_eq!(tree.get("refs/heads/main"), Some(&RefTarget::Id(target)));

    // Both transactional refs converge on head locally.
    let head_id = snapshot.head.id;
    assert_eq!(ref_id(&repo, "refs/txn/accepted"), Some(head_id));
    wait_until("local committed ref", || {
        ref_id(&repo, "refs/txn/committed") == Some(head_id)
    })
    .await;
    wait_until("leader goes idle", || leader.snapshot().idle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_survives_offline_replica() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let (good, good_peer) = remote_replica("r1", ReplicaConfig::default(), &system);
    let offline = Replica::remote("r2", ReplicaConfig::default(), Arc::new(FailingTransport));
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system), good, offline],
    )
    .unwrap();

    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);
    assert_eq!(proposal.state(), ProposalState::Executed);

    let snapshot = leader.snapshot();
    assert_eq!(snapshot.state, LeaderState::Leader);
    wait_until("r2 offline with a scheduled retry", || {
        leader.snapshot().replicas.iter().any(|r| {
            r.name == "r2"
                && r.status == ReplicaStatus::Offline
                && r.error.as_deref() == Some("connection refused")
                && r.retry_in_ms.is_some()
        })
    })
    .await;

    // The healthy peer holds the accepted entry.
    wait_until("peer accepted", || {
        ref_id(&good_peer, "refs/txn/accepted") == Some(snapshot.head.id)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_proposal_aborts_at_queue() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    let (first, _) = create_main(&repo, 1);
    leader.queue_proposal(&first).unwrap();
    assert!(first.await_terminal_timeout(WAIT).await);
    wait_until("leader goes idle", || leader.snapshot().idle).await;
    let head_before = leader.snapshot().head;

    // Expected-old C2 does not match the tree's C1.
    let wrong_old = seed_commit(&repo, 2);
    let new_target = seed_commit(&repo, 3);
    let conflict = Arc::new(Proposal::new(vec![RefUpdate::update(
        "refs/heads/main",
        wrong_old,
        new_target,
    )]));
    leader.queue_proposal(&conflict).unwrap();

    // Straight to aborted, no round scheduled.
    assert_eq!(conflict.state(), ProposalState::Aborted);
    let cmd = &conflict.commands()[0];
    assert_eq!(cmd.result(), UpdateResult::Aborted);
    assert!(cmd.message().unwrap().contains("conflict"));

    let snapshot = leader.snapshot();
    assert!(snapshot.idle);
    assert_eq!(snapshot.head.index, head_before.index);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_start_elects_before_first_proposal() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();
    assert_eq!(leader.snapshot().state, LeaderState::Candidate);

    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);

    let snapshot = leader.snapshot();
    assert_eq!(snapshot.state, LeaderState::Leader);
    assert_eq!(snapshot.term, 1);

    // The proposal entry is parented on the term-1 election entry, which has
    // no parent and an empty tree.
    let head = read_commit(repo.objects.as_ref(), &snapshot.head.id).unwrap();
    let election = read_commit(repo.objects.as_ref(), &head.parents[0]).unwrap();
    assert_eq!(election.term().unwrap(), 1);
    assert!(election.parents.is_empty());
    assert_eq!(election.tree, RefTree::empty().tree_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_proposals_combine_into_one_commit() {
    init_logger();
    let repo = Repository::in_memory();
    let (time, gate) = GatedTime::new();
    let system =
        KetchSystem::with_time_source(KetchConfig::default(), Handle::current(), time).unwrap();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    // Queue both while the election round is still gated on the clock.
    let t1 = seed_commit(&repo, 1);
    let t2 = seed_commit(&repo, 2);
    let p1 = Arc::new(
        Proposal::new(vec![RefUpdate::create("refs/heads/main", t1)]).with_message("merge topic"),
    );
    let p2 = Arc::new(
        Proposal::new(vec![RefUpdate::create("refs/heads/dev", t2)]).with_message("merge topic"),
    );
    leader.queue_proposal(&p1).unwrap();
    leader.queue_proposal(&p2).unwrap();
    gate.send(true).unwrap();

    assert!(p1.await_terminal_timeout(WAIT).await);
    assert!(p2.await_terminal_timeout(WAIT).await);
    assert_eq!(p1.state(), ProposalState::Executed);
    assert_eq!(p2.state(), ProposalState::Executed);

    // One combined commit carrying both updates, directly on the election.
    let snapshot = leader.snapshot();
    let head = read_commit(repo.objects.as_ref(), &snapshot.head.id).unwrap();
    assert_eq!(head.message, "merge topic\n\nTerm: 1\n");
    let tree = RefTree::read_from(repo.objects.as_ref(), &head.tree).unwrap();
    assert_eq!(tree.get("refs/heads/main"), Some(&RefTarget::Id(t1)));
    assert_eq!(tree.get("refs/heads/dev"), Some(&RefTarget::Id(t2)));
    let parent = read_commit(repo.objects.as_ref(), &head.parents[0]).unwrap();
    assert_eq!(parent.term().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_messages_chain_in_queue_order() {
    init_logger();
    let repo = Repository::in_memory();
    let (time, gate) = GatedTime::new();
    let system =
        KetchSystem::with_time_source(KetchConfig::default(), Handle::current(), time).unwrap();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    let t1 = seed_commit(&repo, 1);
    let t2 = seed_commit(&repo, 2);
    let p1 = Arc::new(
        Proposal::new(vec![RefUpdate::create("refs/heads/main", t1)]).with_message("first"),
    );
    let p2 = Arc::new(
        Proposal::new(vec![RefUpdate::create("refs/heads/dev", t2)]).with_message("second"),
    );
    leader.queue_proposal(&p1).unwrap();
    leader.queue_proposal(&p2).unwrap();
    gate.send(true).unwrap();

    assert!(p1.await_terminal_timeout(WAIT).await);
    assert!(p2.await_terminal_timeout(WAIT).await);

    // Two chained commits in one round: p1's entry is p2's ancestor.
    let snapshot = leader.snapshot();
    let second = read_commit(repo.objects.as_ref(), &snapshot.head.id).unwrap();
    assert_eq!(second.message, "second\n\nTerm: 1\n");
    let first = read_commit(repo.objects.as_ref(), &second.parents[0]).unwrap();
    assert_eq!(first.message, "first\n\nTerm: 1\n");
    let election = read_commit(repo.objects.as_ref(), &first.parents[0]).unwrap();
    assert_eq!(election.term().unwrap(), 1);
    // One round advanced the log by a single position.
    assert_eq!(snapshot.head.index, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_replica_excluded_from_quorum() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let (good, _good_peer) = remote_replica("r1", ReplicaConfig::default(), &system);

    // r2's accepted pointer names history the leader has never seen.
    let peer_refs = Arc::new(MemRefStore::new());
    let peer_repo = Repository {
        objects: Arc::new(MemObjectStore::new()),
        refs: peer_refs.clone(),
    };
    let foreign = seed_commit(&peer_repo, 9);
    peer_refs.set("refs/txn/accepted", RefTarget::Id(foreign));
    let divergent = Replica::remote(
        "r2",
        ReplicaConfig::default(),
        Arc::new(LocalTransport::new(
            peer_repo,
            system.config().accepted_ref_name(),
            system.config().committed_ref_name(),
        )),
    );

    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system), good, divergent],
    )
    .unwrap();

    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);
    assert_eq!(proposal.state(), ProposalState::Executed);

    wait_until("r2 classified divergent", || {
        leader
            .snapshot()
            .replicas
            .iter()
            .any(|r| r.name == "r2" && r.status == ReplicaStatus::Divergent)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_cannot_commit() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let r1 = Replica::remote("r1", ReplicaConfig::default(), Arc::new(FailingTransport));
    let r2 = Replica::remote("r2", ReplicaConfig::default(), Arc::new(FailingTransport));
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system), r1, r2],
    )
    .unwrap();

    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(
        !proposal
            .await_terminal_timeout(Duration::from_millis(500))
            .await
    );

    let snapshot = leader.snapshot();
    assert_eq!(snapshot.state, LeaderState::Candidate);
    assert_eq!(snapshot.committed.index, 0);
    assert_eq!(proposal.state(), ProposalState::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_op_round_succeeds_vacuously() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    let (first, target) = create_main(&repo, 1);
    leader.queue_proposal(&first).unwrap();
    assert!(first.await_terminal_timeout(WAIT).await);
    wait_until("leader goes idle", || leader.snapshot().idle).await;
    let head_before = leader.snapshot().head;

    // Updating main to its current value changes nothing.
    let noop = Arc::new(Proposal::new(vec![RefUpdate::update(
        "refs/heads/main",
        target,
        target,
    )]));
    leader.queue_proposal(&noop).unwrap();
    assert!(noop.await_terminal_timeout(WAIT).await);
    assert_eq!(noop.state(), ProposalState::Executed);
    assert_eq!(noop.commands()[0].result(), UpdateResult::Ok);

    // No entry was written.
    let snapshot = leader.snapshot();
    assert_eq!(snapshot.head.id, head_before.id);
    assert_eq!(snapshot.head.index, head_before.index);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_receives_all_refs_expansion() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let follower_config = ReplicaConfig {
        participation: Participation::FollowerOnly,
        commit_method: CommitMethod::AllRefs,
        commit_speed: CommitSpeed::Fast,
        ..ReplicaConfig::default()
    };
    let (follower, mirror) = remote_replica("mirror", follower_config, &system);
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system), follower],
    )
    .unwrap();

    let (proposal, target) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);

    // The mirror publishes the branch itself, not only the txn refs.
    wait_until("mirror expands refs", || {
        ref_id(&mirror, "refs/heads/main") == Some(target)
    })
    .await;
    let head = leader.snapshot().head.id;
    wait_until("mirror committed ref", || {
        ref_id(&mirror, "refs/txn/committed") == Some(head)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reelection_after_restart_bumps_term() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();

    // A previous leader left an accepted entry at term 5.
    let ident = PersonIdent::new("ketch", "ketch@system", 0);
    let tree = RefTree::empty();
    let tree_id = tree.write_tree(repo.objects.as_ref()).unwrap();
    let prior = CommitData {
        tree: tree_id,
        parents: vec![],
        author: ident.clone(),
        committer: ident,
        message: "Term: 5 seed\n".to_string(),
    };
    let prior_id = insert_commit(repo.objects.as_ref(), &prior).unwrap();
    repo.refs
        .update_batch(&mut [RefUpdate::create("refs/txn/accepted", prior_id)])
        .unwrap();

    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();
    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);

    let snapshot = leader.snapshot();
    assert_eq!(snapshot.term, 6);

    // History: proposal entry -> term-6 election -> the seeded entry.
    let head = read_commit(repo.objects.as_ref(), &snapshot.head.id).unwrap();
    let election = read_commit(repo.objects.as_ref(), &head.parents[0]).unwrap();
    assert_eq!(election.term().unwrap(), 6);
    assert_eq!(election.parents, vec![prior_id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_after_shutdown_aborts() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    leader.shutdown();
    assert_eq!(leader.snapshot().state, LeaderState::Shutdown);

    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert_eq!(proposal.state(), ProposalState::Aborted);
    assert!(proposal.commands()[0]
        .message()
        .unwrap()
        .contains("shut down"));

    // Shutting down twice is harmless.
    leader.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn voter_counts_must_be_odd_and_small() {
    let system = test_system();

    let build = |voters: usize| {
        let repo = Repository::in_memory();
        let mut replicas = vec![local_voter(&repo, &system)];
        for n in 1..voters {
            replicas.push(Replica::remote(
                format!("r{n}"),
                ReplicaConfig::default(),
                Arc::new(FailingTransport),
            ));
        }
        Leader::new(system.clone(), repo, replicas).map(|_| ())
    };

    for ok in [1, 3, 5, 7, 9] {
        assert!(build(ok).is_ok(), "{ok} voters should be accepted");
    }
    for bad in [2, 4, 6, 8, 10, 11] {
        assert!(build(bad).is_err(), "{bad} voters should be rejected");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_replica_must_be_a_voter() {
    let system = test_system();
    let repo = Repository::in_memory();

    // Only a remote voter: refused.
    let remote_only = vec![Replica::remote(
        "r1",
        ReplicaConfig::default(),
        Arc::new(FailingTransport),
    )];
    assert!(Leader::new(system.clone(), repo.clone(), remote_only).is_err());

    // A local follower does not satisfy the requirement either.
    let follower_config = ReplicaConfig {
        participation: Participation::FollowerOnly,
        ..ReplicaConfig::default()
    };
    let replicas = vec![
        Replica::local("local", follower_config, &repo, system.config()),
        Replica::remote("r1", ReplicaConfig::default(), Arc::new(FailingTransport)),
    ];
    assert!(Leader::new(system.clone(), repo, replicas).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_serializes_for_operators() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    let (proposal, _) = create_main(&repo, 1);
    leader.queue_proposal(&proposal).unwrap();
    assert!(proposal.await_terminal_timeout(WAIT).await);

    let rendered = serde_json::to_value(leader.snapshot()).unwrap();
    assert_eq!(rendered["state"], "Leader");
    assert_eq!(rendered["term"], 1);
    assert_eq!(rendered["replicas"][0]["name"], "local");
    assert_eq!(rendered["replicas"][0]["status"], "Current");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_never_passes_head() {
    init_logger();
    let repo = Repository::in_memory();
    let system = test_system();
    let leader = Leader::new(
        system.clone(),
        repo.clone(),
        vec![local_voter(&repo, &system)],
    )
    .unwrap();

    for n in 0..4u8 {
        let target = seed_commit(&repo, n + 10);
        let proposal = Arc::new(Proposal::new(vec![RefUpdate::create(
            format!("refs/heads/b{n}"),
            target,
        )]));
        leader.queue_proposal(&proposal).unwrap();
        assert!(proposal.await_terminal_timeout(WAIT).await);
        let snapshot = leader.snapshot();
        assert!(snapshot.committed.index <= snapshot.head.index);
    }
}

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub static QUEUED_PROPOSALS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ketch_queued_proposals",
        "Proposals waiting in the leader queue"
    )
    .unwrap()
});

pub static PROPOSALS_EXECUTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ketch_proposals_executed",
        "Proposals that reached the executed state"
    )
    .unwrap()
});

pub static PROPOSALS_ABORTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ketch_proposals_aborted",
        "Proposals that reached the aborted state"
    )
    .unwrap()
});

pub static ROUNDS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_rounds_started",
        "Consensus rounds started, by kind",
        &["kind"]
    )
    .unwrap()
});

pub static REPLICA_PUSHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ketch_replica_pushes",
        "Replica pushes completed, by result",
        &["result"]
    )
    .unwrap()
});

pub static LEADER_TERM: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ketch_leader_term", "Current term of the local leader").unwrap()
});

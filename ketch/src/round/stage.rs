use crate::config::KetchConfig;
use crate::error::StoreError;
use crate::store::{insert_commit, reduce_to_tips, ObjectKind, ObjectStore};
use ketch_types::{CommitData, ObjectId, PersonIdent, RefUpdate};

/// Small sets are anchored one reference per object.
const SMALL_BATCH_SIZE: usize = 5;

/// Largest number of tips folded into one temporary anchor commit.
const MAX_STAGE_PARENTS: usize = 128;

/// Build the stage commands anchoring `new_ids` under
/// `<prefix>stage/<txn>.<n>` until the round either commits or is abandoned.
///
/// Large sets are first reduced to their reachable tips; if many tips
/// remain they are folded into chained temporary commits so a single
/// reference can anchor the whole set.
pub(crate) fn build_stage_commands(
    store: &dyn ObjectStore,
    config: &KetchConfig,
    ident: &PersonIdent,
    txn_id: ObjectId,
    new_ids: Vec<ObjectId>,
) -> Result<Vec<RefUpdate>, StoreError> {
    if new_ids.len() <= SMALL_BATCH_SIZE {
        return Ok(direct(config, txn_id, new_ids));
    }

    let mut commits = Vec::new();
    let mut anchors = Vec::new();
    for id in new_ids {
        match store.read(&id) {
            Ok((ObjectKind::Commit, _)) => commits.push(id),
            // Non-commit (or locally absent) objects cannot be folded into a
            // parent chain; anchor them directly.
            _ => anchors.push(id),
        }
    }

    let tips = reduce_to_tips(store, &commits);
    if tips.is_empty() || anchors.len() + tips.len() <= SMALL_BATCH_SIZE {
        anchors.extend(tips);
    } else {
        anchors.push(chain_batches(store, ident, tips)?);
    }
    Ok(direct(config, txn_id, anchors))
}

fn direct(config: &KetchConfig, txn_id: ObjectId, ids: Vec<ObjectId>) -> Vec<RefUpdate> {
    ids.into_iter()
        .enumerate()
        .map(|(n, id)| RefUpdate::create(config.stage_ref_name(&txn_id, n as u64), id))
        .collect()
}

fn chain_batches(
    store: &dyn ObjectStore,
    ident: &PersonIdent,
    tips: Vec<ObjectId>,
) -> Result<ObjectId, StoreError> {
    let empty_tree = store.insert(ObjectKind::Tree, b"")?;
    let mut prev: Option<ObjectId> = None;
    let mut batch: Vec<ObjectId> = Vec::new();
    for id in tips {
        batch.push(id);
        let limit = if prev.is_some() {
            MAX_STAGE_PARENTS - 1
        } else {
            MAX_STAGE_PARENTS
        };
        if batch.len() == limit {
            prev = Some(flush_batch(store, ident, empty_tree, &mut batch, prev)?);
        }
    }
    if !batch.is_empty() {
        prev = Some(flush_batch(store, ident, empty_tree, &mut batch, prev)?);
    }
    Ok(prev.expect("at least one batch"))
}

fn flush_batch(
    store: &dyn ObjectStore,
    ident: &PersonIdent,
    tree: ObjectId,
    batch: &mut Vec<ObjectId>,
    prev: Option<ObjectId>,
) -> Result<ObjectId, StoreError> {
    let mut parents = std::mem::take(batch);
    parents.extend(prev);
    insert_commit(
        store,
        &CommitData {
            tree,
            parents,
            author: ident.clone(),
            committer: ident.clone(),
            message: String::new(),
        },
    )
}

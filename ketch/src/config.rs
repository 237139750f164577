use crate::error::KetchError;
use crate::replica::{CommitMethod, CommitSpeed, Participation};
use ketch_types::ObjectId;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default namespace holding the transactional references.
pub const DEFAULT_TXN_NAMESPACE: &str = "refs/txn/";

const DEFAULT_MAX_CLOCK_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_MIN_RETRY: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRY: Duration = Duration::from_secs(60);

/// System-wide configuration shared by every leader in the process.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KetchConfig {
    /// Prefix of the transaction namespace. Must start with `refs/` and end
    /// with `/`.
    pub txn_namespace: String,

    /// Upper bound on how long a round blocks for its proposed timestamp to
    /// become "past" before failing with `TimeUncertain`.
    #[serde(deserialize_with = "de_duration")]
    pub max_wait_for_monotonic_clock: Duration,

    /// Reject elections whose timestamp is before the previous accepted
    /// commit's committer time.
    pub require_monotonic_leader_elections: bool,

    /// Committer identity stamped on election and proposal commits.
    pub committer_name: String,
    pub committer_email: String,
}

impl Default for KetchConfig {
    fn default() -> Self {
        KetchConfig {
            txn_namespace: DEFAULT_TXN_NAMESPACE.to_string(),
            max_wait_for_monotonic_clock: DEFAULT_MAX_CLOCK_WAIT,
            require_monotonic_leader_elections: false,
            committer_name: "ketch".to_string(),
            committer_email: "ketch@system".to_string(),
        }
    }
}

impl KetchConfig {
    pub fn validate(&self) -> Result<(), KetchError> {
        if !self.txn_namespace.starts_with("refs/") || !self.txn_namespace.ends_with('/') {
            return Err(KetchError::InvalidConfig(format!(
                "txn namespace must match refs/*/: {}",
                self.txn_namespace
            )));
        }
        Ok(())
    }

    /// Name of the reference tracking the latest accepted log entry.
    pub fn accepted_ref_name(&self) -> String {
        format!("{}accepted", self.txn_namespace)
    }

    /// Name of the reference tracking the latest quorum-committed log entry.
    pub fn committed_ref_name(&self) -> String {
        format!("{}committed", self.txn_namespace)
    }

    /// Name of a temporary stage anchor for `txn_id`.
    pub fn stage_ref_name(&self, txn_id: &ObjectId, n: u64) -> String {
        format!("{}stage/{}.{:x}", self.txn_namespace, txn_id.to_hex(), n)
    }

    /// Whether `name` lives inside the transaction namespace.
    pub fn in_txn_namespace(&self, name: &str) -> bool {
        name.starts_with(&self.txn_namespace)
    }
}

/// Per-replica configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaConfig {
    /// Voter or follower-only.
    pub participation: Participation,

    /// How the quorum-committed state is published to this replica.
    pub commit_method: CommitMethod,

    /// When the committed position is pushed: batched into the next round or
    /// immediately after every accept.
    pub commit_speed: CommitSpeed,

    /// Retry delay bounds for failed pushes.
    #[serde(deserialize_with = "de_duration")]
    pub min_retry: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub max_retry: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            participation: Participation::Full,
            commit_method: CommitMethod::TxnCommitted,
            commit_speed: CommitSpeed::Batched,
            min_retry: DEFAULT_MIN_RETRY,
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

impl ReplicaConfig {
    /// Build a config from the option strings recognized in the replica
    /// stanza of a repository configuration.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, KetchError> {
        let mut cfg = ReplicaConfig::default();
        for (key, value) in options {
            match key.as_str() {
                "type" => cfg.participation = value.parse()?,
                "commit" => cfg.commit_method = value.parse()?,
                "speed" => cfg.commit_speed = value.parse()?,
                "minRetry" => cfg.min_retry = parse_duration(value)?,
                "maxRetry" => cfg.max_retry = parse_duration(value)?,
                other => {
                    return Err(KetchError::InvalidConfig(format!(
                        "unrecognized replica option: {other}"
                    )))
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), KetchError> {
        if self.min_retry > self.max_retry {
            return Err(KetchError::InvalidConfig(format!(
                "minRetry {:?} exceeds maxRetry {:?}",
                self.min_retry, self.max_retry
            )));
        }
        if self.min_retry.as_millis() == 0 {
            return Err(KetchError::InvalidConfig(
                "minRetry must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string with a unit suffix: `ms`, `s`, `min`, `h` or `d`.
pub fn parse_duration(s: &str) -> Result<Duration, KetchError> {
    let s = s.trim();
    let digits = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(digits);
    let value: u64 = number
        .parse()
        .map_err(|_| KetchError::InvalidConfig(format!("invalid duration: {s}")))?;
    let millis = match unit.trim() {
        "ms" => value,
        "s" => value * 1_000,
        "min" => value * 60_000,
        "h" => value * 3_600_000,
        "d" => value * 86_400_000,
        _ => {
            return Err(KetchError::InvalidConfig(format!(
                "invalid duration unit in: {s}"
            )))
        }
    };
    Ok(Duration::from_millis(millis))
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5 parsecs").is_err());
    }

    #[test]
    fn replica_options_round_trip() {
        let mut options = BTreeMap::new();
        options.insert("type".to_string(), "FOLLOWER_ONLY".to_string());
        options.insert("commit".to_string(), "ALL_REFS".to_string());
        options.insert("speed".to_string(), "FAST".to_string());
        options.insert("minRetry".to_string(), "100ms".to_string());
        options.insert("maxRetry".to_string(), "1s".to_string());
        let cfg = ReplicaConfig::from_options(&options).unwrap();
        assert_eq!(cfg.participation, Participation::FollowerOnly);
        assert_eq!(cfg.commit_method, CommitMethod::AllRefs);
        assert_eq!(cfg.commit_speed, CommitSpeed::Fast);
        assert_eq!(cfg.min_retry, Duration::from_millis(100));
        assert_eq!(cfg.max_retry, Duration::from_secs(1));
    }

    #[test]
    fn replica_options_reject_unknown_key() {
        let mut options = BTreeMap::new();
        options.insert("colour".to_string(), "blue".to_string());
        assert!(ReplicaConfig::from_options(&options).is_err());
    }

    #[test]
    fn replica_options_reject_inverted_retry_bounds() {
        let mut options = BTreeMap::new();
        options.insert("minRetry".to_string(), "1min".to_string());
        options.insert("maxRetry".to_string(), "1s".to_string());
        assert!(ReplicaConfig::from_options(&options).is_err());
    }

    #[test]
    fn namespace_must_be_refs_slash() {
        let mut cfg = KetchConfig::default();
        cfg.validate().unwrap();
        cfg.txn_namespace = "txn/".to_string();
        assert!(cfg.validate().is_err());
        cfg.txn_namespace = "refs/txn".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stage_names_carry_txn_id_and_counter() {
        let cfg = KetchConfig::default();
        let id = ObjectId::hash_content("commit", b"x");
        let name = cfg.stage_ref_name(&id, 11);
        assert!(name.starts_with("refs/txn/stage/"));
        assert!(name.ends_with(".b"));
        assert!(cfg.in_txn_namespace(&name));
        assert!(!cfg.in_txn_namespace("refs/heads/main"));
    }
}

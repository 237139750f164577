use super::transport::{RefAdvertisement, ReplicaTransport, TransportError};
use crate::store::Repository;
use async_trait::async_trait;
use ketch_types::RefUpdate;

/// Transport for the replica living in the leader's own process.
///
/// The in-process reference database is not multi-ref atomic, so the batch is
/// applied in three waves: ordinary references first, then the accepted
/// pointer, then the committed pointer. A failure in an earlier wave skips
/// the later waves, so accepted/committed can never advance past objects the
/// ordinary references still miss.
pub struct LocalTransport {
    repo: Repository,
    accepted_name: String,
    committed_name: String,
}

impl LocalTransport {
    pub fn new(repo: Repository, accepted_name: String, committed_name: String) -> Self {
        LocalTransport {
            repo,
            accepted_name,
            committed_name,
        }
    }

    fn wave(&self, name: &str) -> u8 {
        if name == self.accepted_name {
            1
        } else if name == self.committed_name {
            2
        } else {
            0
        }
    }
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn push(&self, commands: &mut Vec<RefUpdate>) -> Result<RefAdvertisement, TransportError> {
        let mut all_ok = true;
        for wave in 0..=2u8 {
            if !all_ok {
                break;
            }
            for cmd in commands.iter_mut() {
                if self.wave(&cmd.name) != wave {
                    continue;
                }
                let ok = self
                    .repo
                    .refs
                    .update_batch(std::slice::from_mut(cmd))
                    .map_err(|e| TransportError::Unreachable(e.to_string()))?;
                all_ok &= ok;
            }
        }

        let advertised = RefAdvertisement {
            refs: self
                .repo
                .refs
                .advertised()
                .map_err(|e| TransportError::Unreachable(e.to_string()))?,
        };
        if all_ok {
            Ok(advertised)
        } else {
            Err(TransportError::LockFailure { advertised })
        }
    }
}

use crate::config::KetchConfig;
use crate::error::KetchError;
use crate::util::time_service::{ProposedTimestamp, SystemTimeSource, TimeSource};
use ketch_types::PersonIdent;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};

/// Process-wide services shared by every leader: configuration, the
/// monotonic clock and the executor running leader workers and replica
/// pushes.
pub struct KetchSystem {
    config: KetchConfig,
    time: Arc<dyn TimeSource>,
    executor: Handle,
}

impl KetchSystem {
    pub fn new(config: KetchConfig, executor: Handle) -> Result<Arc<Self>, KetchError> {
        Self::with_time_source(config, executor, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        config: KetchConfig,
        executor: Handle,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<Self>, KetchError> {
        config.validate()?;
        Ok(Arc::new(KetchSystem {
            config,
            time,
            executor,
        }))
    }

    /// Build a runtime sized for consensus work when the embedder does not
    /// bring its own.
    pub fn default_runtime() -> std::io::Result<Runtime> {
        Builder::new_multi_thread()
            .worker_threads(5.max(num_cpus::get()))
            .thread_name("ketch")
            .enable_all()
            .build()
    }

    pub fn config(&self) -> &KetchConfig {
        &self.config
    }

    pub fn time(&self) -> &dyn TimeSource {
        self.time.as_ref()
    }

    /// The system committer identity at `when`.
    pub fn committer(&self, when: ProposedTimestamp) -> PersonIdent {
        PersonIdent::new(
            self.config.committer_name.clone(),
            self.config.committer_email.clone(),
            when.millis(),
        )
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor.spawn(future);
    }
}

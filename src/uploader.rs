//! Background file uploads.
//!
//! One [`FileUploader`] sweeps one `(local, remote)` store pair: every poll
//! it lists the local lane and spawns uploads for files it is not already
//! moving, bounded both in concurrency and in total in-flight tasks. A
//! successful upload deletes the local copy; a failed one leaves the file
//! for the next sweep. Remote keys derive from filenames, so replays are
//! idempotent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, trace};

use crate::internal_events::{FileUploadFailed, FileUploaded, InternalEvent};
use crate::shutdown::ShutdownSignal;
use crate::store::{BlockStore, StoreError};

pub struct FileUploader {
    local: Arc<dyn BlockStore>,
    remote: Arc<dyn BlockStore>,
    poll_interval: Duration,
    max_concurrent: usize,
    max_in_flight: usize,
    /// How long to wait for in-flight uploads once shutdown is requested.
    drain_timeout: Duration,
}

impl FileUploader {
    pub fn new(local: Arc<dyn BlockStore>, remote: Arc<dyn BlockStore>) -> Self {
        FileUploader {
            local,
            remote,
            poll_interval: Duration::from_millis(500),
            max_concurrent: 5,
            max_in_flight: 250,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Runs until `shutdown` fires, then drains in-flight uploads under the
    /// configured grace period.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(String, Result<(), StoreError>)> = JoinSet::new();
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(
            message = "File uploader started.",
            local = %self.local.location(),
            remote = %self.remote.location(),
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(&mut in_flight, &mut tasks, &semaphore).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::settle(joined, &mut in_flight, &self.remote);
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Grace drain: finish what is already moving, start nothing new.
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                Self::settle(joined, &mut in_flight, &self.remote);
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            error!(
                message = "Timed out draining in-flight uploads.",
                remaining = in_flight.len(),
            );
        }
        debug!(message = "File uploader stopped.", local = %self.local.location());
    }

    async fn sweep(
        &self,
        in_flight: &mut HashSet<String>,
        tasks: &mut JoinSet<(String, Result<(), StoreError>)>,
        semaphore: &Arc<Semaphore>,
    ) {
        let names = match self.local.list().await {
            Ok(names) => names,
            Err(error) => {
                error!(message = "Failed to list local store.", %error);
                return;
            }
        };

        for name in names {
            if in_flight.len() >= self.max_in_flight {
                trace!(message = "In-flight upload limit reached.", limit = self.max_in_flight);
                break;
            }
            if !in_flight.insert(name.clone()) {
                continue;
            }

            let local = Arc::clone(&self.local);
            let remote = Arc::clone(&self.remote);
            let semaphore = Arc::clone(semaphore);
            tasks.spawn(async move {
                let result = Self::upload_one(&local, &remote, &name, &semaphore).await;
                (name, result)
            });
        }
    }

    async fn upload_one(
        local: &Arc<dyn BlockStore>,
        remote: &Arc<dyn BlockStore>,
        name: &str,
        semaphore: &Semaphore,
    ) -> Result<(), StoreError> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| StoreError::Background {
                reason: "upload semaphore closed".to_owned(),
            })?;

        let data = local.read(name).await?;
        remote.write(name, data).await?;
        local.delete(name).await
    }

    fn settle(
        joined: Result<(String, Result<(), StoreError>), tokio::task::JoinError>,
        in_flight: &mut HashSet<String>,
        remote: &Arc<dyn BlockStore>,
    ) {
        match joined {
            Ok((name, Ok(()))) => {
                in_flight.remove(&name);
                FileUploaded {
                    name,
                    to: remote.location(),
                }
                .emit();
            }
            Ok((name, Err(error))) => {
                in_flight.remove(&name);
                FileUploadFailed { name, error }.emit();
            }
            Err(join_error) => {
                // The task never returned its name; the file stays listed as
                // in-flight until the next process restart, which is safe
                // because uploads are idempotent.
                error!(message = "Upload task panicked.", error = %join_error);
            }
        }
    }
}

//! Keeping a single driver's footprint in the shared queue bounded.

use std::{collections::BTreeSet, thread, time::Duration};

use log::{info, warn};

use super::{JobId, JobState, QueueEntry, Scheduler};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// The jobs this driver has submitted and still considers live. IDs enter
/// `pending` on submission, move to `running` once the scheduler no longer
/// lists them as pending, and are dropped once it no longer lists them as
/// running. Only live queue queries move them.
#[derive(Debug)]
pub struct ThrottleState {
    pending: BTreeSet<JobId>,
    running: BTreeSet<JobId>,
    poll_interval: Duration,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ThrottleState {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            pending: BTreeSet::new(),
            running: BTreeSet::new(),
            poll_interval,
        }
    }

    pub fn pending(&self) -> &BTreeSet<JobId> {
        &self.pending
    }

    pub fn running(&self) -> &BTreeSet<JobId> {
        &self.running
    }

    /// query the queue until the scheduler answers
    fn live_queue<S: Scheduler + ?Sized>(&self, scheduler: &S) -> Vec<QueueEntry> {
        loop {
            match scheduler.query_queue() {
                Ok(entries) => return entries,
                Err(e) => {
                    warn!(
                        "queue query failed, retrying in {:?}: {e}",
                        self.poll_interval
                    );
                    thread::sleep(self.poll_interval);
                }
            }
        }
    }

    fn ids_in(live: &[QueueEntry], state: JobState) -> BTreeSet<JobId> {
        live.iter()
            .filter(|e| e.state == state)
            .map(|e| e.id)
            .collect()
    }

    /// move every pending job the scheduler no longer lists as pending into
    /// `running`
    fn refresh_pending(&mut self, live: &[QueueEntry]) {
        let live = Self::ids_in(live, JobState::Pending);
        let started: Vec<_> = self.pending.difference(&live).copied().collect();
        for id in started {
            self.pending.remove(&id);
            self.running.insert(id);
        }
    }

    /// forget every running job the scheduler no longer lists as running
    fn refresh_running(&mut self, live: &[QueueEntry]) {
        let live = Self::ids_in(live, JobState::Running);
        self.running.retain(|id| live.contains(id));
    }

    /// Record the freshly submitted `job` and block until fewer than
    /// `max_pending` of this driver's jobs are pending and fewer than
    /// `max_running` are running.
    pub fn admit_next<S: Scheduler + ?Sized>(
        &mut self,
        scheduler: &S,
        job: JobId,
        max_pending: usize,
        max_running: usize,
    ) {
        self.pending.insert(job);
        let mut waited = false;
        loop {
            let live = self.live_queue(scheduler);
            self.refresh_pending(&live);
            if self.pending.len() < max_pending {
                break;
            }
            if !waited {
                info!(
                    "{} jobs pending, waiting for fewer than {max_pending}",
                    self.pending.len()
                );
                waited = true;
            }
            thread::sleep(self.poll_interval);
        }
        let mut waited = false;
        loop {
            let live = self.live_queue(scheduler);
            self.refresh_running(&live);
            if self.running.len() < max_running {
                break;
            }
            if !waited {
                info!(
                    "{} jobs running, waiting for fewer than {max_running}",
                    self.running.len()
                );
                waited = true;
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Block until one more submission would keep the user's whole queue at
    /// or below `max_total` jobs, checking every `wait`. Returns the depth
    /// observed by the final check.
    pub fn admit_global<S: Scheduler + ?Sized>(
        &self,
        scheduler: &S,
        max_total: usize,
        wait: Duration,
    ) -> usize {
        let mut waited = false;
        loop {
            let depth = self.live_queue(scheduler).len();
            if depth < max_total {
                return depth;
            }
            if !waited {
                info!("{depth} jobs in the queue, waiting for space under {max_total}");
                waited = true;
            }
            thread::sleep(wait);
        }
    }
}

use crate::error::Result;
use crate::fanout::job::FanoutJob;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Destination for jobs deferred by an ASYNC circuit breaker
#[async_trait]
pub trait FanoutQueue: Send + Sync {
    async fn enqueue(&self, job: FanoutJob) -> Result<()>;
}

/// FIFO per priority; higher priority drains first
#[derive(Default)]
pub struct InMemoryFanoutQueue {
    jobs: Mutex<VecDeque<FanoutJob>>,
}

impl InMemoryFanoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next job
    pub fn pop(&self) -> Option<FanoutJob> {
        let mut jobs = self.jobs.lock();
        let best = jobs
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(i, _)| i)?;
        jobs.remove(best)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_all(&self) -> Vec<FanoutJob> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.jobs.lock().clear();
    }
}

#[async_trait]
impl FanoutQueue for InMemoryFanoutQueue {
    async fn enqueue(&self, job: FanoutJob) -> Result<()> {
        self.jobs.lock().push_back(job);
        Ok(())
    }
}

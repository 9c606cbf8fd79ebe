//! Per-project bound on concurrent target executions.
//!
//! Every target of every run in a project competes for the same permits, so
//! overlapping runs of one project never exceed the browser-session budget
//! while other projects proceed independently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct WorkerPool {
    per_project: usize,
    permits: Arc<Mutex<HashMap<i64, Arc<Semaphore>>>>,
}

impl WorkerPool {
    pub fn new(per_project: usize) -> Self {
        Self {
            per_project: per_project.max(1),
            permits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn semaphore(&self, project_id: i64) -> Arc<Semaphore> {
        let mut permits = self.permits.lock();
        Arc::clone(
            permits
                .entry(project_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_project))),
        )
    }

    /// Run `work` once a slot for `project_id` is free.
    pub async fn run<F: Future>(&self, project_id: i64, work: F) -> F::Output {
        let semaphore = self.semaphore(project_id);
        // The semaphore is never closed, so acquisition only waits.
        let _permit = semaphore.acquire_owned().await.ok();
        work.await
    }

    #[cfg(test)]
    fn available(&self, project_id: i64) -> usize {
        self.semaphore(project_id).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn busy(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        active.fetch_sub(1, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_bounded_per_project() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let work = (0..8).map(|_| pool.run(1, busy(active.clone(), peak.clone())));
        futures::future::join_all(work).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available(1), 2);
    }

    #[tokio::test]
    async fn test_projects_are_independent() {
        let pool = WorkerPool::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let work = (0..4).map(|p| pool.run(p, busy(active.clone(), peak.clone())));
        futures::future::join_all(work).await;

        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }
}

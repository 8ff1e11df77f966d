use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

/// A scheduled unit of work. It must be completed through [JobHandle::complete] before its
///  outputs can be used; for a driver tick, this also makes the driver usable again.
pub struct JobHandle {
    task: JoinHandle<anyhow::Result<()>>,
    in_flight: Option<Arc<AtomicBool>>,
}

impl JobHandle {
    pub(crate) fn for_update(task: JoinHandle<anyhow::Result<()>>, in_flight: Arc<AtomicBool>) -> JobHandle {
        JobHandle {
            task,
            in_flight: Some(in_flight),
        }
    }

    /// Wait for the job to finish, returning its result
    pub async fn complete(self) -> anyhow::Result<()> {
        let result = self.task.await;
        if let Some(in_flight) = &self.in_flight {
            in_flight.store(false, Ordering::Release);
        }
        result?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Wrap an arbitrary task, e.g. to make a driver tick depend on it
impl From<JoinHandle<anyhow::Result<()>>> for JobHandle {
    fn from(task: JoinHandle<anyhow::Result<()>>) -> Self {
        JobHandle {
            task,
            in_flight: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_clears_in_flight() {
        let in_flight = Arc::new(AtomicBool::new(true));
        let job = JobHandle::for_update(tokio::spawn(async { Ok::<(), anyhow::Error>(()) }), in_flight.clone());
        job.complete().await.unwrap();
        assert!(!in_flight.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_failure_is_propagated() {
        let in_flight = Arc::new(AtomicBool::new(true));
        let job = JobHandle::for_update(tokio::spawn(async { Err::<(), _>(anyhow::anyhow!("boom")) }), in_flight.clone());
        assert_eq!(job.complete().await.unwrap_err().to_string(), "boom");
        assert!(!in_flight.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_wrap_task() {
        let job: JobHandle = tokio::spawn(async { Ok::<(), anyhow::Error>(()) }).into();
        job.complete().await.unwrap();
    }
}

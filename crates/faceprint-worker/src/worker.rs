use crate::notify::Notifier;
use chrono::{TimeDelta, Utc};
use faceprint_core::enroll::{enroll_user, EnrollOutcome};
use faceprint_core::extractor::FaceExtractor;
use faceprint_core::UserId;
use faceprint_queue::{ClaimedTask, QueueError, TaskId, TaskPayload, TaskStatus};
use faceprint_store::ObjectStore;
use rusqlite::Connection;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Outcome recorded (success or structured failure).
    Completed,
    /// The task panicked and went back to the queue, or died.
    Released(TaskStatus),
}

/// Claims enrollment tasks one at a time and runs them against a single
/// extractor.
pub struct Worker<X, N> {
    queue: Connection,
    extractor: X,
    store: Arc<dyn ObjectStore>,
    notifier: N,
    max_attempts: u32,
}

impl<X: FaceExtractor, N: Notifier> Worker<X, N> {
    pub fn new(
        queue: Connection,
        extractor: X,
        store: Arc<dyn ObjectStore>,
        notifier: N,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            extractor,
            store,
            notifier,
            max_attempts,
        }
    }

    pub fn extractor_mut(&mut self) -> &mut X {
        &mut self.extractor
    }

    /// Put back `running` tasks older than `stale_after`.
    pub fn recover_stale(&mut self, stale_after: Duration) -> Result<usize, QueueError> {
        let Some(cutoff) = TimeDelta::from_std(stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        faceprint_queue::requeue_stale(&mut self.queue, cutoff, self.max_attempts)
    }

    /// Claim and run the oldest queued task. `None` when the queue is empty.
    pub fn run_once(&mut self) -> Result<Option<(TaskId, TaskDisposition)>, QueueError> {
        let Some(task) = faceprint_queue::claim_next(&mut self.queue)? else {
            return Ok(None);
        };
        let id = task.id;
        tracing::info!(task_id = %id, attempt = task.attempts, task = task.payload.name(), "task claimed");

        let store = Arc::clone(&self.store);
        let extractor = &mut self.extractor;
        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            run_task(&task, extractor, store.as_ref(), Utc::now().timestamp())
        }));

        let disposition = match run {
            Ok(outcome) => {
                faceprint_queue::complete(&self.queue, &id, &serde_json::to_value(&outcome)?)?;
                self.notifier.notify(&id, &outcome);
                TaskDisposition::Completed
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(task_id = %id, panic = message, "task panicked");
                let status = faceprint_queue::release(
                    &mut self.queue,
                    &id,
                    &format!("panicked: {message}"),
                    self.max_attempts,
                )?;
                TaskDisposition::Released(status)
            }
        };
        Ok(Some((id, disposition)))
    }

    /// Run tasks until the queue is empty. Returns how many were handled.
    pub fn drain(&mut self) -> Result<usize, QueueError> {
        let mut handled = 0;
        while self.run_once()?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Poll the queue until `stop` is set. The flag is checked between tasks,
    /// so a running task always finishes.
    ///
    /// Claims older than `stale_after` are requeued every `stale_after / 2`.
    /// Queue errors are logged and retried after `poll_interval`.
    pub fn run(&mut self, poll_interval: Duration, stale_after: Duration, stop: &AtomicBool) {
        let recovery_interval = (stale_after / 2).max(poll_interval);
        let mut next_recovery = Instant::now();

        while !stop.load(Ordering::SeqCst) {
            if Instant::now() >= next_recovery {
                if let Err(e) = self.recover_stale(stale_after) {
                    tracing::error!(error = %e, "stale task recovery failed");
                }
                next_recovery = Instant::now() + recovery_interval;
            }

            match self.run_once() {
                Ok(Some(_)) => {}
                Ok(None) => std::thread::sleep(poll_interval),
                Err(e) => {
                    tracing::error!(error = %e, "queue error; retrying");
                    std::thread::sleep(poll_interval);
                }
            }
        }
        tracing::info!("worker loop stopped");
    }
}

/// Run one task to its outcome.
pub fn run_task<X: FaceExtractor + ?Sized>(
    task: &ClaimedTask,
    extractor: &mut X,
    store: &dyn ObjectStore,
    unix_ts: i64,
) -> EnrollOutcome {
    match &task.payload {
        TaskPayload::EnrollUser { user_id, images } => match UserId::parse(user_id) {
            Ok(user) => enroll_user(&user, images, extractor, store, unix_ts),
            Err(e) => {
                tracing::warn!(task_id = %task.id, user_id, error = %e, "task has an invalid user id");
                EnrollOutcome::invalid_user(user_id, e.to_string())
            }
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

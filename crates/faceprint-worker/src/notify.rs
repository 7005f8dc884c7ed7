use faceprint_core::enroll::EnrollOutcome;
use faceprint_queue::TaskId;

/// Receives the outcome of every finished enrollment task.
///
/// Called after the outcome is durably recorded, so a notifier that fails
/// or is slow never loses a result. Implementations must not panic.
pub trait Notifier: Send {
    fn notify(&self, task_id: &TaskId, outcome: &EnrollOutcome);
}

/// Emits one structured log event per outcome.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, task_id: &TaskId, outcome: &EnrollOutcome) {
        match outcome {
            EnrollOutcome::Success {
                user_id,
                images_count,
                skipped,
                ..
            } => tracing::info!(
                task_id = %task_id,
                user_id,
                images_count,
                skipped = skipped.len(),
                "enrollment succeeded"
            ),
            EnrollOutcome::Failure {
                user_id,
                reason,
                message,
                skipped,
            } => tracing::warn!(
                task_id = %task_id,
                user_id,
                ?reason,
                message,
                skipped = skipped.len(),
                "enrollment failed"
            ),
        }
    }
}

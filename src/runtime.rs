use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

/// Runs callbacks asynchronously and after a delay. Everything that is handed to application
///  callbacks goes through here, so handlers never run on a network receive path.
#[derive(Clone)]
pub struct TaskRunner {
    handle: Handle,
}
impl TaskRunner {
    /// Binds to the tokio runtime that is executing the caller
    pub fn current() -> anyhow::Result<TaskRunner> {
        Ok(TaskRunner {
            handle: Handle::try_current()?,
        })
    }

    pub fn new(handle: Handle) -> TaskRunner {
        TaskRunner { handle }
    }

    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        self.handle.spawn(async move { f() });
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> AbortHandle {
        self.handle.spawn(future)
            .abort_handle()
    }

    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> Arc<ScheduledTask> {
        let task = Arc::new(ScheduledTask {
            completed: AtomicBool::new(false),
            timer: Mutex::new(None),
        });

        let cloned_task = task.clone();
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if cloned_task.complete() {
                f();
            }
            else {
                trace!("scheduled task was cancelled concurrently");
            }
        });
        *task.timer.lock() = Some(timer.abort_handle());

        task
    }
}

/// A callback scheduled for later execution. The timer firing and [ScheduledTask::cancel]
///  compete for a single 'completed' flag, so exactly one of them wins.
pub struct ScheduledTask {
    completed: AtomicBool,
    timer: Mutex<Option<AbortHandle>>,
}
impl ScheduledTask {
    fn complete(&self) -> bool {
        self.completed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` if this call prevented the callback from running, and `false` if the
    ///  callback already ran (or is running) or the task was cancelled before.
    pub fn cancel(&self) -> bool {
        if self.complete() {
            if let Some(timer) = self.timer.lock().take() {
                timer.abort();
            }
            true
        }
        else {
            false
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

use std::future::Future;
use std::time::Instant;

/// State of the [`MeasureGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    /// The future is not ready.
    Pending,
    /// The future has terminated with a status.
    Done(&'static str),
}

/// A guard to [`measure`] the execution of futures.
struct MeasureGuard<'a> {
    state: MeasureState,
    task_name: &'a str,
    creation_time: Instant,
}

impl<'a> MeasureGuard<'a> {
    fn new(task_name: &'a str) -> Self {
        Self {
            state: MeasureState::Pending,
            task_name,
            creation_time: Instant::now(),
        }
    }

    /// Marks the future as started and emits the `futures.wait_time` metric.
    fn start(&mut self) {
        metric!(
            timer("futures.wait_time") = self.creation_time.elapsed(),
            "task_name" => self.task_name,
        );
    }

    /// Marks the future as terminated, `futures.done` is emitted on drop.
    fn done(mut self, status: &'static str) {
        self.state = MeasureState::Done(status);
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer("futures.done") = self.creation_time.elapsed(),
            "task_name" => self.task_name,
            "status" => status,
        );
    }
}

/// Measures the timing of a future and reports metrics.
///
/// This function reports two metrics:
///
///  - `futures.wait_time`: Time between creation of the future and the first poll.
///  - `futures.done`: Time between creation of the future and completion.
///
/// The metric is tagged with a status derived with the `get_status` function. A future that is
/// dropped before completion reports `canceled`.
pub fn measure<'a, S, F>(
    task_name: &'a str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output> + 'a
where
    F: 'a + Future,
    S: 'a + FnOnce(&F::Output) -> &'static str,
{
    let mut guard = MeasureGuard::new(task_name);

    async move {
        guard.start();
        let output = f.await;
        guard.done(get_status(&output));
        output
    }
}


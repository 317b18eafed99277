use crate::admission::BudgetHandle;
use crate::download::PartialState;

/// The lifecycle of one source pass of a request.
///
/// Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Waiting for admission budget.
    Idle,
    /// Budget was granted.
    Allowed,
    /// A loading flow is running.
    InProgress,
    /// A result was attached.
    Finished,
}

/// Per request bookkeeping of one source pass.
#[derive(Debug)]
pub struct LoadingState {
    status: Status,
    acquired_budget: Option<BudgetHandle>,
    partial: Option<PartialState>,
}

impl Default for LoadingState {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            acquired_budget: None,
            partial: None,
        }
    }
}

impl LoadingState {
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn acquired_budget(&self) -> Option<&BudgetHandle> {
        self.acquired_budget.as_ref()
    }

    /// Holds a budget that was not released yet.
    pub fn holds_budget(&self) -> bool {
        self.acquired_budget
            .as_ref()
            .is_some_and(|budget| !budget.is_released())
    }

    pub fn partial(&self) -> Option<&PartialState> {
        self.partial.as_ref()
    }

    pub(crate) fn partial_mut(&mut self) -> &mut PartialState {
        self.partial.get_or_insert_with(Default::default)
    }

    pub(crate) fn allow(&mut self, budget: BudgetHandle) {
        self.set_budget(budget);
        self.advance(Status::Allowed);
    }

    pub(crate) fn start_progress(&mut self) {
        self.advance(Status::InProgress);
    }

    pub(crate) fn finish(&mut self) {
        self.advance(Status::Finished);
    }

    /// Replaces the budget, releasing the previous one.
    pub(crate) fn set_budget(&mut self, budget: BudgetHandle) {
        if let Some(previous) = self.acquired_budget.replace(budget) {
            previous.release();
        }
    }

    /// Gives the budget back. Returns `true` if this call released it.
    pub(crate) fn release_budget(&mut self) -> bool {
        self.acquired_budget
            .as_ref()
            .is_some_and(|budget| budget.release())
    }

    /// The state handed to the loading flow.
    ///
    /// Both states share the budget, the partial download moves to the flow.
    pub(crate) fn fork_for_flow(&mut self) -> LoadingState {
        LoadingState {
            status: self.status,
            acquired_budget: self.acquired_budget.clone(),
            partial: self.partial.take(),
        }
    }

    fn advance(&mut self, to: Status) {
        if self.status == Status::Finished {
            return;
        }
        debug_assert!(to >= self.status, "{:?} -> {to:?}", self.status);
        self.status = self.status.max(to);
    }
}

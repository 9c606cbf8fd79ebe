use crate::fixtures::FixtureCache;
use crate::retry::ledger::RetryLedger;
use crate::runs::Coordinator;
use crate::scheduler::Scheduler;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub scheduler: Scheduler,
    pub coordinator: Coordinator,
    pub fixtures: FixtureCache,
}

impl AppState {
    pub fn ledger(&self) -> &RetryLedger {
        self.coordinator.orchestrator().ledger()
    }
}

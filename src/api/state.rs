use crate::scheduler::Scheduler;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: Scheduler,
}

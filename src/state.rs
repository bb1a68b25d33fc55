use std::sync::Arc;

use crate::config::StatsConfig;
use crate::services::scheduler::Scheduler;
use crate::services::series_store::SeriesStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<StatsConfig>,
    pub store: SeriesStore,
    pub scheduler: Arc<Scheduler>,
}

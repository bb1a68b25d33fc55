pub mod credentials;
pub mod deltas;
pub mod remote_stats;
pub mod scheduler;
pub mod series_store;

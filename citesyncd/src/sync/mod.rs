pub mod backoff;
pub mod connectivity;
pub mod engine;
pub mod queue;
pub mod reconcile;
pub mod state;
pub mod store;

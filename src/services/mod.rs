pub mod actions;
pub mod executor;
pub mod queue;
pub mod redis_store;
pub mod relay;
pub mod retry;
pub mod store;

pub mod events;
pub mod messages;
pub mod operations;
pub mod scheduler;
pub mod state;
pub mod subscriptions;

pub mod bus;
pub mod config;
pub mod prompt;
pub mod store;
pub mod twitch;

pub mod coordinator;
pub mod crawler;
pub mod delete;
pub mod diff;
pub mod local_walker;
pub mod paths;
pub mod remote;
pub mod tokens;
pub mod watcher;

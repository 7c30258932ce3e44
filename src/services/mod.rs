pub mod ai;
pub mod command;
pub mod config;
pub mod intent;
pub(crate) mod paths;
pub mod prompts;
pub mod sync;

pub mod config_source;
pub mod engine;
pub mod executor_client;
pub mod git;
pub mod inventory;
pub mod node_file;
pub mod verifier;

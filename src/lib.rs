pub mod anchor;
pub mod capability;
pub mod config;
pub mod errors;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod replan;
pub mod router;
pub mod scope;
pub mod similarity;
pub mod store;
pub mod stuck;
pub mod usage;

pub mod config;
pub mod delivery;
pub mod errors;
pub mod github;
pub mod locator;
pub mod logging;
pub mod orchestrator;
pub mod util;

//! Poll orchestration: trigger a run, wait for one stage, deliver its report.
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `runner` | `Orchestrator`, `OrchestratorSettings`, run resolution      |
//! | `state`  | `OrchestrationState` machine, `PollState`, events, reports  |

pub mod runner;
pub mod state;

pub use runner::{Orchestrator, OrchestratorSettings, select_triggered_run};
pub use state::{OrchestrationState, PollState, ProgressEvent, RunReport};

//! GitHub Actions access: dispatching runs and reading their status.
//!
//! | Module   | Responsibility                                             |
//! |----------|------------------------------------------------------------|
//! | `client` | `GitHubClient`, `TriggerClient` / `RunStatusClient` traits |
//! | `models` | Domain types (`RunReference`, `StageStatus`, ...) and wire types |
//! | `repo`   | `RepoSlug` parsing and token format checks                 |

pub mod client;
pub mod models;
pub mod repo;

pub use client::{GitHubClient, GitHubSettings, RunStatusClient, TriggerClient};
pub use models::{
    Lifecycle, Outcome, RunHandle, RunReference, RunStatus, RunSummary, StageStatus,
    TriggerOutcome,
};
pub use repo::{RepoSlug, is_valid_github_token};

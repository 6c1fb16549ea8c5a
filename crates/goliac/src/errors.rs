//! Cycle-level error taxonomy.
//!
//! Validation diagnostics (which accumulate instead of failing fast) live
//! with the entity loader; this module covers the errors that decide the
//! fate of a whole reconciliation cycle.

use thiserror::Error;

/// Errors that abort a reconciliation cycle.
#[derive(Debug, Error)]
pub(crate) enum CycleError {
    /// The desired snapshot is invalid. The previous applied tag is kept.
    #[error("desired state is invalid: {count} validation error(s)")]
    Load { count: usize },
    /// The observed snapshot could not be fetched. The next cycle retries
    /// after the cache TTL.
    #[error("remote snapshot load failed")]
    Remote(#[source] crate::github::GithubError),
    /// More commands were enqueued than `maxChangesets` allows.
    #[error("changeset ceiling exceeded: {queued} commands queued, limit is {limit}")]
    ChangesetCeiling { queued: usize, limit: usize },
    /// A git operation on the teams repository failed.
    #[error("git error: {context}")]
    Git {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    /// An I/O error against the cloned worktree.
    #[error("worktree I/O error")]
    Worktree(#[from] std::io::Error),
    /// `goliac.yaml` could not be read or parsed.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// A single failed mutation. Non-fatal: remaining commands in the same
/// batch are still dispatched, and the next cycle re-attempts.
#[derive(Debug, Error)]
#[error("mutation `{command}` failed")]
pub(crate) struct MutationError {
    /// A short rendering of the command that failed.
    pub(crate) command: String,
    #[source]
    pub(crate) source: crate::github::GithubError,
}

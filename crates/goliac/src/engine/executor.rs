//! The batching executor: a queue of typed mutation commands, gated by
//! the per-cycle changeset ceiling and dispatched in enqueue order.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;

use crate::{
    errors::{CycleError, MutationError},
    github::GithubError,
    remote::types::{GithubAutolink, GithubBranchProtection, GithubRuleset},
};

/// Value carried by a repository property update.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PropertyValue {
    Bool(bool),
    Str(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// One mutation against the organization. Each variant maps onto exactly
/// one REST or GraphQL call in the remote mutator.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    AddUserToOrg {
        login: String,
    },
    RemoveUserFromOrg {
        login: String,
    },
    CreateTeam {
        name: String,
        slug: String,
        parent_id: Option<u64>,
        members: Vec<String>,
    },
    UpdateTeamAddMember {
        slug: String,
        login: String,
        /// `member` or `maintainer`. The membership endpoint upserts, so
        /// this also downgrades an existing maintainer.
        role: String,
    },
    UpdateTeamRemoveMember {
        slug: String,
        login: String,
    },
    UpdateTeamSetParent {
        slug: String,
        parent_id: Option<u64>,
        parent_slug: Option<String>,
    },
    DeleteTeam {
        slug: String,
    },
    CreateRepository {
        name: String,
        visibility: String,
        default_branch: String,
        bool_properties: BTreeMap<String, bool>,
        writers: Vec<String>,
        readers: Vec<String>,
        fork_from: Option<String>,
    },
    RenameRepository {
        name: String,
        new_name: String,
    },
    UpdateRepositoryUpdateProperty {
        name: String,
        property: String,
        value: PropertyValue,
    },
    UpdateRepositoryAddTeamAccess {
        name: String,
        team_slug: String,
        permission: String,
    },
    UpdateRepositoryUpdateTeamAccess {
        name: String,
        team_slug: String,
        permission: String,
    },
    UpdateRepositoryRemoveTeamAccess {
        name: String,
        team_slug: String,
    },
    UpdateRepositorySetExternalUser {
        name: String,
        login: String,
        /// `pull` or `push`. A permission transition is a single set
        /// call, never a remove + add.
        permission: String,
    },
    UpdateRepositoryRemoveExternalUser {
        name: String,
        login: String,
    },
    DeleteRepository {
        name: String,
    },
    AddRepositoryRuleset {
        repo: String,
        ruleset: GithubRuleset,
    },
    UpdateRepositoryRuleset {
        repo: String,
        ruleset: GithubRuleset,
    },
    DeleteRepositoryRuleset {
        repo: String,
        name: String,
        ruleset_id: Option<u64>,
    },
    AddRepositoryBranchProtection {
        repo: String,
        protection: GithubBranchProtection,
    },
    UpdateRepositoryBranchProtection {
        repo: String,
        protection: GithubBranchProtection,
    },
    DeleteRepositoryBranchProtection {
        repo: String,
        pattern: String,
        id: Option<String>,
    },
    AddRepositoryEnvironment {
        repo: String,
        environment: String,
    },
    DeleteRepositoryEnvironment {
        repo: String,
        environment: String,
    },
    AddRepositoryVariable {
        repo: String,
        name: String,
        value: String,
    },
    UpdateRepositoryVariable {
        repo: String,
        name: String,
        value: String,
    },
    DeleteRepositoryVariable {
        repo: String,
        name: String,
    },
    AddRepositoryEnvironmentVariable {
        repo: String,
        environment: String,
        name: String,
        value: String,
    },
    UpdateRepositoryEnvironmentVariable {
        repo: String,
        environment: String,
        name: String,
        value: String,
    },
    DeleteRepositoryEnvironmentVariable {
        repo: String,
        environment: String,
        name: String,
    },
    AddRepositoryAutolink {
        repo: String,
        autolink: GithubAutolink,
    },
    DeleteRepositoryAutolink {
        repo: String,
        key_prefix: String,
        id: Option<u64>,
    },
    AddRuleset {
        ruleset: GithubRuleset,
    },
    UpdateRuleset {
        ruleset: GithubRuleset,
    },
    DeleteRuleset {
        name: String,
        ruleset_id: Option<u64>,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddUserToOrg { login } => write!(f, "add_user_to_org({login})"),
            Self::RemoveUserFromOrg { login } => write!(f, "remove_user_from_org({login})"),
            Self::CreateTeam { slug, .. } => write!(f, "create_team({slug})"),
            Self::UpdateTeamAddMember { slug, login, role } => {
                write!(f, "update_team_add_member({slug}, {login}, {role})")
            }
            Self::UpdateTeamRemoveMember { slug, login } => {
                write!(f, "update_team_remove_member({slug}, {login})")
            }
            Self::UpdateTeamSetParent { slug, parent_slug, .. } => write!(
                f,
                "update_team_set_parent({slug}, {parent})",
                parent = parent_slug.as_deref().unwrap_or("none")
            ),
            Self::DeleteTeam { slug } => write!(f, "delete_team({slug})"),
            Self::CreateRepository { name, .. } => write!(f, "create_repository({name})"),
            Self::RenameRepository { name, new_name } => {
                write!(f, "rename_repository({name} -> {new_name})")
            }
            Self::UpdateRepositoryUpdateProperty {
                name,
                property,
                value,
            } => write!(f, "update_repository_property({name}, {property}={value})"),
            Self::UpdateRepositoryAddTeamAccess {
                name,
                team_slug,
                permission,
            } => write!(f, "add_team_access({name}, {team_slug}, {permission})"),
            Self::UpdateRepositoryUpdateTeamAccess {
                name,
                team_slug,
                permission,
            } => write!(f, "update_team_access({name}, {team_slug}, {permission})"),
            Self::UpdateRepositoryRemoveTeamAccess { name, team_slug } => {
                write!(f, "remove_team_access({name}, {team_slug})")
            }
            Self::UpdateRepositorySetExternalUser {
                name,
                login,
                permission,
            } => write!(f, "set_external_user({name}, {login}, {permission})"),
            Self::UpdateRepositoryRemoveExternalUser { name, login } => {
                write!(f, "remove_external_user({name}, {login})")
            }
            Self::DeleteRepository { name } => write!(f, "delete_repository({name})"),
            Self::AddRepositoryRuleset { repo, ruleset } => {
                write!(f, "add_repository_ruleset({repo}, {})", ruleset.name)
            }
            Self::UpdateRepositoryRuleset { repo, ruleset } => {
                write!(f, "update_repository_ruleset({repo}, {})", ruleset.name)
            }
            Self::DeleteRepositoryRuleset { repo, name, .. } => {
                write!(f, "delete_repository_ruleset({repo}, {name})")
            }
            Self::AddRepositoryBranchProtection { repo, protection } => write!(
                f,
                "add_branch_protection({repo}, {})",
                protection.protection.pattern
            ),
            Self::UpdateRepositoryBranchProtection { repo, protection } => write!(
                f,
                "update_branch_protection({repo}, {})",
                protection.protection.pattern
            ),
            Self::DeleteRepositoryBranchProtection { repo, pattern, .. } => {
                write!(f, "delete_branch_protection({repo}, {pattern})")
            }
            Self::AddRepositoryEnvironment { repo, environment } => {
                write!(f, "add_environment({repo}, {environment})")
            }
            Self::DeleteRepositoryEnvironment { repo, environment } => {
                write!(f, "delete_environment({repo}, {environment})")
            }
            Self::AddRepositoryVariable { repo, name, .. } => {
                write!(f, "add_repository_variable({repo}, {name})")
            }
            Self::UpdateRepositoryVariable { repo, name, .. } => {
                write!(f, "update_repository_variable({repo}, {name})")
            }
            Self::DeleteRepositoryVariable { repo, name } => {
                write!(f, "delete_repository_variable({repo}, {name})")
            }
            Self::AddRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
                ..
            } => write!(f, "add_environment_variable({repo}, {environment}, {name})"),
            Self::UpdateRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
                ..
            } => write!(
                f,
                "update_environment_variable({repo}, {environment}, {name})"
            ),
            Self::DeleteRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
            } => write!(
                f,
                "delete_environment_variable({repo}, {environment}, {name})"
            ),
            Self::AddRepositoryAutolink { repo, autolink } => {
                write!(f, "add_autolink({repo}, {})", autolink.key_prefix)
            }
            Self::DeleteRepositoryAutolink {
                repo, key_prefix, ..
            } => write!(f, "delete_autolink({repo}, {key_prefix})"),
            Self::AddRuleset { ruleset } => write!(f, "add_ruleset({})", ruleset.name),
            Self::UpdateRuleset { ruleset } => write!(f, "update_ruleset({})", ruleset.name),
            Self::DeleteRuleset { name, .. } => write!(f, "delete_ruleset({name})"),
        }
    }
}

impl Command {
    /// Whether the command destroys a remote entity.
    pub(crate) fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::RemoveUserFromOrg { .. }
                | Self::DeleteTeam { .. }
                | Self::DeleteRepository { .. }
                | Self::DeleteRuleset { .. }
        )
    }
}

/// Dispatch target for committed commands. The production implementation
/// issues GitHub calls and refreshes the snapshot caches; tests record.
#[async_trait]
pub(crate) trait Mutator: Send {
    async fn apply(&mut self, command: &Command) -> Result<(), GithubError>;
}

/// Outcome of a successful (non-ceiling) commit.
#[derive(Debug, Default)]
pub(crate) struct CommitReport {
    pub(crate) applied: usize,
    pub(crate) errors: Vec<MutationError>,
}

/// The command queue. `begin` clears it, reconciliator callbacks append,
/// `commit` gates on the ceiling and dispatches in enqueue order.
pub(crate) struct BatchExecutor {
    queue: Vec<Command>,
    max_changesets: usize,
    /// Operator override: ignore the ceiling for this run.
    unlimited: bool,
    dry_run: bool,
}

impl BatchExecutor {
    pub(crate) fn new(max_changesets: usize, unlimited: bool) -> Self {
        Self {
            queue: Vec::new(),
            max_changesets,
            unlimited,
            dry_run: false,
        }
    }

    pub(crate) fn begin(&mut self, dry_run: bool) {
        self.queue.clear();
        self.dry_run = dry_run;
    }

    pub(crate) fn add(&mut self, command: Command) {
        if command.is_destructive() {
            tracing::warn!("queueing destructive {command}");
        } else {
            tracing::debug!("queueing {command}");
        }
        self.queue.push(command);
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn commands(&self) -> &[Command] {
        &self.queue
    }

    /// Dispatches the queue through the mutator. Individual mutation
    /// failures are collected, not fatal; exceeding the ceiling refuses
    /// the whole batch before anything is dispatched.
    pub(crate) async fn commit(
        &mut self,
        mutator: &mut dyn Mutator,
    ) -> Result<CommitReport, CycleError> {
        if self.queue.len() > self.max_changesets && !self.unlimited {
            let queued = self.queue.len();
            self.queue.clear();
            return Err(CycleError::ChangesetCeiling {
                queued,
                limit: self.max_changesets,
            });
        }

        let mut report = CommitReport::default();
        for command in self.queue.drain(..) {
            if self.dry_run {
                tracing::info!("dry-run: {command}");
                continue;
            }
            tracing::info!("applying {command}");
            match mutator.apply(&command).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!("mutation failed: {command}: {e}");
                    report.errors.push(MutationError {
                        command: command.to_string(),
                        source: e,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Drops the queue. There is no compensating action: atomicity is
    /// coarse (all or refuse).
    pub(crate) fn rollback(&mut self) {
        if !self.queue.is_empty() {
            tracing::warn!("dropping {count} queued command(s)", count = self.queue.len());
        }
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) struct RecordingMutator {
        pub(crate) applied: Vec<String>,
        pub(crate) fail_on: Option<String>,
    }

    #[async_trait]
    impl Mutator for RecordingMutator {
        async fn apply(&mut self, command: &Command) -> Result<(), GithubError> {
            let rendered = command.to_string();
            if self.fail_on.as_deref() == Some(rendered.as_str()) {
                return Err(GithubError::GraphQl("injected".into()));
            }
            self.applied.push(rendered);
            Ok(())
        }
    }

    fn user_add(login: &str) -> Command {
        Command::AddUserToOrg {
            login: login.into(),
        }
    }

    #[tokio::test]
    async fn commit_dispatches_in_enqueue_order() {
        let mut executor = BatchExecutor::new(50, false);
        executor.begin(false);
        executor.add(user_add("alice"));
        executor.add(user_add("bob"));

        let mut mutator = RecordingMutator {
            applied: vec![],
            fail_on: None,
        };
        let report = executor.commit(&mut mutator).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(
            mutator.applied,
            vec!["add_user_to_org(alice)", "add_user_to_org(bob)"]
        );
        assert_eq!(executor.len(), 0);
    }

    #[tokio::test]
    async fn ceiling_refuses_the_whole_batch() {
        let mut executor = BatchExecutor::new(2, false);
        executor.begin(false);
        for login in ["a", "b", "c"] {
            executor.add(user_add(login));
        }

        let mut mutator = RecordingMutator {
            applied: vec![],
            fail_on: None,
        };
        let err = executor.commit(&mut mutator).await.unwrap_err();
        assert!(matches!(
            err,
            CycleError::ChangesetCeiling { queued: 3, limit: 2 }
        ));
        assert!(mutator.applied.is_empty());
    }

    #[tokio::test]
    async fn ceiling_boundary_is_exclusive() {
        // Exactly max_changesets commands commit fine.
        let mut executor = BatchExecutor::new(2, false);
        executor.begin(false);
        executor.add(user_add("a"));
        executor.add(user_add("b"));
        let mut mutator = RecordingMutator {
            applied: vec![],
            fail_on: None,
        };
        assert!(executor.commit(&mut mutator).await.is_ok());
    }

    #[tokio::test]
    async fn override_lifts_the_ceiling() {
        let mut executor = BatchExecutor::new(1, true);
        executor.begin(false);
        executor.add(user_add("a"));
        executor.add(user_add("b"));
        let mut mutator = RecordingMutator {
            applied: vec![],
            fail_on: None,
        };
        let report = executor.commit(&mut mutator).await.unwrap();
        assert_eq!(report.applied, 2);
    }

    #[tokio::test]
    async fn mutation_errors_do_not_stop_the_batch() {
        let mut executor = BatchExecutor::new(50, false);
        executor.begin(false);
        for login in ["a", "b", "c"] {
            executor.add(user_add(login));
        }

        let mut mutator = RecordingMutator {
            applied: vec![],
            fail_on: Some("add_user_to_org(b)".into()),
        };
        let report = executor.commit(&mut mutator).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            mutator.applied,
            vec!["add_user_to_org(a)", "add_user_to_org(c)"]
        );
    }

    #[tokio::test]
    async fn dry_run_dispatches_nothing() {
        let mut executor = BatchExecutor::new(50, false);
        executor.begin(true);
        executor.add(user_add("a"));
        let mut mutator = RecordingMutator {
            applied: vec![],
            fail_on: None,
        };
        let report = executor.commit(&mut mutator).await.unwrap();
        assert_eq!(report.applied, 0);
        assert!(mutator.applied.is_empty());
    }

    #[test]
    fn rollback_drops_the_queue() {
        let mut executor = BatchExecutor::new(50, false);
        executor.begin(false);
        executor.add(user_add("a"));
        executor.rollback();
        assert_eq!(executor.len(), 0);
    }
}

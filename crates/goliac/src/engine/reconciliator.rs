//! The reconciliator: diffs the desired snapshot against the mutable
//! shadow in four ordered phases (users, teams, repositories,
//! organization rulesets) and turns every difference into a queued
//! mutation command.
//!
//! Every emitted command is applied to the shadow before it is queued,
//! so later decisions in the same cycle observe earlier ones. Destructive
//! operations are policy-gated: a blocked removal classifies the entity
//! as unmanaged instead.

use std::collections::{BTreeMap, BTreeSet};

use tracing::instrument;

use crate::{
    config::RepoConfig,
    engine::{
        compare::{DiffEvent, compare},
        desired::{DesiredRepo, DesiredState},
        executor::{BatchExecutor, Command, PropertyValue},
    },
    github::GithubError,
    remote::shadow::{RemoteShadow, ShadowRepository},
};

/// Entities present on the platform but excluded from removal by the
/// destructive-operations policy. Surfaced for operator attention.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct UnmanagedResources {
    pub(crate) users: BTreeSet<String>,
    pub(crate) teams: BTreeSet<String>,
    pub(crate) externally_managed_teams: BTreeSet<String>,
    pub(crate) repositories: BTreeSet<String>,
    pub(crate) rulesets: BTreeSet<String>,
}

/// What one reconciliation cycle hands back to the orchestrator.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReconcileOutcome {
    /// Repositories archived this cycle; the committer persists their
    /// `archived/{name}.yaml` stubs back to the teams repository.
    pub(crate) repos_to_archive: BTreeSet<String>,
    /// Rename pairs (old name -> new name) for the committer's file moves.
    pub(crate) renamed: BTreeMap<String, String>,
    pub(crate) unmanaged: UnmanagedResources,
}

pub(crate) struct Reconciliator<'a> {
    config: &'a RepoConfig,
    executor: &'a mut BatchExecutor,
}

/// Applies a planned command to the shadow, then queues it. The shadow
/// is updated strictly before the executor sees the command.
async fn emit(
    executor: &mut BatchExecutor,
    shadow: &mut RemoteShadow,
    command: Command,
) -> Result<(), GithubError> {
    shadow.apply(&command).await?;
    executor.add(command);
    Ok(())
}

impl<'a> Reconciliator<'a> {
    pub(crate) fn new(config: &'a RepoConfig, executor: &'a mut BatchExecutor) -> Self {
        Self { config, executor }
    }

    /// Runs the four phases in order. A failure aborts the cycle; the
    /// caller rolls the executor back.
    #[instrument(skip_all)]
    pub(crate) async fn reconcile(
        &mut self,
        desired: &mut DesiredState,
        shadow: &mut RemoteShadow,
    ) -> Result<ReconcileOutcome, GithubError> {
        let mut outcome = ReconcileOutcome::default();
        self.reconcile_users(desired, shadow, &mut outcome).await?;
        self.reconcile_teams(desired, shadow, &mut outcome).await?;
        self.reconcile_repositories(desired, shadow, &mut outcome)
            .await?;
        self.reconcile_rulesets(desired, shadow, &mut outcome)
            .await?;
        Ok(outcome)
    }

    async fn reconcile_users(
        &mut self,
        desired: &DesiredState,
        shadow: &mut RemoteShadow,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), GithubError> {
        let destructive = self.config.destructive_operations.users;
        let mut plan = Vec::new();
        compare::<_, GithubError>(
            &desired.users,
            &shadow.users,
            |_, _| Ok(true),
            |event| {
                match event {
                    DiffEvent::Removed(login, _) => {
                        if destructive {
                            plan.push(Command::RemoveUserFromOrg {
                                login: login.to_string(),
                            });
                        } else {
                            outcome.unmanaged.users.insert(login.to_string());
                        }
                    }
                    DiffEvent::Changed(..) => {}
                    DiffEvent::Added(login, _) => plan.push(Command::AddUserToOrg {
                        login: login.to_string(),
                    }),
                }
                Ok(())
            },
        )?;

        for command in plan {
            emit(self.executor, shadow, command).await?;
        }
        Ok(())
    }

    async fn reconcile_teams(
        &mut self,
        desired: &DesiredState,
        shadow: &mut RemoteShadow,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), GithubError> {
        let destructive = self.config.destructive_operations.teams;

        for (slug, team) in &desired.teams {
            if team.externally_managed {
                outcome
                    .unmanaged
                    .externally_managed_teams
                    .insert(slug.clone());
            }
        }

        let mut plan = Vec::new();
        {
            let shadow_teams = &shadow.teams;
            compare::<_, GithubError>(
                &desired.teams,
                shadow_teams,
                |d, s| {
                    // Externally managed membership is authoritative on
                    // the platform; only the parent is compared.
                    if d.externally_managed {
                        return Ok(d.parent_slug == s.parent_slug);
                    }
                    Ok(d.members == s.members
                        && d.maintainers == s.maintainers
                        && d.parent_slug == s.parent_slug)
                },
                |event| {
                    match event {
                        DiffEvent::Removed(slug, _) => {
                            if destructive {
                                plan.push(Command::DeleteTeam {
                                    slug: slug.to_string(),
                                });
                            } else {
                                outcome.unmanaged.teams.insert(slug.to_string());
                            }
                        }
                        DiffEvent::Changed(slug, d, s) => {
                            if !d.externally_managed {
                                // Pinned ordering: downgrade maintainers,
                                // then the membership delta, then the
                                // parent change.
                                for login in &s.maintainers {
                                    if d.members.contains(login) {
                                        plan.push(Command::UpdateTeamAddMember {
                                            slug: slug.to_string(),
                                            login: login.clone(),
                                            role: "member".into(),
                                        });
                                    }
                                }
                                let observed_logins = s.logins();
                                for login in observed_logins.difference(&d.members) {
                                    plan.push(Command::UpdateTeamRemoveMember {
                                        slug: slug.to_string(),
                                        login: login.clone(),
                                    });
                                }
                                for login in d.members.difference(&observed_logins) {
                                    plan.push(Command::UpdateTeamAddMember {
                                        slug: slug.to_string(),
                                        login: login.clone(),
                                        role: "member".into(),
                                    });
                                }
                            }
                            if d.parent_slug != s.parent_slug {
                                let parent_id = d
                                    .parent_slug
                                    .as_ref()
                                    .and_then(|parent| shadow_teams.get(parent))
                                    .and_then(|parent| parent.id);
                                plan.push(Command::UpdateTeamSetParent {
                                    slug: slug.to_string(),
                                    parent_id,
                                    parent_slug: d.parent_slug.clone(),
                                });
                            }
                        }
                        DiffEvent::Added(slug, d) => {
                            // A parent not yet known remotely is omitted;
                            // the next cycle attaches it.
                            let parent_id = d
                                .parent_slug
                                .as_ref()
                                .and_then(|parent| shadow_teams.get(parent))
                                .and_then(|parent| parent.id);
                            plan.push(Command::CreateTeam {
                                name: d.name.clone(),
                                slug: slug.to_string(),
                                parent_id,
                                members: d.members.iter().cloned().collect(),
                            });
                        }
                    }
                    Ok(())
                },
            )?;
        }

        for command in plan {
            emit(self.executor, shadow, command).await?;
        }
        Ok(())
    }

    async fn reconcile_repositories(
        &mut self,
        desired: &mut DesiredState,
        shadow: &mut RemoteShadow,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), GithubError> {
        // Stage 1: renames, before anything can create the target name.
        let renames: Vec<(String, String)> = desired
            .repositories
            .iter()
            .filter_map(|(name, repo)| repo.rename_to.clone().map(|to| (name.clone(), to)))
            .collect();
        for (old, new) in renames {
            if shadow.repositories.contains_key(&old) && !shadow.repositories.contains_key(&new) {
                emit(
                    self.executor,
                    shadow,
                    Command::RenameRepository {
                        name: old.clone(),
                        new_name: new.clone(),
                    },
                )
                .await?;
            }
            if let Some(mut repo) = desired.repositories.remove(&old) {
                repo.name = new.clone();
                repo.rename_to = None;
                desired.repositories.insert(new.clone(), repo);
            }
            outcome.renamed.insert(old, new);
        }

        // Stage 2: removals and changes, observed side first.
        let observed_names: Vec<String> = shadow.repositories.keys().cloned().collect();
        for name in &observed_names {
            let Some(observed) = shadow.repositories.get(name).cloned() else {
                continue;
            };
            match desired.repositories.get(name) {
                Some(d) => {
                    let d = d.clone();
                    self.repo_changed(name, &d, &observed, shadow).await?;
                }
                None => {
                    if self.config.archive_on_delete
                        && self.config.destructive_operations.repositories
                    {
                        if !observed.archived() {
                            emit(
                                self.executor,
                                shadow,
                                Command::UpdateRepositoryUpdateProperty {
                                    name: name.clone(),
                                    property: "archived".into(),
                                    value: PropertyValue::Bool(true),
                                },
                            )
                            .await?;
                        }
                        outcome.repos_to_archive.insert(name.clone());
                    } else if self.config.destructive_operations.repositories {
                        emit(
                            self.executor,
                            shadow,
                            Command::DeleteRepository { name: name.clone() },
                        )
                        .await?;
                    } else {
                        outcome.unmanaged.repositories.insert(name.clone());
                    }
                }
            }
        }

        // Additions last.
        let added_names: Vec<String> = desired
            .repositories
            .keys()
            .filter(|name| {
                !shadow.repositories.contains_key(*name)
                    || outcome.repos_to_archive.contains(*name)
            })
            .cloned()
            .collect();
        for name in added_names {
            let d = desired.repositories[&name].clone();

            // Archived earlier this cycle, then re-declared: cancel the
            // archive and diff in place instead.
            if outcome.repos_to_archive.remove(&name)
                && let Some(observed) = shadow.repositories.get(&name).cloned()
            {
                self.repo_changed(&name, &d, &observed, shadow).await?;
                continue;
            }

            // Repositories are created live; an archived declaration is
            // applied as a follow-up property update.
            let mut create_properties = d.bool_properties.clone();
            create_properties.insert("archived".into(), false);
            emit(
                self.executor,
                shadow,
                Command::CreateRepository {
                    name: name.clone(),
                    visibility: d.visibility.clone(),
                    default_branch: d.default_branch.clone(),
                    bool_properties: create_properties,
                    writers: d.writers.iter().cloned().collect(),
                    readers: d.readers.iter().cloned().collect(),
                    fork_from: d.fork_from.clone(),
                },
            )
            .await?;

            // The fresh shadow entry has no sub-resources yet; diffing
            // against it attaches everything else.
            if let Some(observed) = shadow.repositories.get(&name).cloned() {
                self.repo_changed(&name, &d, &observed, shadow).await?;
            }
        }

        Ok(())
    }

    /// Emits the targeted mutations for one repository present on both
    /// sides, in the fixed order: properties, team access, external
    /// users, environment variables, action variables, autolinks,
    /// rulesets, branch protections.
    async fn repo_changed(
        &mut self,
        name: &str,
        d: &DesiredRepo,
        observed: &ShadowRepository,
        shadow: &mut RemoteShadow,
    ) -> Result<(), GithubError> {
        let mut plan: Vec<Command> = Vec::new();

        for (property, value) in &d.bool_properties {
            if observed.bool_properties.get(property) != Some(value) {
                plan.push(Command::UpdateRepositoryUpdateProperty {
                    name: name.to_string(),
                    property: property.clone(),
                    value: PropertyValue::Bool(*value),
                });
            }
        }

        // Fork visibility cannot be changed; diverging visibility on a
        // fork is accepted silently.
        if d.visibility != observed.visibility && !observed.is_fork {
            plan.push(Command::UpdateRepositoryUpdateProperty {
                name: name.to_string(),
                property: "visibility".into(),
                value: PropertyValue::Str(d.visibility.clone()),
            });
        }

        if d.default_branch != observed.default_branch {
            plan.push(Command::UpdateRepositoryUpdateProperty {
                name: name.to_string(),
                property: "default_branch".into(),
                value: PropertyValue::Str(d.default_branch.clone()),
            });
        }

        // Team accesses. Writers win when a team is listed on both sides.
        let mut desired_access: BTreeMap<String, String> = BTreeMap::new();
        for reader in &d.readers {
            desired_access.insert(reader.clone(), "pull".into());
        }
        for writer in &d.writers {
            desired_access.insert(writer.clone(), "push".into());
        }
        let observed_access: BTreeMap<String, String> = shadow
            .team_repos
            .iter()
            .filter_map(|(slug, repos)| {
                repos.get(name).map(|permission| (slug.clone(), permission.clone()))
            })
            .collect();
        compare::<_, GithubError>(
            &desired_access,
            &observed_access,
            |a, b| Ok(a == b),
            |event| {
                match event {
                    DiffEvent::Removed(slug, _) => {
                        plan.push(Command::UpdateRepositoryRemoveTeamAccess {
                            name: name.to_string(),
                            team_slug: slug.to_string(),
                        });
                    }
                    DiffEvent::Changed(slug, permission, _) => {
                        plan.push(Command::UpdateRepositoryUpdateTeamAccess {
                            name: name.to_string(),
                            team_slug: slug.to_string(),
                            permission: permission.clone(),
                        });
                    }
                    DiffEvent::Added(slug, permission) => {
                        plan.push(Command::UpdateRepositoryAddTeamAccess {
                            name: name.to_string(),
                            team_slug: slug.to_string(),
                            permission: permission.clone(),
                        });
                    }
                }
                Ok(())
            },
        )?;

        // External users. A permission transition is one set call.
        compare::<_, GithubError>(
            &d.external_users,
            &observed.external_users,
            |a, b| Ok(a == b),
            |event| {
                match event {
                    DiffEvent::Removed(login, _) => {
                        plan.push(Command::UpdateRepositoryRemoveExternalUser {
                            name: name.to_string(),
                            login: login.to_string(),
                        });
                    }
                    DiffEvent::Changed(login, permission, _)
                    | DiffEvent::Added(login, permission) => {
                        plan.push(Command::UpdateRepositorySetExternalUser {
                            name: name.to_string(),
                            login: login.to_string(),
                            permission: permission.clone(),
                        });
                    }
                }
                Ok(())
            },
        )?;

        // Environments and their variables (deferred fetch).
        let observed_environments = observed.environments.get().await?;
        compare::<_, GithubError>(
            &d.environments,
            &observed_environments,
            |a, b| Ok(a.variables == b.variables),
            |event| {
                match event {
                    DiffEvent::Removed(environment, _) => {
                        plan.push(Command::DeleteRepositoryEnvironment {
                            repo: name.to_string(),
                            environment: environment.to_string(),
                        });
                    }
                    DiffEvent::Changed(environment, d_env, s_env) => {
                        compare::<_, GithubError>(
                            &d_env.variables,
                            &s_env.variables,
                            |a, b| Ok(a == b),
                            |var_event| {
                                plan.push(environment_variable_command(
                                    name,
                                    environment,
                                    var_event,
                                ));
                                Ok(())
                            },
                        )?;
                    }
                    DiffEvent::Added(environment, d_env) => {
                        plan.push(Command::AddRepositoryEnvironment {
                            repo: name.to_string(),
                            environment: environment.to_string(),
                        });
                        for (variable, value) in &d_env.variables {
                            plan.push(Command::AddRepositoryEnvironmentVariable {
                                repo: name.to_string(),
                                environment: environment.to_string(),
                                name: variable.clone(),
                                value: value.clone(),
                            });
                        }
                    }
                }
                Ok(())
            },
        )?;

        // Action variables (deferred fetch, order-insensitive deep map
        // equality through the keyed diff).
        let observed_variables = observed.variables.get().await?;
        compare::<_, GithubError>(
            &d.variables,
            &observed_variables,
            |a, b| Ok(a == b),
            |event| {
                match event {
                    DiffEvent::Removed(variable, _) => {
                        plan.push(Command::DeleteRepositoryVariable {
                            repo: name.to_string(),
                            name: variable.to_string(),
                        });
                    }
                    DiffEvent::Changed(variable, value, _) => {
                        plan.push(Command::UpdateRepositoryVariable {
                            repo: name.to_string(),
                            name: variable.to_string(),
                            value: value.clone(),
                        });
                    }
                    DiffEvent::Added(variable, value) => {
                        plan.push(Command::AddRepositoryVariable {
                            repo: name.to_string(),
                            name: variable.to_string(),
                            value: value.clone(),
                        });
                    }
                }
                Ok(())
            },
        )?;

        // Autolinks are managed only when the declaration carries them.
        if let Some(desired_autolinks) = &d.autolinks {
            let observed_autolinks = observed.autolinks.get().await?;
            compare::<_, GithubError>(
                desired_autolinks,
                &observed_autolinks,
                |a, b| Ok(a.same_as(b)),
                |event| {
                    match event {
                        DiffEvent::Removed(key_prefix, link) => {
                            plan.push(Command::DeleteRepositoryAutolink {
                                repo: name.to_string(),
                                key_prefix: key_prefix.to_string(),
                                id: link.id,
                            });
                        }
                        // No update endpoint: replace.
                        DiffEvent::Changed(key_prefix, d_link, s_link) => {
                            plan.push(Command::DeleteRepositoryAutolink {
                                repo: name.to_string(),
                                key_prefix: key_prefix.to_string(),
                                id: s_link.id,
                            });
                            plan.push(Command::AddRepositoryAutolink {
                                repo: name.to_string(),
                                autolink: d_link.clone(),
                            });
                        }
                        DiffEvent::Added(_, link) => {
                            plan.push(Command::AddRepositoryAutolink {
                                repo: name.to_string(),
                                autolink: link.clone(),
                            });
                        }
                    }
                    Ok(())
                },
            )?;
        }

        // Repository rulesets.
        compare::<_, GithubError>(
            &d.rulesets,
            &observed.rulesets,
            |a, b| Ok(a.same_as(b)),
            |event| {
                match event {
                    DiffEvent::Removed(ruleset_name, observed_ruleset) => {
                        plan.push(Command::DeleteRepositoryRuleset {
                            repo: name.to_string(),
                            name: ruleset_name.to_string(),
                            ruleset_id: observed_ruleset.id,
                        });
                    }
                    DiffEvent::Changed(_, d_ruleset, s_ruleset) => {
                        let mut ruleset = d_ruleset.clone();
                        ruleset.id = s_ruleset.id;
                        plan.push(Command::UpdateRepositoryRuleset {
                            repo: name.to_string(),
                            ruleset,
                        });
                    }
                    DiffEvent::Added(_, d_ruleset) => {
                        plan.push(Command::AddRepositoryRuleset {
                            repo: name.to_string(),
                            ruleset: d_ruleset.clone(),
                        });
                    }
                }
                Ok(())
            },
        )?;

        // Branch protections.
        compare::<_, GithubError>(
            &d.branch_protections,
            &observed.branch_protections,
            |a, b| Ok(a.same_as(b)),
            |event| {
                match event {
                    DiffEvent::Removed(pattern, observed_protection) => {
                        plan.push(Command::DeleteRepositoryBranchProtection {
                            repo: name.to_string(),
                            pattern: pattern.to_string(),
                            id: observed_protection.id.clone(),
                        });
                    }
                    DiffEvent::Changed(_, d_protection, s_protection) => {
                        let mut protection = d_protection.clone();
                        protection.id = s_protection.id.clone();
                        plan.push(Command::UpdateRepositoryBranchProtection {
                            repo: name.to_string(),
                            protection,
                        });
                    }
                    DiffEvent::Added(_, d_protection) => {
                        plan.push(Command::AddRepositoryBranchProtection {
                            repo: name.to_string(),
                            protection: d_protection.clone(),
                        });
                    }
                }
                Ok(())
            },
        )?;

        for command in plan {
            emit(self.executor, shadow, command).await?;
        }
        Ok(())
    }

    async fn reconcile_rulesets(
        &mut self,
        desired: &DesiredState,
        shadow: &mut RemoteShadow,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), GithubError> {
        // Organization rulesets are enterprise-only.
        if !shadow.is_enterprise {
            return Ok(());
        }

        let destructive = self.config.destructive_operations.rulesets;
        let mut plan = Vec::new();
        compare::<_, GithubError>(
            &desired.rulesets,
            &shadow.rulesets,
            |a, b| Ok(a.same_as(b)),
            |event| {
                match event {
                    DiffEvent::Removed(name, observed) => {
                        if destructive {
                            plan.push(Command::DeleteRuleset {
                                name: name.to_string(),
                                ruleset_id: observed.id,
                            });
                        } else {
                            outcome.unmanaged.rulesets.insert(name.to_string());
                        }
                    }
                    DiffEvent::Changed(_, d, s) => {
                        let mut ruleset = d.clone();
                        ruleset.id = s.id;
                        plan.push(Command::UpdateRuleset { ruleset });
                    }
                    DiffEvent::Added(_, d) => {
                        plan.push(Command::AddRuleset { ruleset: d.clone() });
                    }
                }
                Ok(())
            },
        )?;

        for command in plan {
            emit(self.executor, shadow, command).await?;
        }
        Ok(())
    }
}

fn environment_variable_command(
    repo: &str,
    environment: &str,
    event: DiffEvent<'_, String>,
) -> Command {
    match event {
        DiffEvent::Removed(name, _) => Command::DeleteRepositoryEnvironmentVariable {
            repo: repo.to_string(),
            environment: environment.to_string(),
            name: name.to_string(),
        },
        DiffEvent::Changed(name, value, _) => Command::UpdateRepositoryEnvironmentVariable {
            repo: repo.to_string(),
            environment: environment.to_string(),
            name: name.to_string(),
            value: value.clone(),
        },
        DiffEvent::Added(name, value) => Command::AddRepositoryEnvironmentVariable {
            repo: repo.to_string(),
            environment: environment.to_string(),
            name: name.to_string(),
            value: value.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::DestructiveOperations,
        remote::{
            shadow::{MutableLazyMap, ShadowRepository},
            types::{GithubRuleset, GithubTeam, RuleParameters},
        },
    };

    fn fresh_executor() -> BatchExecutor {
        let mut executor = BatchExecutor::new(50, false);
        executor.begin(false);
        executor
    }

    fn rendered(executor: &BatchExecutor) -> Vec<String> {
        executor.commands().iter().map(|c| c.to_string()).collect()
    }

    fn desired_team(slug: &str, members: &[&str]) -> GithubTeam {
        GithubTeam {
            name: slug.to_string(),
            slug: slug.to_string(),
            id: None,
            members: members.iter().map(|m| m.to_string()).collect(),
            maintainers: BTreeSet::new(),
            parent_slug: None,
            externally_managed: false,
        }
    }

    fn observed_team(slug: &str, id: u64, members: &[&str]) -> GithubTeam {
        GithubTeam {
            id: Some(id),
            ..desired_team(slug, members)
        }
    }

    fn observed_repo(name: &str) -> ShadowRepository {
        ShadowRepository {
            name: name.to_string(),
            id: Some(1),
            ref_id: Some(format!("R_{name}")),
            visibility: "private".into(),
            default_branch: "main".into(),
            is_fork: false,
            bool_properties: BTreeMap::from([
                ("allow_auto_merge".to_string(), false),
                ("delete_branch_on_merge".to_string(), false),
                ("allow_update_branch".to_string(), false),
                ("archived".to_string(), false),
            ]),
            external_users: BTreeMap::new(),
            rulesets: BTreeMap::new(),
            branch_protections: BTreeMap::new(),
            environments: MutableLazyMap::ready(BTreeMap::new()),
            variables: MutableLazyMap::ready(BTreeMap::new()),
            autolinks: MutableLazyMap::ready(BTreeMap::new()),
        }
    }

    fn desired_repo(name: &str, writer: &str) -> DesiredRepo {
        DesiredRepo {
            name: name.to_string(),
            visibility: "private".into(),
            default_branch: "main".into(),
            bool_properties: BTreeMap::from([
                ("allow_auto_merge".to_string(), false),
                ("delete_branch_on_merge".to_string(), false),
                ("allow_update_branch".to_string(), false),
                ("archived".to_string(), false),
            ]),
            writers: BTreeSet::from([writer.to_string()]),
            readers: BTreeSet::new(),
            ..DesiredRepo::default()
        }
    }

    async fn run(
        config: &RepoConfig,
        executor: &mut BatchExecutor,
        desired: &mut DesiredState,
        shadow: &mut RemoteShadow,
    ) -> ReconcileOutcome {
        Reconciliator::new(config, executor)
            .reconcile(desired, shadow)
            .await
            .expect("reconcile failed")
    }

    #[tokio::test]
    async fn green_field_team_creation() {
        // One new team with owners [alice] and members [bob]: the team and
        // its owners shadow are both created, parentless.
        let config = RepoConfig::default();
        let mut executor = fresh_executor();
        let mut desired = DesiredState::default();
        desired
            .teams
            .insert("new".into(), desired_team("new", &["alice", "bob"]));
        desired
            .teams
            .insert("new-owners".into(), desired_team("new-owners", &["alice"]));
        let mut shadow = RemoteShadow::default();

        run(&config, &mut executor, &mut desired, &mut shadow).await;

        let created: Vec<_> = executor
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::CreateTeam {
                    slug,
                    parent_id,
                    members,
                    ..
                } => Some((slug.clone(), *parent_id, members.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            created,
            vec![
                ("new".to_string(), None, vec!["alice".to_string(), "bob".to_string()]),
                ("new-owners".to_string(), None, vec!["alice".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn archive_on_delete() {
        let config = RepoConfig {
            destructive_operations: DestructiveOperations {
                repositories: true,
                ..Default::default()
            },
            ..RepoConfig::default()
        };
        let mut executor = fresh_executor();
        let mut desired = DesiredState::default();
        let mut shadow = RemoteShadow::default();
        shadow.repositories.insert("foo".into(), observed_repo("foo"));

        let outcome = run(&config, &mut executor, &mut desired, &mut shadow).await;

        assert_eq!(
            rendered(&executor),
            vec!["update_repository_property(foo, archived=true)"]
        );
        assert!(outcome.repos_to_archive.contains("foo"));
        assert!(shadow.repositories["foo"].archived());
    }

    #[tokio::test]
    async fn delete_without_archive_on_delete() {
        let config = RepoConfig {
            archive_on_delete: false,
            destructive_operations: DestructiveOperations {
                repositories: true,
                ..Default::default()
            },
            ..RepoConfig::default()
        };
        let mut executor = fresh_executor();
        let mut desired = DesiredState::default();
        let mut shadow = RemoteShadow::default();
        shadow.repositories.insert("foo".into(), observed_repo("foo"));

        let outcome = run(&config, &mut executor, &mut desired, &mut shadow).await;

        assert_eq!(rendered(&executor), vec!["delete_repository(foo)"]);
        assert!(outcome.repos_to_archive.is_empty());
        assert!(!shadow.repositories.contains_key("foo"));
    }

    #[tokio::test]
    async fn rename_emits_once_and_settles() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        let mut repo5 = desired_repo("repo5", "sre");
        repo5.rename_to = Some("repo6".into());
        desired.repositories.insert("repo5".into(), repo5);

        let mut shadow = RemoteShadow::default();
        shadow.repositories.insert("repo5".into(), observed_repo("repo5"));
        shadow
            .team_repos
            .entry("sre".into())
            .or_default()
            .insert("repo5".into(), "push".into());

        let outcome = run(&config, &mut executor, &mut desired, &mut shadow).await;

        assert_eq!(rendered(&executor), vec!["rename_repository(repo5 -> repo6)"]);
        assert_eq!(
            outcome.renamed,
            BTreeMap::from([("repo5".to_string(), "repo6".to_string())])
        );
        assert!(desired.repositories.contains_key("repo6"));

        // Next cycle: the declaration is already named repo6, no rename
        // pending. Nothing to do.
        let mut executor = fresh_executor();
        let mut settled = DesiredState::default();
        settled
            .repositories
            .insert("repo6".into(), desired_repo("repo6", "sre"));
        run(&config, &mut executor, &mut settled, &mut shadow).await;
        assert_eq!(rendered(&executor), Vec::<String>::new());
    }

    #[tokio::test]
    async fn externally_managed_membership_drift_is_ignored() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        let mut platform = desired_team("platform", &[]);
        platform.externally_managed = true;
        desired.teams.insert("platform".into(), platform);
        desired.teams.insert(
            "platform-owners".into(),
            desired_team("platform-owners", &["alice"]),
        );

        let mut shadow = RemoteShadow::default();
        shadow
            .teams
            .insert("platform".into(), observed_team("platform", 10, &["x", "y"]));
        shadow.teams.insert(
            "platform-owners".into(),
            observed_team("platform-owners", 11, &["alice"]),
        );

        let outcome = run(&config, &mut executor, &mut desired, &mut shadow).await;

        assert_eq!(rendered(&executor), Vec::<String>::new());
        assert!(
            outcome
                .unmanaged
                .externally_managed_teams
                .contains("platform")
        );
    }

    #[tokio::test]
    async fn ruleset_enforcement_update_is_a_single_update() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        desired.rulesets.insert(
            "rs1".into(),
            GithubRuleset {
                name: "rs1".into(),
                enforcement: "evaluate".into(),
                rules: BTreeMap::from([(
                    "required_signatures".to_string(),
                    RuleParameters::default(),
                )]),
                ..Default::default()
            },
        );

        let mut shadow = RemoteShadow {
            is_enterprise: true,
            ..Default::default()
        };
        shadow.rulesets.insert(
            "rs1".into(),
            GithubRuleset {
                name: "rs1".into(),
                id: Some(7),
                enforcement: "active".into(),
                rules: BTreeMap::from([(
                    "required_signatures".to_string(),
                    RuleParameters::default(),
                )]),
                ..Default::default()
            },
        );

        run(&config, &mut executor, &mut desired, &mut shadow).await;

        let updates: Vec<_> = executor
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::UpdateRuleset { ruleset } => {
                    Some((ruleset.name.clone(), ruleset.enforcement.clone(), ruleset.id))
                }
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![("rs1".to_string(), "evaluate".to_string(), Some(7))]);
        assert_eq!(executor.len(), 1);
    }

    #[tokio::test]
    async fn org_rulesets_are_skipped_off_enterprise() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();
        let mut desired = DesiredState::default();
        desired.rulesets.insert(
            "rs1".into(),
            GithubRuleset {
                name: "rs1".into(),
                ..Default::default()
            },
        );
        let mut shadow = RemoteShadow::default();

        run(&config, &mut executor, &mut desired, &mut shadow).await;
        assert_eq!(rendered(&executor), Vec::<String>::new());
    }

    #[tokio::test]
    async fn destructive_off_means_zero_deletes() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        let mut shadow = RemoteShadow {
            is_enterprise: true,
            ..Default::default()
        };
        shadow.users.insert("ghost".into(), "MEMBER".into());
        shadow
            .teams
            .insert("old".into(), observed_team("old", 1, &["ghost"]));
        shadow
            .repositories
            .insert("legacy".into(), observed_repo("legacy"));
        shadow.rulesets.insert(
            "rs".into(),
            GithubRuleset {
                name: "rs".into(),
                id: Some(3),
                ..Default::default()
            },
        );

        let outcome = run(&config, &mut executor, &mut desired, &mut shadow).await;

        assert_eq!(rendered(&executor), Vec::<String>::new());
        assert!(outcome.unmanaged.users.contains("ghost"));
        assert!(outcome.unmanaged.teams.contains("old"));
        assert!(outcome.unmanaged.repositories.contains("legacy"));
        assert!(outcome.unmanaged.rulesets.contains("rs"));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_through_the_shadow() {
        // First run mutates the shadow; a second run against the mutated
        // shadow finds nothing to do.
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        desired.users.insert("carl".into(), "carl".into());
        desired
            .teams
            .insert("sre".into(), desired_team("sre", &["carl"]));
        desired
            .repositories
            .insert("repo1".into(), desired_repo("repo1", "sre"));

        let mut shadow = RemoteShadow::default();
        run(&config, &mut executor, &mut desired, &mut shadow).await;
        assert!(executor.len() > 0);

        let mut executor = fresh_executor();
        let mut desired_again = desired.clone();
        run(&config, &mut executor, &mut desired_again, &mut shadow).await;
        assert_eq!(rendered(&executor), Vec::<String>::new());
    }

    #[tokio::test]
    async fn fork_visibility_divergence_is_accepted() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        desired
            .repositories
            .insert("fork1".into(), desired_repo("fork1", "sre"));

        let mut shadow = RemoteShadow::default();
        let mut observed = observed_repo("fork1");
        observed.is_fork = true;
        observed.visibility = "public".into();
        shadow.repositories.insert("fork1".into(), observed);
        shadow
            .team_repos
            .entry("sre".into())
            .or_default()
            .insert("fork1".into(), "push".into());

        run(&config, &mut executor, &mut desired, &mut shadow).await;
        assert_eq!(rendered(&executor), Vec::<String>::new());

        // The same divergence on a non-fork reconciles.
        let mut executor = fresh_executor();
        let mut observed = observed_repo("plain");
        observed.visibility = "public".into();
        shadow.repositories.insert("plain".into(), observed);
        shadow
            .team_repos
            .entry("sre".into())
            .or_default()
            .insert("plain".into(), "push".into());
        desired
            .repositories
            .insert("plain".into(), desired_repo("plain", "sre"));
        run(&config, &mut executor, &mut desired, &mut shadow).await;
        assert_eq!(
            rendered(&executor),
            vec!["update_repository_property(plain, visibility=private)"]
        );
    }

    #[tokio::test]
    async fn external_user_demotion_is_a_single_set() {
        // writer -> reader is one set call with `pull`, not remove + add.
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        let mut repo = desired_repo("repo1", "sre");
        repo.external_users.insert("bob".into(), "pull".into());
        desired.repositories.insert("repo1".into(), repo);

        let mut shadow = RemoteShadow::default();
        let mut observed = observed_repo("repo1");
        observed.external_users.insert("bob".into(), "push".into());
        shadow.repositories.insert("repo1".into(), observed);
        shadow
            .team_repos
            .entry("sre".into())
            .or_default()
            .insert("repo1".into(), "push".into());

        run(&config, &mut executor, &mut desired, &mut shadow).await;
        assert_eq!(
            rendered(&executor),
            vec!["set_external_user(repo1, bob, pull)"]
        );
        assert_eq!(
            shadow.repositories["repo1"].external_users.get("bob"),
            Some(&"pull".to_string())
        );
    }

    #[tokio::test]
    async fn maintainers_are_downgraded_before_membership_delta() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        desired
            .teams
            .insert("sre".into(), desired_team("sre", &["alice", "bob"]));

        let mut shadow = RemoteShadow::default();
        let mut observed = observed_team("sre", 4, &["bob"]);
        observed.maintainers.insert("alice".into());
        shadow.teams.insert("sre".into(), observed);

        run(&config, &mut executor, &mut desired, &mut shadow).await;

        // Alice is downgraded in place; nobody is removed or re-added.
        assert_eq!(
            rendered(&executor),
            vec!["update_team_add_member(sre, alice, member)"]
        );
    }

    #[tokio::test]
    async fn new_parent_is_attached_on_the_second_pass() {
        let config = RepoConfig::default();

        // Cycle 1: parent and child are both new. The child is created
        // parentless because the parent has no remote id yet.
        let mut executor = fresh_executor();
        let mut desired = DesiredState::default();
        let mut child = desired_team("child", &[]);
        child.parent_slug = Some("parent".into());
        desired.teams.insert("child".into(), child.clone());
        desired.teams.insert("parent".into(), desired_team("parent", &[]));
        let mut shadow = RemoteShadow::default();

        run(&config, &mut executor, &mut desired, &mut shadow).await;
        let child_create = executor
            .commands()
            .iter()
            .find_map(|c| match c {
                Command::CreateTeam { slug, parent_id, .. } if slug == "child" => Some(*parent_id),
                _ => None,
            })
            .expect("child creation");
        assert_eq!(child_create, None);

        // Cycle 2: the platform assigned the parent an id; the child is
        // attached.
        shadow.teams.get_mut("parent").expect("parent in shadow").id = Some(77);
        let mut executor = fresh_executor();
        let mut desired_again = desired.clone();
        run(&config, &mut executor, &mut desired_again, &mut shadow).await;
        assert_eq!(
            rendered(&executor),
            vec!["update_team_set_parent(child, parent)"]
        );
        let parent_id = executor
            .commands()
            .iter()
            .find_map(|c| match c {
                Command::UpdateTeamSetParent { parent_id, .. } => Some(*parent_id),
                _ => None,
            })
            .flatten();
        assert_eq!(parent_id, Some(77));
    }

    #[tokio::test]
    async fn created_repo_gets_its_sub_resources() {
        let config = RepoConfig::default();
        let mut executor = fresh_executor();

        let mut desired = DesiredState::default();
        let mut repo = desired_repo("svc", "sre");
        repo.variables.insert("TIER".into(), "prod".into());
        repo.environments.insert(
            "staging".into(),
            crate::remote::types::GithubEnvironment {
                name: "staging".into(),
                variables: BTreeMap::from([("REGION".to_string(), "eu".to_string())]),
            },
        );
        desired.repositories.insert("svc".into(), repo);

        let mut shadow = RemoteShadow::default();
        run(&config, &mut executor, &mut desired, &mut shadow).await;

        assert_eq!(
            rendered(&executor),
            vec![
                "create_repository(svc)",
                "add_environment(svc, staging)",
                "add_environment_variable(svc, staging, REGION)",
                "add_repository_variable(svc, TIER)",
            ]
        );
    }
}


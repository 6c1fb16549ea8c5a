//! The mutable remote shadow.
//!
//! At the start of a reconciliation cycle every snapshot cache is deep
//! copied into the shadow; planned mutations are applied here (and only
//! here) during planning, so decision N+1 observes the effect of decision
//! N without anything touching GitHub before commit time. Lazy loaders
//! are wrapped in mutable variants that materialize on first mutation.
//! Cancelling a cycle is simply dropping the shadow.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    engine::executor::{Command, PropertyValue},
    github::GithubError,
    remote::{
        RemoteSnapshot,
        lazy::MappedEntityLazyLoader,
        types::{
            GithubAutolink, GithubBranchProtection, GithubEnvironment, GithubRepository,
            GithubRuleset, GithubTeam,
        },
    },
};

/// A copy-on-write wrapper over a shared lazy loader. Reads pass through
/// until the first mutation materializes a private copy.
#[derive(Clone, Debug)]
pub(crate) struct MutableLazyMap<V> {
    base: Arc<MappedEntityLazyLoader<V>>,
    local: Option<BTreeMap<String, V>>,
}

impl<V: Clone> MutableLazyMap<V> {
    pub(crate) fn new(base: Arc<MappedEntityLazyLoader<V>>) -> Self {
        Self { base, local: None }
    }

    pub(crate) fn ready(value: BTreeMap<String, V>) -> Self {
        Self {
            base: Arc::new(MappedEntityLazyLoader::ready(BTreeMap::new())),
            local: Some(value),
        }
    }

    /// The current mapping. Cheap once materialized; otherwise defers to
    /// the underlying loader.
    pub(crate) async fn get(&self) -> Result<BTreeMap<String, V>, GithubError> {
        match &self.local {
            Some(local) => Ok(local.clone()),
            None => Ok(self.base.get().await?.clone()),
        }
    }

    /// Materializes (if needed) and returns the private copy for mutation.
    pub(crate) async fn materialize(&mut self) -> Result<&mut BTreeMap<String, V>, GithubError> {
        if self.local.is_none() {
            self.local = Some(self.base.get().await?.clone());
        }
        Ok(self.local.as_mut().expect("materialized above"))
    }
}

/// A repository inside the shadow: eager fields copied from the
/// snapshot, deferred details behind mutable lazy wrappers.
#[derive(Clone, Debug)]
pub(crate) struct ShadowRepository {
    pub(crate) name: String,
    pub(crate) id: Option<u64>,
    pub(crate) ref_id: Option<String>,
    pub(crate) visibility: String,
    pub(crate) default_branch: String,
    pub(crate) is_fork: bool,
    pub(crate) bool_properties: BTreeMap<String, bool>,
    pub(crate) external_users: BTreeMap<String, String>,
    pub(crate) rulesets: BTreeMap<String, GithubRuleset>,
    pub(crate) branch_protections: BTreeMap<String, GithubBranchProtection>,
    pub(crate) environments: MutableLazyMap<GithubEnvironment>,
    pub(crate) variables: MutableLazyMap<String>,
    pub(crate) autolinks: MutableLazyMap<GithubAutolink>,
}

impl ShadowRepository {
    fn from_remote(repo: &GithubRepository) -> Self {
        Self {
            name: repo.name.clone(),
            id: repo.id,
            ref_id: repo.ref_id.clone(),
            visibility: repo.visibility.clone(),
            default_branch: repo.default_branch.clone(),
            is_fork: repo.is_fork,
            bool_properties: repo.bool_properties.clone(),
            external_users: repo.external_users.clone(),
            rulesets: repo.rulesets.clone(),
            branch_protections: repo.branch_protections.clone(),
            environments: MutableLazyMap::new(repo.environments.clone()),
            variables: MutableLazyMap::new(repo.variables.clone()),
            autolinks: MutableLazyMap::new(repo.autolinks.clone()),
        }
    }

    pub(crate) fn archived(&self) -> bool {
        self.bool_properties.get("archived").copied().unwrap_or(false)
    }
}

/// The in-memory copy of the observed state, exposing the snapshot's read
/// surface plus the full mutation vocabulary, applied locally only.
#[derive(Clone, Debug, Default)]
pub(crate) struct RemoteShadow {
    pub(crate) users: BTreeMap<String, String>,
    pub(crate) teams: BTreeMap<String, GithubTeam>,
    pub(crate) team_repos: BTreeMap<String, BTreeMap<String, String>>,
    pub(crate) repositories: BTreeMap<String, ShadowRepository>,
    pub(crate) rulesets: BTreeMap<String, GithubRuleset>,
    pub(crate) app_ids: BTreeMap<String, u64>,
    pub(crate) is_enterprise: bool,
}

impl RemoteShadow {
    pub(crate) fn from_snapshot(snapshot: &RemoteSnapshot) -> Self {
        Self {
            users: snapshot.users.value.clone(),
            teams: snapshot.teams.value.clone(),
            team_repos: snapshot.team_repos.value.clone(),
            repositories: snapshot
                .repositories
                .value
                .iter()
                .map(|(name, repo)| (name.clone(), ShadowRepository::from_remote(repo)))
                .collect(),
            rulesets: snapshot.rulesets.value.clone(),
            app_ids: snapshot.app_ids.value.clone(),
            is_enterprise: snapshot.is_enterprise,
        }
    }

    fn slug_for_team_id(&self, id: Option<u64>) -> Option<String> {
        let id = id?;
        self.teams
            .values()
            .find(|team| team.id == Some(id))
            .map(|team| team.slug.clone())
    }

    /// Applies one planned mutation to the in-memory caches.
    pub(crate) async fn apply(&mut self, command: &Command) -> Result<(), GithubError> {
        match command {
            Command::AddUserToOrg { login } => {
                self.users.insert(login.clone(), "MEMBER".into());
            }
            Command::RemoveUserFromOrg { login } => {
                self.users.remove(login);
            }
            Command::CreateTeam {
                name,
                slug,
                parent_id,
                members,
            } => {
                let parent_slug = self.slug_for_team_id(*parent_id);
                self.teams.insert(
                    slug.clone(),
                    GithubTeam {
                        name: name.clone(),
                        slug: slug.clone(),
                        id: None,
                        members: members.iter().cloned().collect(),
                        maintainers: Default::default(),
                        parent_slug,
                        externally_managed: false,
                    },
                );
                self.team_repos.entry(slug.clone()).or_default();
            }
            Command::UpdateTeamAddMember { slug, login, role } => {
                if let Some(team) = self.teams.get_mut(slug) {
                    if role == "maintainer" {
                        team.members.remove(login);
                        team.maintainers.insert(login.clone());
                    } else {
                        team.maintainers.remove(login);
                        team.members.insert(login.clone());
                    }
                }
            }
            Command::UpdateTeamRemoveMember { slug, login } => {
                if let Some(team) = self.teams.get_mut(slug) {
                    team.members.remove(login);
                    team.maintainers.remove(login);
                }
            }
            Command::UpdateTeamSetParent {
                slug, parent_slug, ..
            } => {
                if let Some(team) = self.teams.get_mut(slug) {
                    team.parent_slug = parent_slug.clone();
                }
            }
            Command::DeleteTeam { slug } => {
                self.teams.remove(slug);
                self.team_repos.remove(slug);
            }
            Command::CreateRepository {
                name,
                visibility,
                default_branch,
                bool_properties,
                writers,
                readers,
                fork_from,
            } => {
                self.repositories.insert(
                    name.clone(),
                    ShadowRepository {
                        name: name.clone(),
                        id: None,
                        ref_id: None,
                        visibility: visibility.clone(),
                        default_branch: default_branch.clone(),
                        is_fork: fork_from.is_some(),
                        bool_properties: bool_properties.clone(),
                        external_users: BTreeMap::new(),
                        rulesets: BTreeMap::new(),
                        branch_protections: BTreeMap::new(),
                        environments: MutableLazyMap::ready(BTreeMap::new()),
                        variables: MutableLazyMap::ready(BTreeMap::new()),
                        autolinks: MutableLazyMap::ready(BTreeMap::new()),
                    },
                );
                for writer in writers {
                    self.team_repos
                        .entry(writer.clone())
                        .or_default()
                        .insert(name.clone(), "push".into());
                }
                for reader in readers {
                    self.team_repos
                        .entry(reader.clone())
                        .or_default()
                        .insert(name.clone(), "pull".into());
                }
            }
            Command::RenameRepository { name, new_name } => {
                if let Some(mut repo) = self.repositories.remove(name) {
                    repo.name = new_name.clone();
                    self.repositories.insert(new_name.clone(), repo);
                }
                for repos in self.team_repos.values_mut() {
                    if let Some(permission) = repos.remove(name) {
                        repos.insert(new_name.clone(), permission);
                    }
                }
            }
            Command::UpdateRepositoryUpdateProperty {
                name,
                property,
                value,
            } => {
                if let Some(repo) = self.repositories.get_mut(name) {
                    match (property.as_str(), value) {
                        ("default_branch", PropertyValue::Str(branch)) => {
                            repo.default_branch = branch.clone();
                        }
                        ("visibility", PropertyValue::Str(visibility)) => {
                            repo.visibility = visibility.clone();
                        }
                        (_, PropertyValue::Bool(flag)) => {
                            repo.bool_properties.insert(property.clone(), *flag);
                        }
                        (_, PropertyValue::Str(_)) => {}
                    }
                }
            }
            Command::UpdateRepositoryAddTeamAccess {
                name,
                team_slug,
                permission,
            }
            | Command::UpdateRepositoryUpdateTeamAccess {
                name,
                team_slug,
                permission,
            } => {
                self.team_repos
                    .entry(team_slug.clone())
                    .or_default()
                    .insert(name.clone(), permission.clone());
            }
            Command::UpdateRepositoryRemoveTeamAccess { name, team_slug } => {
                if let Some(repos) = self.team_repos.get_mut(team_slug) {
                    repos.remove(name);
                }
            }
            Command::UpdateRepositorySetExternalUser {
                name,
                login,
                permission,
            } => {
                if let Some(repo) = self.repositories.get_mut(name) {
                    repo.external_users.insert(login.clone(), permission.clone());
                }
            }
            Command::UpdateRepositoryRemoveExternalUser { name, login } => {
                if let Some(repo) = self.repositories.get_mut(name) {
                    repo.external_users.remove(login);
                }
            }
            Command::DeleteRepository { name } => {
                self.repositories.remove(name);
                for repos in self.team_repos.values_mut() {
                    repos.remove(name);
                }
            }
            Command::AddRepositoryRuleset { repo, ruleset }
            | Command::UpdateRepositoryRuleset { repo, ruleset } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository
                        .rulesets
                        .insert(ruleset.name.clone(), ruleset.clone());
                }
            }
            Command::DeleteRepositoryRuleset { repo, name, .. } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository.rulesets.remove(name);
                }
            }
            Command::AddRepositoryBranchProtection { repo, protection }
            | Command::UpdateRepositoryBranchProtection { repo, protection } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository
                        .branch_protections
                        .insert(protection.protection.pattern.clone(), protection.clone());
                }
            }
            Command::DeleteRepositoryBranchProtection { repo, pattern, .. } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository.branch_protections.remove(pattern);
                }
            }
            Command::AddRepositoryEnvironment { repo, environment } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository.environments.materialize().await?.insert(
                        environment.clone(),
                        GithubEnvironment {
                            name: environment.clone(),
                            variables: BTreeMap::new(),
                        },
                    );
                }
            }
            Command::DeleteRepositoryEnvironment { repo, environment } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository.environments.materialize().await?.remove(environment);
                }
            }
            Command::AddRepositoryVariable { repo, name, value }
            | Command::UpdateRepositoryVariable { repo, name, value } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository
                        .variables
                        .materialize()
                        .await?
                        .insert(name.clone(), value.clone());
                }
            }
            Command::DeleteRepositoryVariable { repo, name } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository.variables.materialize().await?.remove(name);
                }
            }
            Command::AddRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
                value,
            }
            | Command::UpdateRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
                value,
            } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    let environments = repository.environments.materialize().await?;
                    let entry = environments.entry(environment.clone()).or_insert_with(|| {
                        GithubEnvironment {
                            name: environment.clone(),
                            variables: BTreeMap::new(),
                        }
                    });
                    entry.variables.insert(name.clone(), value.clone());
                }
            }
            Command::DeleteRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
            } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    if let Some(entry) = repository
                        .environments
                        .materialize()
                        .await?
                        .get_mut(environment)
                    {
                        entry.variables.remove(name);
                    }
                }
            }
            Command::AddRepositoryAutolink { repo, autolink } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository
                        .autolinks
                        .materialize()
                        .await?
                        .insert(autolink.key_prefix.clone(), autolink.clone());
                }
            }
            Command::DeleteRepositoryAutolink {
                repo, key_prefix, ..
            } => {
                if let Some(repository) = self.repositories.get_mut(repo) {
                    repository.autolinks.materialize().await?.remove(key_prefix);
                }
            }
            Command::AddRuleset { ruleset } | Command::UpdateRuleset { ruleset } => {
                self.rulesets.insert(ruleset.name.clone(), ruleset.clone());
            }
            Command::DeleteRuleset { name, .. } => {
                self.rulesets.remove(name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn shadow_with_repo(name: &str) -> RemoteShadow {
        let mut shadow = RemoteShadow::default();
        shadow.repositories.insert(
            name.to_string(),
            ShadowRepository {
                name: name.to_string(),
                id: Some(1),
                ref_id: Some("R_1".into()),
                visibility: "private".into(),
                default_branch: "main".into(),
                is_fork: false,
                bool_properties: BTreeMap::from([("archived".to_string(), false)]),
                external_users: BTreeMap::new(),
                rulesets: BTreeMap::new(),
                branch_protections: BTreeMap::new(),
                environments: MutableLazyMap::ready(BTreeMap::new()),
                variables: MutableLazyMap::ready(BTreeMap::new()),
                autolinks: MutableLazyMap::ready(BTreeMap::new()),
            },
        );
        shadow
    }

    #[tokio::test]
    async fn rename_remaps_keys_and_team_access() {
        let mut shadow = shadow_with_repo("repo5");
        shadow
            .team_repos
            .entry("sre".into())
            .or_default()
            .insert("repo5".into(), "push".into());

        shadow
            .apply(&Command::RenameRepository {
                name: "repo5".into(),
                new_name: "repo6".into(),
            })
            .await
            .unwrap();

        assert!(!shadow.repositories.contains_key("repo5"));
        assert_eq!(shadow.repositories["repo6"].name, "repo6");
        assert_eq!(shadow.team_repos["sre"].get("repo6"), Some(&"push".to_string()));
    }

    #[tokio::test]
    async fn later_decisions_see_earlier_ones() {
        let mut shadow = RemoteShadow::default();
        shadow
            .apply(&Command::AddUserToOrg {
                login: "alice".into(),
            })
            .await
            .unwrap();
        assert!(shadow.users.contains_key("alice"));

        shadow
            .apply(&Command::CreateTeam {
                name: "new".into(),
                slug: "new".into(),
                parent_id: None,
                members: vec!["alice".into()],
            })
            .await
            .unwrap();
        assert!(shadow.teams["new"].members.contains("alice"));
    }

    #[tokio::test]
    async fn lazy_maps_materialize_on_first_mutation() {
        let mut shadow = shadow_with_repo("repo1");
        shadow
            .apply(&Command::AddRepositoryVariable {
                repo: "repo1".into(),
                name: "TIER".into(),
                value: "prod".into(),
            })
            .await
            .unwrap();

        let variables = shadow.repositories["repo1"].variables.get().await.unwrap();
        assert_eq!(variables.get("TIER"), Some(&"prod".to_string()));
    }

    #[tokio::test]
    async fn property_updates_touch_the_right_field() {
        let mut shadow = shadow_with_repo("repo1");
        shadow
            .apply(&Command::UpdateRepositoryUpdateProperty {
                name: "repo1".into(),
                property: "archived".into(),
                value: PropertyValue::Bool(true),
            })
            .await
            .unwrap();
        assert!(shadow.repositories["repo1"].archived());

        shadow
            .apply(&Command::UpdateRepositoryUpdateProperty {
                name: "repo1".into(),
                property: "default_branch".into(),
                value: PropertyValue::Str("trunk".into()),
            })
            .await
            .unwrap();
        assert_eq!(shadow.repositories["repo1"].default_branch, "trunk");
    }
}

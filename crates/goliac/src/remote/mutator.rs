//! The remote mutator: routes each committed command to one REST or
//! GraphQL call, then updates the snapshot caches in place so the next
//! cycle does not need a full re-pull.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    engine::executor::{Command, Mutator, PropertyValue},
    github::{GithubError, graphql_data},
    remote::{
        RemoteSnapshot,
        lazy::MappedEntityLazyLoader,
        types::{
            ALL_BRANCHES_PATTERN, DEFAULT_BRANCH_PATTERN, GithubAutolink,
            GithubBranchProtection, GithubRepository, GithubRuleset, GithubTeam,
        },
    },
};

/// Where a ruleset payload is headed; the organization flavor carries
/// repository-name conditions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum RulesetScope {
    Organization,
    Repository,
}

pub(crate) struct GithubMutator<'a> {
    snapshot: &'a mut RemoteSnapshot,
}

impl<'a> GithubMutator<'a> {
    pub(crate) fn new(snapshot: &'a mut RemoteSnapshot) -> Self {
        Self { snapshot }
    }

    async fn rest(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Vec<u8>, GithubError> {
        self.snapshot
            .transport()
            .clone()
            .call_rest(method, endpoint, body)
            .await
    }

    /// DELETE where a 404 means the work is already done.
    async fn rest_delete(&self, endpoint: &str) -> Result<(), GithubError> {
        match self.rest(Method::DELETE, endpoint, None).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Deserialize)]
struct CreatedTeam {
    id: u64,
    slug: String,
}

#[derive(Deserialize)]
struct CreatedRepo {
    id: u64,
    node_id: String,
    #[serde(default)]
    default_branch: Option<String>,
}

#[async_trait]
impl Mutator for GithubMutator<'_> {
    async fn apply(&mut self, command: &Command) -> Result<(), GithubError> {
        let org = self.snapshot.org().to_string();
        match command {
            Command::AddUserToOrg { login } => {
                self.rest(
                    Method::PUT,
                    &format!("/orgs/{org}/memberships/{login}"),
                    Some(json!({ "role": "member" })),
                )
                .await?;
                self.snapshot
                    .users
                    .value
                    .insert(login.clone(), "MEMBER".into());
            }
            Command::RemoveUserFromOrg { login } => {
                self.rest_delete(&format!("/orgs/{org}/memberships/{login}"))
                    .await?;
                self.snapshot.users.value.remove(login);
            }
            Command::CreateTeam {
                name,
                slug,
                parent_id,
                members,
            } => {
                let mut body = json!({ "name": name, "privacy": "closed" });
                if let Some(parent_id) = parent_id {
                    body["parent_team_id"] = json!(parent_id);
                }
                let raw = self
                    .rest(Method::POST, &format!("/orgs/{org}/teams"), Some(body))
                    .await?;
                let created: CreatedTeam = serde_json::from_slice(&raw)?;
                if created.slug != *slug {
                    tracing::debug!(
                        "platform slugged team `{name}` as `{actual}` (planned `{slug}`)",
                        actual = created.slug
                    );
                }

                for login in members {
                    self.rest(
                        Method::PUT,
                        &format!(
                            "/orgs/{org}/teams/{slug}/memberships/{login}",
                            slug = created.slug
                        ),
                        Some(json!({ "role": "member" })),
                    )
                    .await?;
                }

                let parent_slug = parent_id.and_then(|id| {
                    self.snapshot
                        .teams
                        .value
                        .values()
                        .find(|t| t.id == Some(id))
                        .map(|t| t.slug.clone())
                });
                self.snapshot.teams.value.insert(
                    created.slug.clone(),
                    GithubTeam {
                        name: name.clone(),
                        slug: created.slug.clone(),
                        id: Some(created.id),
                        members: members.iter().cloned().collect(),
                        maintainers: Default::default(),
                        parent_slug,
                        externally_managed: false,
                    },
                );
                self.snapshot
                    .team_repos
                    .value
                    .entry(created.slug)
                    .or_default();
            }
            Command::UpdateTeamAddMember { slug, login, role } => {
                self.rest(
                    Method::PUT,
                    &format!("/orgs/{org}/teams/{slug}/memberships/{login}"),
                    Some(json!({ "role": role })),
                )
                .await?;
                if let Some(team) = self.snapshot.teams.value.get_mut(slug) {
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
                self.rest_delete(&format!("/orgs/{org}/teams/{slug}/memberships/{login}"))
                    .await?;
                if let Some(team) = self.snapshot.teams.value.get_mut(slug) {
                    team.members.remove(login);
                    team.maintainers.remove(login);
                }
            }
            Command::UpdateTeamSetParent {
                slug,
                parent_id,
                parent_slug,
            } => {
                self.rest(
                    Method::PATCH,
                    &format!("/orgs/{org}/teams/{slug}"),
                    Some(json!({ "parent_team_id": parent_id })),
                )
                .await?;
                if let Some(team) = self.snapshot.teams.value.get_mut(slug) {
                    team.parent_slug = parent_slug.clone();
                }
            }
            Command::DeleteTeam { slug } => {
                self.rest_delete(&format!("/orgs/{org}/teams/{slug}")).await?;
                self.snapshot.teams.value.remove(slug);
                self.snapshot.team_repos.value.remove(slug);
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
                let raw = match fork_from {
                    Some(source) => {
                        self.rest(
                            Method::POST,
                            &format!("/repos/{source}/forks"),
                            Some(json!({ "organization": org, "name": name })),
                        )
                        .await?
                    }
                    None => {
                        let mut body = json!({
                            "name": name,
                            "visibility": visibility,
                            "private": visibility != "public",
                            "auto_init": true,
                        });
                        for (property, value) in bool_properties {
                            if property != "archived" {
                                body[property] = json!(value);
                            }
                        }
                        self.rest(Method::POST, &format!("/orgs/{org}/repos"), Some(body))
                            .await?
                    }
                };
                let created: CreatedRepo = serde_json::from_slice(&raw)?;

                if created.default_branch.as_deref() != Some(default_branch.as_str()) {
                    self.rest(
                        Method::PATCH,
                        &format!("/repos/{org}/{name}"),
                        Some(json!({ "default_branch": default_branch })),
                    )
                    .await?;
                }

                for (slug, permission) in writers
                    .iter()
                    .map(|w| (w, "push"))
                    .chain(readers.iter().map(|r| (r, "pull")))
                {
                    self.rest(
                        Method::PUT,
                        &format!("/orgs/{org}/teams/{slug}/repos/{org}/{name}"),
                        Some(json!({ "permission": permission })),
                    )
                    .await?;
                    self.snapshot
                        .team_repos
                        .value
                        .entry(slug.clone())
                        .or_default()
                        .insert(name.clone(), permission.into());
                }

                self.snapshot
                    .repositories_by_ref_id
                    .insert(created.node_id.clone(), name.clone());
                self.snapshot.repositories.value.insert(
                    name.clone(),
                    GithubRepository {
                        name: name.clone(),
                        id: Some(created.id),
                        ref_id: Some(created.node_id),
                        visibility: visibility.clone(),
                        default_branch: default_branch.clone(),
                        is_fork: fork_from.is_some(),
                        fork_from: None,
                        bool_properties: bool_properties.clone(),
                        ..Default::default()
                    },
                );
            }
            Command::RenameRepository { name, new_name } => {
                self.rest(
                    Method::PATCH,
                    &format!("/repos/{org}/{name}"),
                    Some(json!({ "name": new_name })),
                )
                .await?;
                if let Some(mut repo) = self.snapshot.repositories.value.remove(name) {
                    repo.name = new_name.clone();
                    if let Some(ref_id) = &repo.ref_id {
                        self.snapshot
                            .repositories_by_ref_id
                            .insert(ref_id.clone(), new_name.clone());
                    }
                    self.snapshot
                        .repositories
                        .value
                        .insert(new_name.clone(), repo);
                }
                for repos in self.snapshot.team_repos.value.values_mut() {
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
                let body = match value {
                    PropertyValue::Bool(flag) => json!({ property: flag }),
                    PropertyValue::Str(text) => json!({ property: text }),
                };
                self.rest(Method::PATCH, &format!("/repos/{org}/{name}"), Some(body))
                    .await?;
                if let Some(repo) = self.snapshot.repositories.value.get_mut(name) {
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
                self.rest(
                    Method::PUT,
                    &format!("/orgs/{org}/teams/{team_slug}/repos/{org}/{name}"),
                    Some(json!({ "permission": permission })),
                )
                .await?;
                self.snapshot
                    .team_repos
                    .value
                    .entry(team_slug.clone())
                    .or_default()
                    .insert(name.clone(), permission.clone());
            }
            Command::UpdateRepositoryRemoveTeamAccess { name, team_slug } => {
                self.rest_delete(&format!("/orgs/{org}/teams/{team_slug}/repos/{org}/{name}"))
                    .await?;
                if let Some(repos) = self.snapshot.team_repos.value.get_mut(team_slug) {
                    repos.remove(name);
                }
            }
            Command::UpdateRepositorySetExternalUser {
                name,
                login,
                permission,
            } => {
                self.rest(
                    Method::PUT,
                    &format!("/repos/{org}/{name}/collaborators/{login}"),
                    Some(json!({ "permission": permission })),
                )
                .await?;
                if let Some(repo) = self.snapshot.repositories.value.get_mut(name) {
                    repo.external_users.insert(login.clone(), permission.clone());
                }
            }
            Command::UpdateRepositoryRemoveExternalUser { name, login } => {
                self.rest_delete(&format!("/repos/{org}/{name}/collaborators/{login}"))
                    .await?;
                if let Some(repo) = self.snapshot.repositories.value.get_mut(name) {
                    repo.external_users.remove(login);
                }
            }
            Command::DeleteRepository { name } => {
                self.rest_delete(&format!("/repos/{org}/{name}")).await?;
                if let Some(repo) = self.snapshot.repositories.value.remove(name)
                    && let Some(ref_id) = repo.ref_id
                {
                    self.snapshot.repositories_by_ref_id.remove(&ref_id);
                }
                for repos in self.snapshot.team_repos.value.values_mut() {
                    repos.remove(name);
                }
            }
            Command::AddRepositoryRuleset { repo, ruleset } => {
                let payload = build_ruleset_payload(
                    ruleset,
                    RulesetScope::Repository,
                    &self.snapshot.app_ids.value,
                    &self.snapshot.teams.value,
                );
                let raw = self
                    .rest(
                        Method::POST,
                        &format!("/repos/{org}/{repo}/rulesets"),
                        Some(payload),
                    )
                    .await?;
                let created: Value = serde_json::from_slice(&raw)?;
                let mut stored = ruleset.clone();
                stored.id = created.get("id").and_then(|v| v.as_u64());
                if let Some(repository) = self.snapshot.repositories.value.get_mut(repo) {
                    repository.rulesets.insert(stored.name.clone(), stored);
                }
            }
            Command::UpdateRepositoryRuleset { repo, ruleset } => {
                let id = ruleset.id.ok_or_else(|| {
                    GithubError::GraphQl(format!(
                        "ruleset `{name}` has no remote id to update",
                        name = ruleset.name
                    ))
                })?;
                let payload = build_ruleset_payload(
                    ruleset,
                    RulesetScope::Repository,
                    &self.snapshot.app_ids.value,
                    &self.snapshot.teams.value,
                );
                self.rest(
                    Method::PUT,
                    &format!("/repos/{org}/{repo}/rulesets/{id}"),
                    Some(payload),
                )
                .await?;
                if let Some(repository) = self.snapshot.repositories.value.get_mut(repo) {
                    repository
                        .rulesets
                        .insert(ruleset.name.clone(), ruleset.clone());
                }
            }
            Command::DeleteRepositoryRuleset {
                repo,
                name,
                ruleset_id,
            } => {
                if let Some(id) = ruleset_id {
                    self.rest_delete(&format!("/repos/{org}/{repo}/rulesets/{id}"))
                        .await?;
                }
                if let Some(repository) = self.snapshot.repositories.value.get_mut(repo) {
                    repository.rulesets.remove(name);
                }
            }
            Command::AddRepositoryBranchProtection { repo, protection } => {
                let repository_id = self
                    .snapshot
                    .repositories
                    .value
                    .get(repo)
                    .and_then(|r| r.ref_id.clone())
                    .ok_or_else(|| {
                        GithubError::GraphQl(format!("no node id cached for repository `{repo}`"))
                    })?;

                const QUERY: &str = r#"
mutation createBranchProtection($input: CreateBranchProtectionRuleInput!) {
  createBranchProtectionRule(input: $input) {
    branchProtectionRule { id }
  }
}"#;
                let mut input = branch_protection_input(protection);
                input["repositoryId"] = json!(repository_id);
                let raw = self
                    .snapshot
                    .transport()
                    .clone()
                    .query_graphql(QUERY, json!({ "input": input }))
                    .await?;

                #[derive(Deserialize)]
                struct Data {
                    #[serde(rename = "createBranchProtectionRule")]
                    create: Created,
                }
                #[derive(Deserialize)]
                struct Created {
                    #[serde(rename = "branchProtectionRule")]
                    rule: Rule,
                }
                #[derive(Deserialize)]
                struct Rule {
                    id: String,
                }
                let data: Data = graphql_data(&raw)?;

                if let Some(repository) = self.snapshot.repositories.value.get_mut(repo) {
                    let mut stored = protection.clone();
                    stored.id = Some(data.create.rule.id);
                    repository
                        .branch_protections
                        .insert(stored.protection.pattern.clone(), stored);
                }
            }
            Command::UpdateRepositoryBranchProtection { repo, protection } => {
                let rule_id = protection.id.clone().ok_or_else(|| {
                    GithubError::GraphQl(format!(
                        "branch protection `{pattern}` has no node id to update",
                        pattern = protection.protection.pattern
                    ))
                })?;

                const QUERY: &str = r#"
mutation updateBranchProtection($input: UpdateBranchProtectionRuleInput!) {
  updateBranchProtectionRule(input: $input) {
    branchProtectionRule { id }
  }
}"#;
                let mut input = branch_protection_input(protection);
                input["branchProtectionRuleId"] = json!(rule_id);
                let raw = self
                    .snapshot
                    .transport()
                    .clone()
                    .query_graphql(QUERY, json!({ "input": input }))
                    .await?;
                graphql_data::<Value>(&raw)?;

                if let Some(repository) = self.snapshot.repositories.value.get_mut(repo) {
                    repository
                        .branch_protections
                        .insert(protection.protection.pattern.clone(), protection.clone());
                }
            }
            Command::DeleteRepositoryBranchProtection { repo, pattern, id } => {
                if let Some(rule_id) = id {
                    const QUERY: &str = r#"
mutation deleteBranchProtection($input: DeleteBranchProtectionRuleInput!) {
  deleteBranchProtectionRule(input: $input) {
    clientMutationId
  }
}"#;
                    let raw = self
                        .snapshot
                        .transport()
                        .clone()
                        .query_graphql(
                            QUERY,
                            json!({ "input": { "branchProtectionRuleId": rule_id } }),
                        )
                        .await?;
                    graphql_data::<Value>(&raw)?;
                }
                if let Some(repository) = self.snapshot.repositories.value.get_mut(repo) {
                    repository.branch_protections.remove(pattern);
                }
            }
            Command::AddRepositoryEnvironment { repo, environment } => {
                self.rest(
                    Method::PUT,
                    &format!("/repos/{org}/{repo}/environments/{environment}"),
                    None,
                )
                .await?;
                refresh_environment(self.snapshot, repo, environment, true);
            }
            Command::DeleteRepositoryEnvironment { repo, environment } => {
                self.rest_delete(&format!("/repos/{org}/{repo}/environments/{environment}"))
                    .await?;
                refresh_environment(self.snapshot, repo, environment, false);
            }
            Command::AddRepositoryVariable { repo, name, value } => {
                self.rest(
                    Method::POST,
                    &format!("/repos/{org}/{repo}/actions/variables"),
                    Some(json!({ "name": name, "value": value })),
                )
                .await?;
                refresh_variable(self.snapshot, repo, name, Some(value));
            }
            Command::UpdateRepositoryVariable { repo, name, value } => {
                self.rest(
                    Method::PATCH,
                    &format!("/repos/{org}/{repo}/actions/variables/{name}"),
                    Some(json!({ "name": name, "value": value })),
                )
                .await?;
                refresh_variable(self.snapshot, repo, name, Some(value));
            }
            Command::DeleteRepositoryVariable { repo, name } => {
                self.rest_delete(&format!("/repos/{org}/{repo}/actions/variables/{name}"))
                    .await?;
                refresh_variable(self.snapshot, repo, name, None);
            }
            Command::AddRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
                value,
            } => {
                self.rest(
                    Method::POST,
                    &format!("/repos/{org}/{repo}/environments/{environment}/variables"),
                    Some(json!({ "name": name, "value": value })),
                )
                .await?;
                refresh_environment_variable(self.snapshot, repo, environment, name, Some(value));
            }
            Command::UpdateRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
                value,
            } => {
                self.rest(
                    Method::PATCH,
                    &format!(
                        "/repos/{org}/{repo}/environments/{environment}/variables/{name}"
                    ),
                    Some(json!({ "name": name, "value": value })),
                )
                .await?;
                refresh_environment_variable(self.snapshot, repo, environment, name, Some(value));
            }
            Command::DeleteRepositoryEnvironmentVariable {
                repo,
                environment,
                name,
            } => {
                self.rest_delete(&format!(
                    "/repos/{org}/{repo}/environments/{environment}/variables/{name}"
                ))
                .await?;
                refresh_environment_variable(self.snapshot, repo, environment, name, None);
            }
            Command::AddRepositoryAutolink { repo, autolink } => {
                let raw = self
                    .rest(
                        Method::POST,
                        &format!("/repos/{org}/{repo}/autolinks"),
                        Some(json!({
                            "key_prefix": autolink.key_prefix,
                            "url_template": autolink.url_template,
                            "is_alphanumeric": autolink.is_alphanumeric,
                        })),
                    )
                    .await?;
                let created: Value = serde_json::from_slice(&raw)?;
                let mut stored = autolink.clone();
                stored.id = created.get("id").and_then(|v| v.as_u64());
                refresh_autolink(self.snapshot, repo, &autolink.key_prefix, Some(stored));
            }
            Command::DeleteRepositoryAutolink {
                repo,
                key_prefix,
                id,
            } => {
                if let Some(id) = id {
                    self.rest_delete(&format!("/repos/{org}/{repo}/autolinks/{id}"))
                        .await?;
                }
                refresh_autolink(self.snapshot, repo, key_prefix, None);
            }
            Command::AddRuleset { ruleset } => {
                let payload = build_ruleset_payload(
                    ruleset,
                    RulesetScope::Organization,
                    &self.snapshot.app_ids.value,
                    &self.snapshot.teams.value,
                );
                let raw = self
                    .rest(Method::POST, &format!("/orgs/{org}/rulesets"), Some(payload))
                    .await?;
                let created: Value = serde_json::from_slice(&raw)?;
                let mut stored = ruleset.clone();
                stored.id = created.get("id").and_then(|v| v.as_u64());
                self.snapshot
                    .rulesets
                    .value
                    .insert(stored.name.clone(), stored);
            }
            Command::UpdateRuleset { ruleset } => {
                let id = ruleset.id.ok_or_else(|| {
                    GithubError::GraphQl(format!(
                        "ruleset `{name}` has no remote id to update",
                        name = ruleset.name
                    ))
                })?;
                let payload = build_ruleset_payload(
                    ruleset,
                    RulesetScope::Organization,
                    &self.snapshot.app_ids.value,
                    &self.snapshot.teams.value,
                );
                self.rest(
                    Method::PUT,
                    &format!("/orgs/{org}/rulesets/{id}"),
                    Some(payload),
                )
                .await?;
                self.snapshot
                    .rulesets
                    .value
                    .insert(ruleset.name.clone(), ruleset.clone());
            }
            Command::DeleteRuleset { name, ruleset_id } => {
                if let Some(id) = ruleset_id {
                    self.rest_delete(&format!("/orgs/{org}/rulesets/{id}")).await?;
                }
                self.snapshot.rulesets.value.remove(name);
            }
        }
        Ok(())
    }
}

/// Keeps an already-materialized environments cache coherent. Unmaterialized
/// loaders are left alone; they will fetch fresh state when first read.
fn refresh_environment(snapshot: &mut RemoteSnapshot, repo: &str, environment: &str, add: bool) {
    if let Some(repository) = snapshot.repositories.value.get_mut(repo)
        && let Some(environments) = repository.environments.peek()
    {
        let mut environments = environments.clone();
        if add {
            environments.insert(
                environment.to_string(),
                crate::remote::types::GithubEnvironment {
                    name: environment.to_string(),
                    variables: BTreeMap::new(),
                },
            );
        } else {
            environments.remove(environment);
        }
        repository.environments = std::sync::Arc::new(MappedEntityLazyLoader::ready(environments));
    }
}

fn refresh_variable(snapshot: &mut RemoteSnapshot, repo: &str, name: &str, value: Option<&str>) {
    if let Some(repository) = snapshot.repositories.value.get_mut(repo)
        && let Some(variables) = repository.variables.peek()
    {
        let mut variables = variables.clone();
        match value {
            Some(value) => {
                variables.insert(name.to_string(), value.to_string());
            }
            None => {
                variables.remove(name);
            }
        }
        repository.variables = std::sync::Arc::new(MappedEntityLazyLoader::ready(variables));
    }
}

fn refresh_environment_variable(
    snapshot: &mut RemoteSnapshot,
    repo: &str,
    environment: &str,
    name: &str,
    value: Option<&str>,
) {
    if let Some(repository) = snapshot.repositories.value.get_mut(repo)
        && let Some(environments) = repository.environments.peek()
    {
        let mut environments = environments.clone();
        let entry = environments
            .entry(environment.to_string())
            .or_insert_with(|| crate::remote::types::GithubEnvironment {
                name: environment.to_string(),
                variables: BTreeMap::new(),
            });
        match value {
            Some(value) => {
                entry.variables.insert(name.to_string(), value.to_string());
            }
            None => {
                entry.variables.remove(name);
            }
        }
        repository.environments = std::sync::Arc::new(MappedEntityLazyLoader::ready(environments));
    }
}

fn refresh_autolink(
    snapshot: &mut RemoteSnapshot,
    repo: &str,
    key_prefix: &str,
    value: Option<GithubAutolink>,
) {
    if let Some(repository) = snapshot.repositories.value.get_mut(repo)
        && let Some(autolinks) = repository.autolinks.peek()
    {
        let mut autolinks = autolinks.clone();
        match value {
            Some(autolink) => {
                autolinks.insert(key_prefix.to_string(), autolink);
            }
            None => {
                autolinks.remove(key_prefix);
            }
        }
        repository.autolinks = std::sync::Arc::new(MappedEntityLazyLoader::ready(autolinks));
    }
}

/// Prefixes a ref pattern for the API unless it is one of the reserved
/// `~DEFAULT_BRANCH` / `~ALL` forms.
fn api_ref_pattern(pattern: &str) -> String {
    if pattern == DEFAULT_BRANCH_PATTERN || pattern == ALL_BRANCHES_PATTERN {
        pattern.to_string()
    } else {
        format!("refs/heads/{pattern}")
    }
}

/// Builds the REST ruleset payload: ref patterns prefixed, bypass actors
/// resolved from slugs to ids, rule types lower-cased.
pub(crate) fn build_ruleset_payload(
    ruleset: &GithubRuleset,
    scope: RulesetScope,
    app_ids: &BTreeMap<String, u64>,
    teams: &BTreeMap<String, GithubTeam>,
) -> Value {
    let mut bypass_actors = Vec::new();
    for slug in &ruleset.bypass_apps {
        if let Some(id) = app_ids.get(slug) {
            bypass_actors.push(json!({
                "actor_id": id,
                "actor_type": "Integration",
                "bypass_mode": "always",
            }));
        }
    }
    for slug in &ruleset.bypass_teams {
        if let Some(id) = teams.get(slug).and_then(|t| t.id) {
            bypass_actors.push(json!({
                "actor_id": id,
                "actor_type": "Team",
                "bypass_mode": "always",
            }));
        }
    }

    let mut conditions = json!({
        "ref_name": {
            "include": ruleset.include.iter().map(|p| api_ref_pattern(p)).collect::<Vec<_>>(),
            "exclude": ruleset.exclude.iter().map(|p| api_ref_pattern(p)).collect::<Vec<_>>(),
        }
    });
    if scope == RulesetScope::Organization {
        conditions["repository_name"] = json!({
            "include": ruleset.repositories.iter().collect::<Vec<_>>(),
            "exclude": [],
        });
    }

    let mut rules = Vec::new();
    for (rule_type, params) in &ruleset.rules {
        let rule_type = rule_type.to_ascii_lowercase();
        let rule = match rule_type.as_str() {
            "pull_request" => json!({
                "type": rule_type,
                "parameters": {
                    "dismiss_stale_reviews_on_push": params.dismiss_stale_reviews_on_push,
                    "require_code_owner_review": params.require_code_owner_review,
                    "required_approving_review_count": params.required_approving_review_count,
                    "require_last_push_approval": params.require_last_push_approval,
                    "required_review_thread_resolution": params.required_review_thread_resolution,
                }
            }),
            "required_status_checks" => json!({
                "type": rule_type,
                "parameters": {
                    "required_status_checks": params
                        .required_status_check_contexts
                        .iter()
                        .map(|context| json!({ "context": context }))
                        .collect::<Vec<_>>(),
                    "strict_required_status_checks_policy": params.strict_required_status_checks_policy,
                }
            }),
            _ => json!({ "type": rule_type }),
        };
        rules.push(rule);
    }

    json!({
        "name": ruleset.name,
        "target": "branch",
        "enforcement": ruleset.enforcement,
        "bypass_actors": bypass_actors,
        "conditions": conditions,
        "rules": rules,
    })
}

/// Shared GraphQL input fields for branch-protection mutations.
fn branch_protection_input(protection: &GithubBranchProtection) -> Value {
    let p = &protection.protection;
    json!({
        "pattern": p.pattern,
        "requiresApprovingReviews": p.requires_approving_reviews,
        "requiredApprovingReviewCount": p.required_approving_review_count,
        "dismissesStaleReviews": p.dismisses_stale_reviews,
        "requiresCodeOwnerReviews": p.requires_code_owner_reviews,
        "requireLastPushApproval": p.require_last_push_approval,
        "requiresStatusChecks": p.requires_status_checks,
        "requiresStrictStatusChecks": p.requires_strict_status_checks,
        "requiredStatusCheckContexts": p.required_status_check_contexts,
        "requiresConversationResolution": p.requires_conversation_resolution,
        "requiresCommitSignatures": p.requires_commit_signatures,
        "requiresLinearHistory": p.requires_linear_history,
        "allowsForcePushes": p.allows_force_pushes,
        "allowsDeletions": p.allows_deletions,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        github::GithubTransport,
        remote::types::{GithubEnvironment, RuleParameters},
    };

    /// Accepts every call; created-entity responses carry id 99.
    struct StubTransport;

    #[async_trait]
    impl GithubTransport for StubTransport {
        async fn query_graphql(
            &self,
            _query: &str,
            _variables: Value,
        ) -> Result<Vec<u8>, GithubError> {
            Ok(br#"{"data": {}}"#.to_vec())
        }

        async fn call_rest(
            &self,
            _method: Method,
            _endpoint: &str,
            _body: Option<Value>,
        ) -> Result<Vec<u8>, GithubError> {
            Ok(br#"{"id": 99}"#.to_vec())
        }

        async fn access_token(&self) -> Result<String, GithubError> {
            Ok("token".into())
        }

        fn app_slug(&self) -> &str {
            "goliac-app"
        }
    }

    fn snapshot_with_repo(repo: GithubRepository) -> RemoteSnapshot {
        let mut snapshot = RemoteSnapshot::new(
            Arc::new(StubTransport),
            "acme",
            1,
            Duration::from_secs(3600),
        );
        snapshot.repositories.value.insert(repo.name.clone(), repo);
        snapshot
    }

    #[tokio::test]
    async fn environment_variable_mutations_keep_the_cache_coherent() {
        let repo = GithubRepository {
            name: "repo1".into(),
            environments: Arc::new(MappedEntityLazyLoader::ready(BTreeMap::from([(
                "staging".to_string(),
                GithubEnvironment {
                    name: "staging".into(),
                    variables: BTreeMap::from([("OLD".to_string(), "1".to_string())]),
                },
            )]))),
            ..Default::default()
        };
        let mut snapshot = snapshot_with_repo(repo);

        let mut mutator = GithubMutator::new(&mut snapshot);
        mutator
            .apply(&Command::AddRepositoryEnvironmentVariable {
                repo: "repo1".into(),
                environment: "staging".into(),
                name: "REGION".into(),
                value: "eu".into(),
            })
            .await
            .unwrap();
        mutator
            .apply(&Command::UpdateRepositoryEnvironmentVariable {
                repo: "repo1".into(),
                environment: "staging".into(),
                name: "REGION".into(),
                value: "us".into(),
            })
            .await
            .unwrap();
        mutator
            .apply(&Command::DeleteRepositoryEnvironmentVariable {
                repo: "repo1".into(),
                environment: "staging".into(),
                name: "OLD".into(),
            })
            .await
            .unwrap();

        let environments = snapshot.repositories.value["repo1"]
            .environments
            .peek()
            .expect("stays materialized");
        assert_eq!(
            environments["staging"].variables,
            BTreeMap::from([("REGION".to_string(), "us".to_string())])
        );
    }

    #[tokio::test]
    async fn autolink_mutations_keep_the_cache_coherent() {
        let repo = GithubRepository {
            name: "repo1".into(),
            autolinks: Arc::new(MappedEntityLazyLoader::ready(BTreeMap::from([(
                "OLD-".to_string(),
                GithubAutolink {
                    id: Some(7),
                    key_prefix: "OLD-".into(),
                    url_template: "https://issues.example.com/OLD-<num>".into(),
                    is_alphanumeric: false,
                },
            )]))),
            ..Default::default()
        };
        let mut snapshot = snapshot_with_repo(repo);

        let mut mutator = GithubMutator::new(&mut snapshot);
        mutator
            .apply(&Command::AddRepositoryAutolink {
                repo: "repo1".into(),
                autolink: GithubAutolink {
                    id: None,
                    key_prefix: "TICKET-".into(),
                    url_template: "https://issues.example.com/TICKET-<num>".into(),
                    is_alphanumeric: true,
                },
            })
            .await
            .unwrap();
        mutator
            .apply(&Command::DeleteRepositoryAutolink {
                repo: "repo1".into(),
                key_prefix: "OLD-".into(),
                id: Some(7),
            })
            .await
            .unwrap();

        let autolinks = snapshot.repositories.value["repo1"]
            .autolinks
            .peek()
            .expect("stays materialized");
        assert!(!autolinks.contains_key("OLD-"));
        // The stored entry carries the id the platform assigned.
        assert_eq!(autolinks["TICKET-"].id, Some(99));
        assert!(autolinks["TICKET-"].is_alphanumeric);
    }

    #[test]
    fn ruleset_payload_prefixes_and_resolves() {
        let ruleset = GithubRuleset {
            name: "default".into(),
            id: None,
            enforcement: "active".into(),
            bypass_apps: BTreeSet::from(["goliac-app".to_string()]),
            bypass_teams: BTreeSet::from(["sre".to_string()]),
            include: vec![DEFAULT_BRANCH_PATTERN.into(), "release/*".into()],
            exclude: vec!["wip/*".into()],
            rules: BTreeMap::from([
                ("required_signatures".to_string(), RuleParameters::default()),
                (
                    "PULL_REQUEST".to_string(),
                    RuleParameters {
                        required_approving_review_count: 2,
                        ..Default::default()
                    },
                ),
            ]),
            repositories: BTreeSet::from(["repo1".to_string()]),
        };

        let app_ids = BTreeMap::from([("goliac-app".to_string(), 1001u64)]);
        let teams = BTreeMap::from([(
            "sre".to_string(),
            GithubTeam {
                name: "sre".into(),
                slug: "sre".into(),
                id: Some(2002),
                ..Default::default()
            },
        )]);

        let payload =
            build_ruleset_payload(&ruleset, RulesetScope::Organization, &app_ids, &teams);

        assert_eq!(payload["enforcement"], "active");
        assert_eq!(
            payload["conditions"]["ref_name"]["include"],
            json!(["~DEFAULT_BRANCH", "refs/heads/release/*"])
        );
        assert_eq!(
            payload["conditions"]["ref_name"]["exclude"],
            json!(["refs/heads/wip/*"])
        );
        assert_eq!(
            payload["conditions"]["repository_name"]["include"],
            json!(["repo1"])
        );
        assert_eq!(
            payload["bypass_actors"],
            json!([
                {"actor_id": 1001, "actor_type": "Integration", "bypass_mode": "always"},
                {"actor_id": 2002, "actor_type": "Team", "bypass_mode": "always"},
            ])
        );
        // Rule types come out lower-cased.
        let types: Vec<&str> = payload["rules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["pull_request", "required_signatures"]);
    }

    #[test]
    fn repository_scope_omits_repository_conditions() {
        let ruleset = GithubRuleset {
            name: "repo-rs".into(),
            enforcement: "evaluate".into(),
            include: vec!["main".into()],
            ..Default::default()
        };
        let payload = build_ruleset_payload(
            &ruleset,
            RulesetScope::Repository,
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert!(payload["conditions"].get("repository_name").is_none());
        assert_eq!(
            payload["conditions"]["ref_name"]["include"],
            json!(["refs/heads/main"])
        );
    }
}

//! Projection of the validated entities into the comparable shapes the
//! reconciliator diffs against the shadow.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::{
    config::RepoConfig,
    entity::{
        EVERYONE_TEAM, loader::Entities, repository::Repository, ruleset::{Rule, RulesetDefinition},
        slugify,
    },
    remote::types::{
        GithubAutolink, GithubBranchProtection, GithubEnvironment, GithubRuleset, GithubTeam,
        RuleParameters,
    },
};

/// A repository as desired, with every sub-collection materialized.
#[derive(Clone, Debug, Default)]
pub(crate) struct DesiredRepo {
    pub(crate) name: String,
    pub(crate) visibility: String,
    pub(crate) default_branch: String,
    pub(crate) bool_properties: BTreeMap<String, bool>,
    /// Team slugs with push access (the owning team included).
    pub(crate) writers: BTreeSet<String>,
    /// Team slugs with pull access.
    pub(crate) readers: BTreeSet<String>,
    /// External collaborator login -> `pull` or `push`.
    pub(crate) external_users: BTreeMap<String, String>,
    pub(crate) rulesets: BTreeMap<String, GithubRuleset>,
    pub(crate) branch_protections: BTreeMap<String, GithubBranchProtection>,
    pub(crate) environments: BTreeMap<String, GithubEnvironment>,
    pub(crate) variables: BTreeMap<String, String>,
    /// `None` leaves autolinks unmanaged for this repository.
    pub(crate) autolinks: Option<BTreeMap<String, GithubAutolink>>,
    pub(crate) rename_to: Option<String>,
    pub(crate) fork_from: Option<String>,
}

/// The desired snapshot, shaped for diffing.
#[derive(Clone, Debug, Default)]
pub(crate) struct DesiredState {
    /// Platform login -> canonical entity name.
    pub(crate) users: BTreeMap<String, String>,
    /// Team slug -> team.
    pub(crate) teams: BTreeMap<String, GithubTeam>,
    /// Repository name -> repository.
    pub(crate) repositories: BTreeMap<String, DesiredRepo>,
    /// Organization ruleset name -> ruleset.
    pub(crate) rulesets: BTreeMap<String, GithubRuleset>,
}

impl DesiredState {
    pub(crate) fn build(entities: &Entities, config: &RepoConfig) -> Self {
        let mut state = Self::default();

        for user in entities.users.values() {
            state
                .users
                .insert(user.github_id.clone(), user.name.clone());
        }

        // Canonical name -> login, for membership resolution.
        let login_of = |name: &str| -> Option<String> {
            entities
                .users
                .get(name)
                .map(|user| user.github_id.clone())
        };
        let external_login_of = |name: &str| -> Option<String> {
            entities
                .external_users
                .get(name)
                .map(|user| user.github_id.clone())
        };

        for team in entities.teams.values() {
            let members: BTreeSet<String> = team
                .all_members()
                .iter()
                .filter_map(|name| login_of(name))
                .collect();
            state.teams.insert(
                team.slug(),
                GithubTeam {
                    name: team.name.clone(),
                    slug: team.slug(),
                    id: None,
                    members,
                    maintainers: BTreeSet::new(),
                    parent_slug: team.parent_team.as_deref().map(slugify),
                    externally_managed: team.externally_managed,
                },
            );
        }

        for repo in entities.repositories.values() {
            state
                .repositories
                .insert(repo.name.clone(), desired_repo(repo, config));
        }

        for binding in &config.rulesets {
            let Some(ruleset) = entities.rulesets.get(&binding.ruleset) else {
                continue;
            };
            let mut projected = ruleset_from_definition(&ruleset.name, &ruleset.definition);
            if let Ok(pattern) = Regex::new(&binding.pattern) {
                projected.repositories.extend(
                    entities
                        .repositories
                        .keys()
                        .filter(|name| pattern.is_match(name))
                        .cloned(),
                );
            }
            state
                .rulesets
                .entry(projected.name.clone())
                .and_modify(|existing| {
                    existing
                        .repositories
                        .extend(projected.repositories.iter().cloned())
                })
                .or_insert(projected);
        }

        // External collaborators resolve through their declared entities.
        for (name, desired) in &mut state.repositories {
            let Some(repo) = entities.repositories.get(name) else {
                continue;
            };
            for reader in &repo.spec.external_user_readers {
                if let Some(login) = external_login_of(reader) {
                    desired.external_users.insert(login, "pull".into());
                }
            }
            for writer in &repo.spec.external_user_writers {
                if let Some(login) = external_login_of(writer) {
                    desired.external_users.insert(login, "push".into());
                }
            }
        }

        state
    }
}

fn desired_repo(repo: &Repository, config: &RepoConfig) -> DesiredRepo {
    let mut writers: BTreeSet<String> = repo.spec.writers.iter().map(|t| slugify(t)).collect();
    if let Some(owner) = &repo.owner {
        writers.insert(slugify(owner));
    }
    let mut readers: BTreeSet<String> = repo
        .spec
        .readers
        .iter()
        .map(|t| slugify(t))
        .filter(|slug| !writers.contains(slug))
        .collect();
    if config.everyone_team_enabled {
        readers.insert(EVERYONE_TEAM.into());
    }

    DesiredRepo {
        name: repo.name.clone(),
        visibility: repo.spec.visibility.as_str().into(),
        default_branch: repo
            .spec
            .default_branch_name
            .clone()
            .unwrap_or_else(|| "main".into()),
        bool_properties: repo.bool_properties(),
        writers,
        readers,
        external_users: BTreeMap::new(),
        rulesets: repo
            .spec
            .rulesets
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    ruleset_from_definition(&r.name, &r.definition),
                )
            })
            .collect(),
        branch_protections: repo
            .spec
            .branch_protections
            .iter()
            .map(|p| {
                (
                    p.pattern.clone(),
                    GithubBranchProtection {
                        id: None,
                        protection: p.clone(),
                    },
                )
            })
            .collect(),
        environments: repo
            .spec
            .environments
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    GithubEnvironment {
                        name: e.name.clone(),
                        variables: e.variables.clone(),
                    },
                )
            })
            .collect(),
        variables: repo.spec.actions_variables.clone(),
        autolinks: repo.spec.autolinks.as_ref().map(|links| {
            links
                .iter()
                .map(|a| {
                    (
                        a.key_prefix.clone(),
                        GithubAutolink {
                            id: None,
                            key_prefix: a.key_prefix.clone(),
                            url_template: a.url_template.clone(),
                            is_alphanumeric: a.is_alphanumeric,
                        },
                    )
                })
                .collect()
        }),
        rename_to: repo.rename_to.clone(),
        fork_from: repo.fork_from.clone(),
    }
}

/// Projects a YAML ruleset definition into the comparable shape.
pub(crate) fn ruleset_from_definition(name: &str, definition: &RulesetDefinition) -> GithubRuleset {
    let mut rules = BTreeMap::new();
    for rule in &definition.rules {
        let params = match rule {
            Rule::PullRequest {
                dismiss_stale_reviews_on_push,
                require_code_owner_review,
                required_approving_review_count,
                require_last_push_approval,
                required_review_thread_resolution,
            } => RuleParameters {
                dismiss_stale_reviews_on_push: *dismiss_stale_reviews_on_push,
                require_code_owner_review: *require_code_owner_review,
                required_approving_review_count: *required_approving_review_count,
                require_last_push_approval: *require_last_push_approval,
                required_review_thread_resolution: *required_review_thread_resolution,
                ..Default::default()
            },
            Rule::RequiredStatusChecks { contexts, strict } => RuleParameters {
                required_status_check_contexts: contexts.clone(),
                strict_required_status_checks_policy: *strict,
                ..Default::default()
            },
            _ => RuleParameters::default(),
        };
        rules.insert(rule.rule_type().to_string(), params);
    }

    GithubRuleset {
        name: name.to_string(),
        id: None,
        enforcement: definition.enforcement.as_str().to_string(),
        bypass_apps: definition.bypass_apps.iter().cloned().collect(),
        bypass_teams: definition.bypass_teams.iter().cloned().collect(),
        include: definition.conditions.include.clone(),
        exclude: definition.conditions.exclude.clone(),
        rules,
        repositories: BTreeSet::new(),
    }
}

//! Normalized shapes shared by the two sides of the diff.
//!
//! The loader projects desired entities into these types and the snapshot
//! projects API payloads into them, so the reconciliator compares like
//! with like. Remote-only identifiers (`id`, node ids) are carried along
//! but excluded from equivalence.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    entity::ruleset::BranchProtection,
    remote::lazy::MappedEntityLazyLoader,
};

pub(crate) use crate::entity::ruleset::{ALL_BRANCHES_PATTERN, DEFAULT_BRANCH_PATTERN};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct GithubTeam {
    pub(crate) name: String,
    pub(crate) slug: String,
    /// Remote team id; desired teams have none.
    pub(crate) id: Option<u64>,
    /// Member logins, maintainers excluded.
    pub(crate) members: BTreeSet<String>,
    /// Maintainer logins.
    pub(crate) maintainers: BTreeSet<String>,
    pub(crate) parent_slug: Option<String>,
    /// Desired-side flag: membership is authoritative on the platform.
    pub(crate) externally_managed: bool,
}

impl GithubTeam {
    /// Every login attached to the team regardless of role.
    pub(crate) fn logins(&self) -> BTreeSet<String> {
        self.members.union(&self.maintainers).cloned().collect()
    }
}

/// Parameters attached to a ruleset rule. One struct covers every typed
/// rule; rules without parameters leave it defaulted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RuleParameters {
    pub(crate) dismiss_stale_reviews_on_push: bool,
    pub(crate) require_code_owner_review: bool,
    pub(crate) required_approving_review_count: u32,
    pub(crate) require_last_push_approval: bool,
    pub(crate) required_review_thread_resolution: bool,
    pub(crate) required_status_check_contexts: Vec<String>,
    pub(crate) strict_required_status_checks_policy: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct GithubRuleset {
    pub(crate) name: String,
    /// Remote ruleset id; desired rulesets have none.
    pub(crate) id: Option<u64>,
    pub(crate) enforcement: String,
    pub(crate) bypass_apps: BTreeSet<String>,
    pub(crate) bypass_teams: BTreeSet<String>,
    /// Ref patterns, with any `refs/heads/` prefix stripped.
    pub(crate) include: Vec<String>,
    pub(crate) exclude: Vec<String>,
    /// Canonical rule type -> parameters.
    pub(crate) rules: BTreeMap<String, RuleParameters>,
    /// Organization-level only: targeted repository names.
    pub(crate) repositories: BTreeSet<String>,
}

impl GithubRuleset {
    /// Equivalence for diffing, ignoring the remote id.
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        self.name == other.name
            && self.enforcement == other.enforcement
            && self.bypass_apps == other.bypass_apps
            && self.bypass_teams == other.bypass_teams
            && self.include == other.include
            && self.exclude == other.exclude
            && self.rules == other.rules
            && self.repositories == other.repositories
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct GithubBranchProtection {
    /// Remote node id; desired protections have none.
    pub(crate) id: Option<String>,
    pub(crate) protection: BranchProtection,
}

impl GithubBranchProtection {
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        self.protection == other.protection
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct GithubEnvironment {
    pub(crate) name: String,
    pub(crate) variables: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct GithubAutolink {
    /// Remote autolink id; desired autolinks have none.
    pub(crate) id: Option<u64>,
    pub(crate) key_prefix: String,
    pub(crate) url_template: String,
    pub(crate) is_alphanumeric: bool,
}

impl GithubAutolink {
    pub(crate) fn same_as(&self, other: &Self) -> bool {
        self.key_prefix == other.key_prefix
            && self.url_template == other.url_template
            && self.is_alphanumeric == other.is_alphanumeric
    }
}

/// A repository as observed remotely (or shaped from desired state).
#[derive(Clone, Debug)]
pub(crate) struct GithubRepository {
    pub(crate) name: String,
    /// Remote database id.
    pub(crate) id: Option<u64>,
    /// Remote GraphQL node id.
    pub(crate) ref_id: Option<String>,
    /// Lower-case visibility (`public`, `private`, `internal`).
    pub(crate) visibility: String,
    pub(crate) default_branch: String,
    pub(crate) is_fork: bool,
    /// Desired-side only: source of a fork to create.
    pub(crate) fork_from: Option<String>,
    pub(crate) bool_properties: BTreeMap<String, bool>,
    /// Outside collaborator login -> `pull` or `push`.
    pub(crate) external_users: BTreeMap<String, String>,
    /// Rulesets by name; loaded by the snapshot worker pool.
    pub(crate) rulesets: BTreeMap<String, GithubRuleset>,
    /// Branch protections by pattern; loaded by the worker pool.
    pub(crate) branch_protections: BTreeMap<String, GithubBranchProtection>,
    /// Deferred detail fetches.
    pub(crate) environments: Arc<MappedEntityLazyLoader<GithubEnvironment>>,
    pub(crate) variables: Arc<MappedEntityLazyLoader<String>>,
    pub(crate) autolinks: Arc<MappedEntityLazyLoader<GithubAutolink>>,
}

impl Default for GithubRepository {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: None,
            ref_id: None,
            visibility: "private".into(),
            default_branch: "main".into(),
            is_fork: false,
            fork_from: None,
            bool_properties: BTreeMap::new(),
            external_users: BTreeMap::new(),
            rulesets: BTreeMap::new(),
            branch_protections: BTreeMap::new(),
            environments: Arc::new(MappedEntityLazyLoader::ready(BTreeMap::new())),
            variables: Arc::new(MappedEntityLazyLoader::ready(BTreeMap::new())),
            autolinks: Arc::new(MappedEntityLazyLoader::ready(BTreeMap::new())),
        }
    }
}

/// Team-repository permissions normalized to REST-style strings.
pub(crate) fn normalize_permission(graphql_permission: &str) -> String {
    match graphql_permission {
        "READ" => "pull".into(),
        "TRIAGE" => "triage".into(),
        "WRITE" => "push".into(),
        "MAINTAIN" => "maintain".into(),
        "ADMIN" => "admin".into(),
        other => other.to_ascii_lowercase(),
    }
}

/// Strips the `refs/heads/` prefix the API adds to non-reserved patterns.
pub(crate) fn strip_ref_prefix(pattern: &str) -> String {
    pattern
        .strip_prefix("refs/heads/")
        .unwrap_or(pattern)
        .to_string()
}

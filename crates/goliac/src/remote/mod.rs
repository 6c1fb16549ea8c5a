//! The observed side of the diff: a TTL-cached snapshot of the live
//! GitHub organization.
//!
//! `RemoteSnapshot::load` populates six caches (users, teams,
//! team-repositories, repositories, organization rulesets, installed-app
//! ids), each with its own expiry. List queries use cursor pagination at
//! 100 items a page with a 100-page safety ceiling; per-team and per-repo
//! detail fetches run on a bounded worker pool.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::github::{GithubError, GithubTransport, MAX_PAGES, PAGE_SIZE, graphql_data, rest_paginate};

pub(crate) mod lazy;
pub(crate) mod mutator;
pub(crate) mod shadow;
pub(crate) mod types;

use lazy::MappedEntityLazyLoader;
use types::{
    GithubAutolink, GithubBranchProtection, GithubEnvironment, GithubRepository, GithubRuleset,
    GithubTeam, RuleParameters, normalize_permission, strip_ref_prefix,
};

/// A value with an independent expiry instant.
#[derive(Clone, Debug)]
pub(crate) struct TtlCache<T> {
    pub(crate) value: T,
    ttl_expire: Option<Instant>,
}

impl<T: Default> Default for TtlCache<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            ttl_expire: None,
        }
    }
}

impl<T> TtlCache<T> {
    pub(crate) fn expired(&self) -> bool {
        match self.ttl_expire {
            Some(expire) => Instant::now() >= expire,
            None => true,
        }
    }

    pub(crate) fn fill(&mut self, value: T, ttl: Duration) {
        self.value = value;
        self.ttl_expire = Some(Instant::now() + ttl);
    }

    pub(crate) fn flush(&mut self) {
        self.ttl_expire = None;
    }
}

pub(crate) struct RemoteSnapshot {
    transport: Arc<dyn GithubTransport>,
    org: String,
    /// Worker pool size for detail fetches; 1 means strictly sequential.
    concurrency: usize,
    ttl: Duration,

    /// login -> organization role (`ADMIN` or `MEMBER`).
    pub(crate) users: TtlCache<BTreeMap<String, String>>,
    /// slug -> team.
    pub(crate) teams: TtlCache<BTreeMap<String, GithubTeam>>,
    /// team slug -> repository name -> permission.
    pub(crate) team_repos: TtlCache<BTreeMap<String, BTreeMap<String, String>>>,
    /// name -> repository.
    pub(crate) repositories: TtlCache<BTreeMap<String, GithubRepository>>,
    /// GraphQL node id -> repository name.
    pub(crate) repositories_by_ref_id: BTreeMap<String, String>,
    /// name -> organization ruleset.
    pub(crate) rulesets: TtlCache<BTreeMap<String, GithubRuleset>>,
    /// app slug -> app id.
    pub(crate) app_ids: TtlCache<BTreeMap<String, u64>>,

    /// Whether the organization is on an enterprise plan.
    pub(crate) is_enterprise: bool,
}

impl RemoteSnapshot {
    pub(crate) fn new(
        transport: Arc<dyn GithubTransport>,
        org: impl Into<String>,
        concurrency: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            transport,
            org: org.into(),
            concurrency: concurrency.max(1),
            ttl,
            users: TtlCache::default(),
            teams: TtlCache::default(),
            team_repos: TtlCache::default(),
            repositories: TtlCache::default(),
            repositories_by_ref_id: BTreeMap::new(),
            rulesets: TtlCache::default(),
            app_ids: TtlCache::default(),
            is_enterprise: false,
        }
    }

    pub(crate) fn org(&self) -> &str {
        &self.org
    }

    /// Worker pool size comes from `goliac.yaml`, which is only known
    /// once a cycle has a worktree; the orchestrator sets it per cycle.
    pub(crate) fn set_concurrency(&mut self, workers: usize) {
        self.concurrency = workers.max(1);
    }

    pub(crate) fn transport(&self) -> &Arc<dyn GithubTransport> {
        &self.transport
    }

    /// Marks every cache as expired so that the next `load` refetches.
    pub(crate) fn flush_caches(&mut self) {
        self.users.flush();
        self.teams.flush();
        self.team_repos.flush();
        self.repositories.flush();
        self.rulesets.flush();
        self.app_ids.flush();
    }

    /// Refreshes every expired cache. With `continue_on_error`, failures
    /// of individual caches are collected and returned instead of
    /// aborting the load.
    #[instrument(skip(self))]
    pub(crate) async fn load(
        &mut self,
        continue_on_error: bool,
    ) -> Result<Vec<GithubError>, GithubError> {
        let mut swallowed = Vec::new();

        macro_rules! step {
            ($expr:expr) => {
                match $expr {
                    Ok(()) => {}
                    Err(e) if continue_on_error => {
                        tracing::warn!("snapshot load step failed: {e}");
                        swallowed.push(e);
                    }
                    Err(e) => return Err(e),
                }
            };
        }

        step!(self.load_enterprise_plan().await);
        step!(self.load_app_ids().await);
        step!(self.load_users().await);
        step!(self.load_teams().await);
        step!(self.load_team_repos().await);
        step!(self.load_repositories().await);
        step!(self.load_rulesets().await);

        Ok(swallowed)
    }

    async fn load_enterprise_plan(&mut self) -> Result<(), GithubError> {
        #[derive(Deserialize)]
        struct Org {
            #[serde(default)]
            plan: Option<Plan>,
        }
        #[derive(Deserialize)]
        struct Plan {
            name: String,
        }

        let raw = self
            .transport
            .call_rest(Method::GET, &format!("/orgs/{org}", org = self.org), None)
            .await?;
        let org: Org = serde_json::from_slice(&raw)?;
        self.is_enterprise = org.plan.is_some_and(|p| p.name == "enterprise");
        Ok(())
    }

    async fn load_app_ids(&mut self) -> Result<(), GithubError> {
        if !self.app_ids.expired() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct Installations {
            #[serde(default)]
            installations: Vec<Installation>,
        }
        #[derive(Deserialize)]
        struct Installation {
            app_id: u64,
            app_slug: String,
        }

        let mut apps = BTreeMap::new();
        for page in 1..=MAX_PAGES {
            let endpoint = format!(
                "/orgs/{org}/installations?per_page={PAGE_SIZE}&page={page}",
                org = self.org
            );
            let raw = self.transport.call_rest(Method::GET, &endpoint, None).await?;
            let batch: Installations = serde_json::from_slice(&raw)?;
            let done = batch.installations.len() < PAGE_SIZE;
            for install in batch.installations {
                apps.insert(install.app_slug, install.app_id);
            }
            if done {
                break;
            }
        }

        self.app_ids.fill(apps, self.ttl);
        Ok(())
    }

    async fn load_users(&mut self) -> Result<(), GithubError> {
        if !self.users.expired() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct Data {
            organization: OrgMembers,
        }
        #[derive(Deserialize)]
        struct OrgMembers {
            #[serde(rename = "membersWithRole")]
            members_with_role: Connection,
        }
        #[derive(Deserialize)]
        struct Connection {
            edges: Vec<Edge>,
            #[serde(rename = "pageInfo")]
            page_info: PageInfo,
        }
        #[derive(Deserialize)]
        struct Edge {
            role: String,
            node: Node,
        }
        #[derive(Deserialize)]
        struct Node {
            login: String,
        }

        const QUERY: &str = r#"
query listMembers($login: String!, $endCursor: String) {
  organization(login: $login) {
    membersWithRole(first: 100, after: $endCursor) {
      edges {
        role
        node { login }
      }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

        let mut users = BTreeMap::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let raw = self
                .transport
                .query_graphql(QUERY, json!({ "login": self.org, "endCursor": cursor }))
                .await?;
            let data: Data = graphql_data(&raw)?;
            let connection = data.organization.members_with_role;
            for edge in connection.edges {
                users.insert(edge.node.login, edge.role);
            }
            if !connection.page_info.has_next_page {
                self.users.fill(users, self.ttl);
                return Ok(());
            }
            cursor = connection.page_info.end_cursor;
        }
        Err(GithubError::PaginationOverflow("listMembers".into()))
    }

    async fn load_teams(&mut self) -> Result<(), GithubError> {
        if !self.teams.expired() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct Data {
            organization: OrgTeams,
        }
        #[derive(Deserialize)]
        struct OrgTeams {
            teams: Connection,
        }
        #[derive(Deserialize)]
        struct Connection {
            nodes: Vec<TeamNode>,
            #[serde(rename = "pageInfo")]
            page_info: PageInfo,
        }
        #[derive(Deserialize)]
        struct TeamNode {
            name: String,
            slug: String,
            #[serde(rename = "databaseId")]
            database_id: Option<u64>,
            #[serde(rename = "parentTeam")]
            parent_team: Option<ParentTeam>,
        }
        #[derive(Deserialize)]
        struct ParentTeam {
            slug: String,
        }

        const QUERY: &str = r#"
query listTeams($login: String!, $endCursor: String) {
  organization(login: $login) {
    teams(first: 100, after: $endCursor) {
      nodes {
        name
        slug
        databaseId
        parentTeam { slug }
      }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

        let mut teams = BTreeMap::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(GithubError::PaginationOverflow("listTeams".into()));
            }
            let raw = self
                .transport
                .query_graphql(QUERY, json!({ "login": self.org, "endCursor": cursor }))
                .await?;
            let data: Data = graphql_data(&raw)?;
            let connection = data.organization.teams;
            for node in connection.nodes {
                teams.insert(
                    node.slug.clone(),
                    GithubTeam {
                        name: node.name,
                        slug: node.slug,
                        id: node.database_id,
                        members: Default::default(),
                        maintainers: Default::default(),
                        parent_slug: node.parent_team.map(|p| p.slug),
                        externally_managed: false,
                    },
                );
            }
            if !connection.page_info.has_next_page {
                break;
            }
            cursor = connection.page_info.end_cursor;
        }

        // Membership detail, one team at a time on the worker pool.
        #[derive(Deserialize)]
        struct Member {
            login: String,
        }

        let slugs: Vec<String> = teams.keys().cloned().collect();
        let transport = self.transport.clone();
        let org = self.org.clone();
        let memberships = fan_out(slugs, self.concurrency, move |slug| {
            let transport = transport.clone();
            let org = org.clone();
            async move {
                let mut roles: Vec<(String, Vec<String>)> = Vec::new();
                for role in ["member", "maintainer"] {
                    let endpoint = format!("/orgs/{org}/teams/{slug}/members");
                    let mut logins = Vec::new();
                    for page in 1..=MAX_PAGES {
                        let paged =
                            format!("{endpoint}?role={role}&per_page={PAGE_SIZE}&page={page}");
                        let raw = transport.call_rest(Method::GET, &paged, None).await?;
                        let members: Vec<Member> = serde_json::from_slice(&raw)?;
                        let done = members.len() < PAGE_SIZE;
                        logins.extend(members.into_iter().map(|m| m.login));
                        if done {
                            break;
                        }
                    }
                    roles.push((role.to_string(), logins));
                }
                Ok((slug, roles))
            }
        })
        .await?;

        for (slug, roles) in memberships {
            if let Some(team) = teams.get_mut(&slug) {
                for (role, logins) in roles {
                    match role.as_str() {
                        "maintainer" => team.maintainers = logins.into_iter().collect(),
                        _ => team.members = logins.into_iter().collect(),
                    }
                }
                // The REST members listing includes maintainers; keep the
                // two sets disjoint.
                team.members = team
                    .members
                    .difference(&team.maintainers)
                    .cloned()
                    .collect();
            }
        }

        self.teams.fill(teams, self.ttl);
        Ok(())
    }

    async fn load_team_repos(&mut self) -> Result<(), GithubError> {
        if !self.team_repos.expired() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct Data {
            organization: OrgTeam,
        }
        #[derive(Deserialize)]
        struct OrgTeam {
            team: Option<TeamRepos>,
        }
        #[derive(Deserialize)]
        struct TeamRepos {
            repositories: Connection,
        }
        #[derive(Deserialize)]
        struct Connection {
            edges: Vec<Edge>,
            #[serde(rename = "pageInfo")]
            page_info: PageInfo,
        }
        #[derive(Deserialize)]
        struct Edge {
            permission: String,
            node: Node,
        }
        #[derive(Deserialize)]
        struct Node {
            name: String,
        }

        const QUERY: &str = r#"
query listTeamRepositories($login: String!, $slug: String!, $endCursor: String) {
  organization(login: $login) {
    team(slug: $slug) {
      repositories(first: 100, after: $endCursor) {
        edges {
          permission
          node { name }
        }
        pageInfo { hasNextPage endCursor }
      }
    }
  }
}"#;

        let slugs: Vec<String> = self.teams.value.keys().cloned().collect();
        let transport = self.transport.clone();
        let org = self.org.clone();
        let all = fan_out(slugs, self.concurrency, move |slug| {
            let transport = transport.clone();
            let org = org.clone();
            async move {
                let mut repos = BTreeMap::new();
                let mut cursor: Option<String> = None;
                for _ in 0..MAX_PAGES {
                    let raw = transport
                        .query_graphql(
                            QUERY,
                            json!({ "login": org, "slug": slug, "endCursor": cursor }),
                        )
                        .await?;
                    let data: Data = graphql_data(&raw)?;
                    let Some(team) = data.organization.team else {
                        break;
                    };
                    for edge in team.repositories.edges {
                        repos.insert(edge.node.name, normalize_permission(&edge.permission));
                    }
                    if !team.repositories.page_info.has_next_page {
                        break;
                    }
                    cursor = team.repositories.page_info.end_cursor;
                }
                Ok((slug, repos))
            }
        })
        .await?;

        self.team_repos
            .fill(all.into_iter().collect(), self.ttl);
        Ok(())
    }

    async fn load_repositories(&mut self) -> Result<(), GithubError> {
        if !self.repositories.expired() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct Data {
            organization: OrgRepos,
        }
        #[derive(Deserialize)]
        struct OrgRepos {
            repositories: Connection,
        }
        #[derive(Deserialize)]
        struct Connection {
            nodes: Vec<RepoNode>,
            #[serde(rename = "pageInfo")]
            page_info: PageInfo,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RepoNode {
            name: String,
            id: String,
            database_id: Option<u64>,
            visibility: String,
            is_archived: bool,
            is_fork: bool,
            auto_merge_allowed: bool,
            delete_branch_on_merge: bool,
            allow_update_branch: bool,
            default_branch_ref: Option<BranchRef>,
        }
        #[derive(Deserialize)]
        struct BranchRef {
            name: String,
        }

        const QUERY: &str = r#"
query listRepositories($login: String!, $endCursor: String) {
  organization(login: $login) {
    repositories(first: 100, after: $endCursor) {
      nodes {
        name
        id
        databaseId
        visibility
        isArchived
        isFork
        autoMergeAllowed
        deleteBranchOnMerge
        allowUpdateBranch
        defaultBranchRef { name }
      }
      pageInfo { hasNextPage endCursor }
    }
  }
}"#;

        let mut repos = BTreeMap::new();
        let mut by_ref_id = BTreeMap::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(GithubError::PaginationOverflow("listRepositories".into()));
            }
            let raw = self
                .transport
                .query_graphql(QUERY, json!({ "login": self.org, "endCursor": cursor }))
                .await?;
            let data: Data = graphql_data(&raw)?;
            let connection = data.organization.repositories;
            for node in connection.nodes {
                by_ref_id.insert(node.id.clone(), node.name.clone());
                let repo = GithubRepository {
                    name: node.name.clone(),
                    id: node.database_id,
                    ref_id: Some(node.id),
                    visibility: node.visibility.to_ascii_lowercase(),
                    default_branch: node
                        .default_branch_ref
                        .map(|r| r.name)
                        .unwrap_or_else(|| "main".to_string()),
                    is_fork: node.is_fork,
                    fork_from: None,
                    bool_properties: BTreeMap::from([
                        ("allow_auto_merge".to_string(), node.auto_merge_allowed),
                        (
                            "delete_branch_on_merge".to_string(),
                            node.delete_branch_on_merge,
                        ),
                        ("allow_update_branch".to_string(), node.allow_update_branch),
                        ("archived".to_string(), node.is_archived),
                    ]),
                    external_users: BTreeMap::new(),
                    rulesets: BTreeMap::new(),
                    branch_protections: BTreeMap::new(),
                    environments: self.environments_loader(&node.name),
                    variables: self.variables_loader(&node.name),
                    autolinks: self.autolinks_loader(&node.name),
                };
                repos.insert(node.name, repo);
            }
            if !connection.page_info.has_next_page {
                break;
            }
            cursor = connection.page_info.end_cursor;
        }

        // Per-repo details on the worker pool: outside collaborators,
        // rulesets, branch protections.
        let names: Vec<String> = repos.keys().cloned().collect();
        let transport = self.transport.clone();
        let org = self.org.clone();
        let app_by_id: BTreeMap<u64, String> = self
            .app_ids
            .value
            .iter()
            .map(|(slug, id)| (*id, slug.clone()))
            .collect();
        let team_by_id: BTreeMap<u64, String> = self
            .teams
            .value
            .values()
            .filter_map(|t| t.id.map(|id| (id, t.slug.clone())))
            .collect();

        let details = fan_out(names, self.concurrency, move |name| {
            let transport = transport.clone();
            let org = org.clone();
            let app_by_id = app_by_id.clone();
            let team_by_id = team_by_id.clone();
            async move {
                let externals = fetch_external_users(transport.as_ref(), &org, &name).await?;
                let rulesets =
                    fetch_repo_rulesets(transport.as_ref(), &org, &name, &app_by_id, &team_by_id)
                        .await?;
                let protections =
                    fetch_branch_protections(transport.as_ref(), &org, &name).await?;
                Ok((name, externals, rulesets, protections))
            }
        })
        .await?;

        for (name, externals, rulesets, protections) in details {
            if let Some(repo) = repos.get_mut(&name) {
                repo.external_users = externals;
                repo.rulesets = rulesets;
                repo.branch_protections = protections;
            }
        }

        self.repositories_by_ref_id = by_ref_id;
        self.repositories.fill(repos, self.ttl);
        Ok(())
    }

    async fn load_rulesets(&mut self) -> Result<(), GithubError> {
        if !self.rulesets.expired() {
            return Ok(());
        }
        if !self.is_enterprise {
            // Organization rulesets are an enterprise feature.
            self.rulesets.fill(BTreeMap::new(), self.ttl);
            return Ok(());
        }

        let app_by_id: BTreeMap<u64, String> = self
            .app_ids
            .value
            .iter()
            .map(|(slug, id)| (*id, slug.clone()))
            .collect();
        let team_by_id: BTreeMap<u64, String> = self
            .teams
            .value
            .values()
            .filter_map(|t| t.id.map(|id| (id, t.slug.clone())))
            .collect();

        let listing = rest_paginate(
            self.transport.as_ref(),
            &format!("/orgs/{org}/rulesets", org = self.org),
        )
        .await?;

        let mut rulesets = BTreeMap::new();
        for item in listing {
            let Some(id) = item.get("id").and_then(|v| v.as_u64()) else {
                continue;
            };
            let raw = self
                .transport
                .call_rest(
                    Method::GET,
                    &format!("/orgs/{org}/rulesets/{id}", org = self.org),
                    None,
                )
                .await?;
            let detail: serde_json::Value = serde_json::from_slice(&raw)?;
            let ruleset = parse_ruleset(&detail, &app_by_id, &team_by_id);
            rulesets.insert(ruleset.name.clone(), ruleset);
        }

        self.rulesets.fill(rulesets, self.ttl);
        Ok(())
    }

    fn environments_loader(&self, repo: &str) -> Arc<MappedEntityLazyLoader<GithubEnvironment>> {
        let transport = self.transport.clone();
        let org = self.org.clone();
        let repo = repo.to_string();
        Arc::new(MappedEntityLazyLoader::new(Box::new(move || {
            let transport = transport.clone();
            let org = org.clone();
            let repo = repo.clone();
            Box::pin(async move { fetch_environments(transport.as_ref(), &org, &repo).await })
        })))
    }

    fn variables_loader(&self, repo: &str) -> Arc<MappedEntityLazyLoader<String>> {
        let transport = self.transport.clone();
        let org = self.org.clone();
        let repo = repo.to_string();
        Arc::new(MappedEntityLazyLoader::new(Box::new(move || {
            let transport = transport.clone();
            let org = org.clone();
            let repo = repo.clone();
            Box::pin(async move {
                fetch_variables(
                    transport.as_ref(),
                    &format!("/repos/{org}/{repo}/actions/variables"),
                )
                .await
            })
        })))
    }

    fn autolinks_loader(&self, repo: &str) -> Arc<MappedEntityLazyLoader<GithubAutolink>> {
        let transport = self.transport.clone();
        let org = self.org.clone();
        let repo = repo.to_string();
        Arc::new(MappedEntityLazyLoader::new(Box::new(move || {
            let transport = transport.clone();
            let org = org.clone();
            let repo = repo.clone();
            Box::pin(async move { fetch_autolinks(transport.as_ref(), &org, &repo).await })
        })))
    }
}

#[derive(Deserialize)]
struct PageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

/// Runs `job` over `items` with at most `workers` in flight. The first
/// error cancels the fan-out; remaining in-flight jobs are drained by
/// drop.
async fn fan_out<T, R, F, Fut>(
    items: Vec<T>,
    workers: usize,
    job: F,
) -> Result<Vec<R>, GithubError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, GithubError>>,
{
    stream::iter(items.into_iter().map(job))
        .buffer_unordered(workers.max(1))
        .try_collect()
        .await
}

async fn fetch_external_users(
    transport: &dyn GithubTransport,
    org: &str,
    repo: &str,
) -> Result<BTreeMap<String, String>, GithubError> {
    #[derive(Deserialize)]
    struct Collaborator {
        login: String,
        #[serde(default)]
        permissions: Permissions,
    }
    #[derive(Deserialize, Default)]
    struct Permissions {
        #[serde(default)]
        push: bool,
    }

    let mut externals = BTreeMap::new();
    for page in 1..=MAX_PAGES {
        let endpoint = format!(
            "/repos/{org}/{repo}/collaborators?affiliation=outside&per_page={PAGE_SIZE}&page={page}"
        );
        let raw = match transport.call_rest(Method::GET, &endpoint, None).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(externals),
            Err(e) => return Err(e),
        };
        let items: Vec<Collaborator> = serde_json::from_slice(&raw)?;
        let done = items.len() < PAGE_SIZE;
        for collaborator in items {
            let permission = if collaborator.permissions.push {
                "push"
            } else {
                "pull"
            };
            externals.insert(collaborator.login, permission.to_string());
        }
        if done {
            break;
        }
    }
    Ok(externals)
}

async fn fetch_repo_rulesets(
    transport: &dyn GithubTransport,
    org: &str,
    repo: &str,
    app_by_id: &BTreeMap<u64, String>,
    team_by_id: &BTreeMap<u64, String>,
) -> Result<BTreeMap<String, GithubRuleset>, GithubError> {
    let listing = match rest_paginate(transport, &format!("/repos/{org}/{repo}/rulesets")).await {
        Ok(listing) => listing,
        Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };

    let mut rulesets = BTreeMap::new();
    for item in listing {
        // The listing includes rulesets inherited from the organization;
        // only repository-sourced ones are managed here.
        if item.get("source_type").and_then(|v| v.as_str()) == Some("Organization") {
            continue;
        }
        let Some(id) = item.get("id").and_then(|v| v.as_u64()) else {
            continue;
        };
        let raw = transport
            .call_rest(
                Method::GET,
                &format!("/repos/{org}/{repo}/rulesets/{id}"),
                None,
            )
            .await?;
        let detail: serde_json::Value = serde_json::from_slice(&raw)?;
        let ruleset = parse_ruleset(&detail, app_by_id, team_by_id);
        rulesets.insert(ruleset.name.clone(), ruleset);
    }
    Ok(rulesets)
}

async fn fetch_branch_protections(
    transport: &dyn GithubTransport,
    org: &str,
    repo: &str,
) -> Result<BTreeMap<String, GithubBranchProtection>, GithubError> {
    #[derive(Deserialize)]
    struct Data {
        repository: Option<Repo>,
    }
    #[derive(Deserialize)]
    struct Repo {
        #[serde(rename = "branchProtectionRules")]
        rules: Connection,
    }
    #[derive(Deserialize)]
    struct Connection {
        nodes: Vec<Node>,
    }
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Node {
        id: String,
        pattern: String,
        requires_approving_reviews: bool,
        required_approving_review_count: Option<u32>,
        dismisses_stale_reviews: bool,
        requires_code_owner_reviews: bool,
        require_last_push_approval: bool,
        requires_status_checks: bool,
        requires_strict_status_checks: bool,
        #[serde(default)]
        required_status_check_contexts: Vec<String>,
        requires_conversation_resolution: bool,
        requires_commit_signatures: bool,
        requires_linear_history: bool,
        allows_force_pushes: bool,
        allows_deletions: bool,
    }

    const QUERY: &str = r#"
query listBranchProtections($org: String!, $name: String!) {
  repository(owner: $org, name: $name) {
    branchProtectionRules(first: 100) {
      nodes {
        id
        pattern
        requiresApprovingReviews
        requiredApprovingReviewCount
        dismissesStaleReviews
        requiresCodeOwnerReviews
        requireLastPushApproval
        requiresStatusChecks
        requiresStrictStatusChecks
        requiredStatusCheckContexts
        requiresConversationResolution
        requiresCommitSignatures
        requiresLinearHistory
        allowsForcePushes
        allowsDeletions
      }
    }
  }
}"#;

    let raw = transport
        .query_graphql(QUERY, json!({ "org": org, "name": repo }))
        .await?;
    let data: Data = graphql_data(&raw)?;
    let mut protections = BTreeMap::new();
    let Some(repository) = data.repository else {
        return Ok(protections);
    };
    for node in repository.rules.nodes {
        protections.insert(
            node.pattern.clone(),
            GithubBranchProtection {
                id: Some(node.id),
                protection: crate::entity::ruleset::BranchProtection {
                    pattern: node.pattern,
                    requires_approving_reviews: node.requires_approving_reviews,
                    required_approving_review_count: node
                        .required_approving_review_count
                        .unwrap_or_default(),
                    dismisses_stale_reviews: node.dismisses_stale_reviews,
                    requires_code_owner_reviews: node.requires_code_owner_reviews,
                    require_last_push_approval: node.require_last_push_approval,
                    requires_status_checks: node.requires_status_checks,
                    requires_strict_status_checks: node.requires_strict_status_checks,
                    required_status_check_contexts: node.required_status_check_contexts,
                    requires_conversation_resolution: node.requires_conversation_resolution,
                    requires_commit_signatures: node.requires_commit_signatures,
                    requires_linear_history: node.requires_linear_history,
                    allows_force_pushes: node.allows_force_pushes,
                    allows_deletions: node.allows_deletions,
                },
            },
        );
    }
    Ok(protections)
}

async fn fetch_environments(
    transport: &dyn GithubTransport,
    org: &str,
    repo: &str,
) -> Result<BTreeMap<String, GithubEnvironment>, GithubError> {
    #[derive(Deserialize)]
    struct Listing {
        #[serde(default)]
        environments: Vec<Env>,
    }
    #[derive(Deserialize)]
    struct Env {
        name: String,
    }

    let raw = transport
        .call_rest(
            Method::GET,
            &format!("/repos/{org}/{repo}/environments?per_page={PAGE_SIZE}"),
            None,
        )
        .await;
    let raw = match raw {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };
    let listing: Listing = serde_json::from_slice(&raw)?;

    let mut environments = BTreeMap::new();
    for env in listing.environments {
        let variables = fetch_variables(
            transport,
            &format!(
                "/repos/{org}/{repo}/environments/{env}/variables",
                env = env.name
            ),
        )
        .await?;
        environments.insert(
            env.name.clone(),
            GithubEnvironment {
                name: env.name,
                variables,
            },
        );
    }
    Ok(environments)
}

async fn fetch_variables(
    transport: &dyn GithubTransport,
    endpoint: &str,
) -> Result<BTreeMap<String, String>, GithubError> {
    #[derive(Deserialize)]
    struct Listing {
        #[serde(default)]
        variables: Vec<Variable>,
    }
    #[derive(Deserialize)]
    struct Variable {
        name: String,
        value: String,
    }

    let raw = transport
        .call_rest(
            Method::GET,
            &format!("{endpoint}?per_page={PAGE_SIZE}"),
            None,
        )
        .await;
    let raw = match raw {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };
    let listing: Listing = serde_json::from_slice(&raw)?;
    Ok(listing
        .variables
        .into_iter()
        .map(|v| (v.name, v.value))
        .collect())
}

async fn fetch_autolinks(
    transport: &dyn GithubTransport,
    org: &str,
    repo: &str,
) -> Result<BTreeMap<String, GithubAutolink>, GithubError> {
    #[derive(Deserialize)]
    struct Autolink {
        id: u64,
        key_prefix: String,
        url_template: String,
        #[serde(default)]
        is_alphanumeric: bool,
    }

    let items = match rest_paginate(transport, &format!("/repos/{org}/{repo}/autolinks")).await {
        Ok(items) => items,
        Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };

    let mut autolinks = BTreeMap::new();
    for item in items {
        let autolink: Autolink = serde_json::from_value(item)?;
        autolinks.insert(
            autolink.key_prefix.clone(),
            GithubAutolink {
                id: Some(autolink.id),
                key_prefix: autolink.key_prefix,
                url_template: autolink.url_template,
                is_alphanumeric: autolink.is_alphanumeric,
            },
        );
    }
    Ok(autolinks)
}

/// Projects a REST ruleset payload into the comparable shape. Bypass
/// actor ids are resolved back into app/team slugs; `refs/heads/`
/// prefixes are stripped from non-reserved patterns.
pub(crate) fn parse_ruleset(
    detail: &serde_json::Value,
    app_by_id: &BTreeMap<u64, String>,
    team_by_id: &BTreeMap<u64, String>,
) -> GithubRuleset {
    let mut ruleset = GithubRuleset {
        name: detail
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        id: detail.get("id").and_then(|v| v.as_u64()),
        enforcement: detail
            .get("enforcement")
            .and_then(|v| v.as_str())
            .unwrap_or("evaluate")
            .to_string(),
        ..Default::default()
    };

    if let Some(actors) = detail.get("bypass_actors").and_then(|v| v.as_array()) {
        for actor in actors {
            let id = actor.get("actor_id").and_then(|v| v.as_u64());
            match actor.get("actor_type").and_then(|v| v.as_str()) {
                Some("Integration") => {
                    if let Some(slug) = id.and_then(|id| app_by_id.get(&id)) {
                        ruleset.bypass_apps.insert(slug.clone());
                    }
                }
                Some("Team") => {
                    if let Some(slug) = id.and_then(|id| team_by_id.get(&id)) {
                        ruleset.bypass_teams.insert(slug.clone());
                    }
                }
                _ => {}
            }
        }
    }

    let conditions = detail.get("conditions");
    if let Some(ref_name) = conditions.and_then(|c| c.get("ref_name")) {
        ruleset.include = string_list(ref_name.get("include"))
            .into_iter()
            .map(|p| strip_ref_prefix(&p))
            .collect();
        ruleset.exclude = string_list(ref_name.get("exclude"))
            .into_iter()
            .map(|p| strip_ref_prefix(&p))
            .collect();
    }
    if let Some(repo_name) = conditions.and_then(|c| c.get("repository_name")) {
        ruleset.repositories = string_list(repo_name.get("include")).into_iter().collect();
    }

    if let Some(rules) = detail.get("rules").and_then(|v| v.as_array()) {
        for rule in rules {
            let Some(rule_type) = rule.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            let parameters = rule.get("parameters");
            let mut params = RuleParameters::default();
            if let Some(p) = parameters {
                params.dismiss_stale_reviews_on_push =
                    bool_field(p, "dismiss_stale_reviews_on_push");
                params.require_code_owner_review = bool_field(p, "require_code_owner_review");
                params.required_approving_review_count = p
                    .get("required_approving_review_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or_default() as u32;
                params.require_last_push_approval = bool_field(p, "require_last_push_approval");
                params.required_review_thread_resolution =
                    bool_field(p, "required_review_thread_resolution");
                params.strict_required_status_checks_policy =
                    bool_field(p, "strict_required_status_checks_policy");
                if let Some(checks) = p.get("required_status_checks").and_then(|v| v.as_array()) {
                    params.required_status_check_contexts = checks
                        .iter()
                        .filter_map(|c| c.get("context").and_then(|v| v.as_str()))
                        .map(str::to_string)
                        .collect();
                }
            }
            ruleset
                .rules
                .insert(rule_type.to_ascii_lowercase(), params);
        }
    }

    ruleset
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn bool_field(value: &serde_json::Value, field: &str) -> bool {
    value.get(field).and_then(|v| v.as_bool()).unwrap_or(false)
}

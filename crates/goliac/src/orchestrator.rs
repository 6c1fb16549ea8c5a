//! The orchestrator loop: one cycle at a time, never overlapping.
//!
//! A cycle clones the teams repository to a fresh worktree, loads and
//! validates the desired state, loads the observed snapshot, reconciles
//! through the batching executor, then lets the committer write the
//! bookkeeping back to Git and move the applied tag. Load errors abort
//! the cycle and keep the previous applied tag in place.

use std::{sync::Arc, time::Duration};

use camino::Utf8PathBuf;
use reqwest::Method;
use serde_json::json;
use tracing::instrument;

use crate::{
    config::RepoConfig,
    engine::{
        desired::DesiredState,
        executor::BatchExecutor,
        reconciliator::{ReconcileOutcome, Reconciliator},
    },
    entity::{load_and_validate_local, loader::Diagnostics},
    errors::CycleError,
    github::GithubTransport,
    gitrepo::{GitAuthor, GitRepo, Git2Repo},
    remote::{RemoteSnapshot, mutator::GithubMutator, shadow::RemoteShadow},
    status::Status,
    sync::committer::{APPLIED_TAG, Committer},
    usersync::{UserSyncRegistry, apply_user_sync},
    worktree::{DiskWorktree, Worktree},
};

/// What one cycle reports back, for status surfacing.
#[derive(Debug, Default)]
pub(crate) struct CycleReport {
    pub(crate) commands_applied: usize,
    pub(crate) mutation_errors: Vec<String>,
    pub(crate) outcome: ReconcileOutcome,
    pub(crate) diagnostics: Diagnostics,
}

pub(crate) struct Orchestrator {
    transport: Arc<dyn GithubTransport>,
    snapshot: RemoteSnapshot,
    org: String,
    teams_repo_url: String,
    teams_repo_name: String,
    branch: String,
    apply_interval: Duration,
    dry_run: bool,
    /// Operator override for the changeset ceiling.
    force: bool,
    checkout_root: Utf8PathBuf,
    usersync: UserSyncRegistry,
    status: Status,
    cycle: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Arc<dyn GithubTransport>,
        org: impl Into<String>,
        teams_repo_url: impl Into<String>,
        branch: impl Into<String>,
        apply_interval: Duration,
        cache_ttl: Duration,
        dry_run: bool,
        force: bool,
    ) -> Self {
        let org = org.into();
        let teams_repo_url = teams_repo_url.into();
        let teams_repo_name = teams_repo_url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("teams")
            .to_string();
        let snapshot = RemoteSnapshot::new(transport.clone(), org.clone(), 1, cache_ttl);
        let checkout_root = Utf8PathBuf::from(std::env::temp_dir().to_string_lossy().as_ref())
            .join(format!("goliac-{pid}", pid = std::process::id()));

        Self {
            transport,
            snapshot,
            org,
            teams_repo_url,
            teams_repo_name,
            branch: branch.into(),
            apply_interval,
            dry_run,
            force,
            checkout_root,
            usersync: UserSyncRegistry::builtin(),
            status: Status::default(),
            cycle: 0,
        }
    }

    pub(crate) fn status(&self) -> &Status {
        &self.status
    }

    /// The periodic apply loop. Finishes the in-flight cycle before
    /// honoring a shutdown request.
    pub(crate) async fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.apply_interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Runs a single cycle, folding the result into the status document.
    pub(crate) async fn run_once(&mut self) {
        match self.run_cycle().await {
            Ok(report) => {
                tracing::info!(
                    "cycle complete: {applied} command(s) applied, {failed} failed",
                    applied = report.commands_applied,
                    failed = report.mutation_errors.len(),
                );
                let unmanaged = &report.outcome.unmanaged;
                let unmanaged_total = unmanaged.users.len()
                    + unmanaged.teams.len()
                    + unmanaged.repositories.len()
                    + unmanaged.rulesets.len();
                if unmanaged_total > 0 {
                    tracing::warn!(
                        "{unmanaged_total} unmanaged entities are excluded from removal by policy"
                    );
                }
                if !report.diagnostics.warnings.is_empty() {
                    tracing::warn!(
                        "{count} validation warning(s)",
                        count = report.diagnostics.warnings.len()
                    );
                }
            }
            Err(e) => {
                tracing::error!("cycle failed: {e}");
                self.status.record_failure(&e.to_string(), None);
            }
        }
    }

    #[instrument(skip(self), fields(cycle = self.cycle))]
    async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.cycle += 1;

        let token = self
            .transport
            .access_token()
            .await
            .map_err(CycleError::Remote)?;

        // A fresh worktree per cycle; stale checkouts are discarded.
        let dest = self.checkout_root.join(format!("cycle-{n}", n = self.cycle));
        if dest.as_std_path().exists() {
            std::fs::remove_dir_all(dest.as_std_path())?;
        }
        std::fs::create_dir_all(self.checkout_root.as_std_path())?;
        let mut git = Git2Repo::clone(&self.teams_repo_url, &self.branch, &token, &dest)
            .map_err(|e| CycleError::Git {
                context: "cloning the teams repository".into(),
                source: e,
            })?;
        let worktree = DiskWorktree::new(git.workdir().to_path_buf());

        let report = self.run_cycle_with(&worktree, &mut git, &token).await;

        if let Err(e) = std::fs::remove_dir_all(dest.as_std_path()) {
            tracing::debug!("couldn't clean {dest}: {e}");
        }
        report
    }

    /// The cycle body, driven through the worktree and git contracts so
    /// tests can substitute in-memory implementations.
    pub(crate) async fn run_cycle_with(
        &mut self,
        worktree: &dyn Worktree,
        git: &mut dyn GitRepo,
        token: &str,
    ) -> Result<CycleReport, CycleError> {
        let config = RepoConfig::load(worktree)?;
        self.snapshot.set_concurrency(config.github_concurrent_threads);

        if let Ok(pending) = git.log_since(APPLIED_TAG)
            && !pending.is_empty()
        {
            tracing::info!(
                "{count} commit(s) since the last applied state",
                count = pending.len()
            );
        }

        let (entities, diagnostics) = load_and_validate_local(worktree, &config);
        for warning in &diagnostics.warnings {
            tracing::warn!("validation: {warning}");
        }
        if diagnostics.has_errors() {
            for error in &diagnostics.errors {
                tracing::error!("validation: {error}");
            }
            let failure = CycleError::Load {
                count: diagnostics.errors.len(),
            };
            self.status.record_failure(&failure.to_string(), Some(&diagnostics));
            return Err(failure);
        }

        // Self-protection writes settings; a dry run stays read-only.
        if !self.dry_run {
            self.ensure_teams_repo_protection().await;
        }

        // Optional user synchronization, committed before reconciling so
        // the cycle diffs the synced state.
        if let Some(plugin_name) = config.usersync.plugin.as_deref() {
            match self.usersync.get(plugin_name) {
                Some(plugin) => {
                    let mut sync_diags = Diagnostics::default();
                    match apply_user_sync(plugin, &config, worktree, &mut sync_diags) {
                        Ok(true) if !self.dry_run => {
                            git.commit("Sync users and teams", &GitAuthor::default())
                                .and_then(|_| git.push(&self.branch, token))
                                .map_err(|e| CycleError::Git {
                                    context: "committing user sync".into(),
                                    source: e,
                                })?;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("user sync failed: {e}"),
                    }
                }
                None => tracing::warn!("unknown user-sync plugin `{plugin_name}`"),
            }
        }

        let swallowed = self
            .snapshot
            .load(false)
            .await
            .map_err(CycleError::Remote)?;
        for error in swallowed {
            tracing::warn!("snapshot: {error}");
        }

        let mut executor = BatchExecutor::new(config.max_changesets, self.force);
        executor.begin(self.dry_run);
        let mut shadow = RemoteShadow::from_snapshot(&self.snapshot);
        let mut desired = DesiredState::build(&entities, &config);

        let outcome = match Reconciliator::new(&config, &mut executor)
            .reconcile(&mut desired, &mut shadow)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                executor.rollback();
                self.status.record_failure(&e.to_string(), Some(&diagnostics));
                return Err(CycleError::Remote(e));
            }
        };

        let commit_report = {
            let mut mutator = GithubMutator::new(&mut self.snapshot);
            executor.commit(&mut mutator).await?
        };
        let mutation_errors: Vec<String> = commit_report
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect();
        if !mutation_errors.is_empty() {
            // In-place cache updates only happen on success; after a
            // partial batch, re-pull the truth next cycle.
            self.snapshot.flush_caches();
        }

        if !self.dry_run {
            Committer::new(worktree, git, &self.org, &config)
                .update_and_commit(&entities, &outcome, &self.branch, token)?;
        }

        self.status
            .record_success(&entities, &outcome.unmanaged, &diagnostics);
        Ok(CycleReport {
            commands_applied: commit_report.applied,
            mutation_errors,
            outcome,
            diagnostics,
        })
    }

    /// Enforces squash-merge-only and a strict status-check protection on
    /// the teams repository itself. Idempotent and best-effort: a failure
    /// is logged, never fatal.
    async fn ensure_teams_repo_protection(&self) {
        let org = &self.org;
        let repo = &self.teams_repo_name;

        let settings = async {
            let raw = self
                .transport
                .call_rest(Method::GET, &format!("/repos/{org}/{repo}"), None)
                .await?;
            let current: serde_json::Value = serde_json::from_slice(&raw)?;
            let wanted = [
                ("allow_merge_commit", false),
                ("allow_rebase_merge", false),
                ("allow_squash_merge", true),
            ];
            if wanted
                .iter()
                .any(|(key, value)| current.get(key).and_then(|v| v.as_bool()) != Some(*value))
            {
                self.transport
                    .call_rest(
                        Method::PATCH,
                        &format!("/repos/{org}/{repo}"),
                        Some(json!({
                            "allow_merge_commit": false,
                            "allow_rebase_merge": false,
                            "allow_squash_merge": true,
                        })),
                    )
                    .await?;
            }
            Ok::<(), crate::github::GithubError>(())
        };
        if let Err(e) = settings.await {
            tracing::warn!("couldn't enforce merge settings on {repo}: {e}");
        }

        let protection = self
            .transport
            .call_rest(
                Method::GET,
                &format!(
                    "/repos/{org}/{repo}/branches/{branch}/protection",
                    branch = self.branch
                ),
                None,
            )
            .await;
        if protection.as_ref().is_err_and(|e| e.is_not_found()) {
            let result = self
                .transport
                .call_rest(
                    Method::PUT,
                    &format!(
                        "/repos/{org}/{repo}/branches/{branch}/protection",
                        branch = self.branch
                    ),
                    Some(json!({
                        "required_status_checks": { "strict": true, "contexts": [] },
                        "enforce_admins": false,
                        "required_pull_request_reviews": null,
                        "restrictions": null,
                    })),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(
                    "couldn't protect {repo}@{branch}: {e}",
                    branch = self.branch
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{github::GithubError, gitrepo::RecordingGit, worktree::MemoryWorktree};

    /// Answers every snapshot query with an empty organization and
    /// records every mutation.
    struct StubTransport {
        calls: Mutex<Vec<String>>,
    }

    impl StubTransport {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn mutations(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("poisoned")
                .iter()
                .filter(|c| !c.starts_with("GET"))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl GithubTransport for StubTransport {
        async fn query_graphql(
            &self,
            query: &str,
            _variables: serde_json::Value,
        ) -> Result<Vec<u8>, GithubError> {
            let page_info = json!({ "hasNextPage": false, "endCursor": null });
            let body = if query.contains("membersWithRole") {
                json!({"data": {"organization": {"membersWithRole": {
                    "edges": [], "pageInfo": page_info }}}})
            } else if query.contains("teams(first") {
                json!({"data": {"organization": {"teams": {
                    "nodes": [], "pageInfo": page_info }}}})
            } else if query.contains("team(slug") {
                json!({"data": {"organization": {"team": null}}})
            } else if query.contains("repositories(first") {
                json!({"data": {"organization": {"repositories": {
                    "nodes": [], "pageInfo": page_info }}}})
            } else if query.contains("branchProtectionRules") {
                json!({"data": {"repository": null}})
            } else {
                json!({"data": {}})
            };
            Ok(serde_json::to_vec(&body).expect("stub body"))
        }

        async fn call_rest(
            &self,
            method: Method,
            endpoint: &str,
            _body: Option<serde_json::Value>,
        ) -> Result<Vec<u8>, GithubError> {
            self.calls
                .lock()
                .expect("poisoned")
                .push(format!("{method} {endpoint}"));

            let body = if method == Method::GET {
                if endpoint.ends_with("/installations") {
                    json!({ "installations": [] })
                } else if endpoint.contains("/branches/") {
                    return Err(GithubError::Status {
                        status: 404,
                        endpoint: endpoint.to_string(),
                        body: String::new(),
                    });
                } else {
                    json!({
                        "plan": { "name": "free" },
                        "allow_merge_commit": false,
                        "allow_rebase_merge": false,
                        "allow_squash_merge": true,
                    })
                }
            } else {
                // Enough shape for every created-entity response.
                json!({ "id": 1, "slug": "new", "node_id": "R_1", "default_branch": "main" })
            };
            Ok(serde_json::to_vec(&body).expect("stub body"))
        }

        async fn access_token(&self) -> Result<String, GithubError> {
            Ok("token".into())
        }

        fn app_slug(&self) -> &str {
            "goliac-app"
        }
    }

    fn orchestrator(transport: Arc<StubTransport>) -> Orchestrator {
        Orchestrator::new(
            transport,
            "acme",
            "https://github.com/acme/teams.git",
            "main",
            Duration::from_secs(600),
            Duration::from_secs(3600),
            false,
            false,
        )
    }

    fn seeded_worktree() -> MemoryWorktree {
        let tree = MemoryWorktree::new();
        tree.seed("goliac.yaml", "adminTeam: admin\n");
        tree.seed(
            "users/org/alice.yaml",
            "apiVersion: v1\nkind: User\nname: alice\n",
        );
        tree.seed(
            "teams/admin/team.yaml",
            "apiVersion: v1\nkind: Team\nname: admin\nspec:\n  owners: [alice]\n",
        );
        tree
    }

    #[tokio::test]
    async fn a_cycle_applies_and_moves_the_tag() {
        let transport = Arc::new(StubTransport::new());
        let mut orchestrator = orchestrator(transport.clone());
        let worktree = seeded_worktree();
        let mut git = RecordingGit::new();

        let report = orchestrator
            .run_cycle_with(&worktree, &mut git, "token")
            .await
            .expect("cycle failed");

        // alice joins, admin and admin-owners are created.
        assert!(report.commands_applied >= 3);
        assert!(report.mutation_errors.is_empty());
        let mutations = transport.mutations();
        assert!(
            mutations
                .iter()
                .any(|m| m == "PUT /orgs/acme/memberships/alice")
        );
        assert!(mutations.iter().any(|m| m == "POST /orgs/acme/teams"));

        // Bookkeeping: CODEOWNERS commit, branch push, applied tag moved.
        assert_eq!(git.commits, vec!["Regenerate CODEOWNERS"]);
        assert_eq!(git.pushed_branches, vec!["main"]);
        assert_eq!(git.pushed_tags.len(), 1);
        assert!(
            worktree
                .read_to_string(camino::Utf8Path::new(".github/CODEOWNERS"))
                .expect("codeowners")
                .starts_with("* @acme/admin")
        );
        assert!(orchestrator.status().last_sync_error.is_none());
    }

    #[tokio::test]
    async fn validation_errors_abort_before_any_mutation() {
        let transport = Arc::new(StubTransport::new());
        let mut orchestrator = orchestrator(transport.clone());
        let worktree = seeded_worktree();
        worktree.seed(
            "teams/bad/team.yaml",
            "apiVersion: v1\nkind: Team\nname: bad\nspec:\n  members: [ghost]\n",
        );
        let mut git = RecordingGit::new();

        let err = orchestrator
            .run_cycle_with(&worktree, &mut git, "token")
            .await
            .expect_err("cycle must fail");
        assert!(matches!(err, CycleError::Load { count: 1 }));

        // No mutation, no commit, no tag move.
        assert_eq!(transport.mutations(), Vec::<String>::new());
        assert!(git.commits.is_empty());
        assert!(git.pushed_tags.is_empty());
        assert!(orchestrator.status().last_sync_error.is_some());
    }

    #[tokio::test]
    async fn dry_run_reaches_github_read_only() {
        let transport = Arc::new(StubTransport::new());
        let mut orchestrator = Orchestrator::new(
            transport.clone(),
            "acme",
            "https://github.com/acme/teams.git",
            "main",
            Duration::from_secs(600),
            Duration::from_secs(3600),
            true,
            false,
        );
        let worktree = seeded_worktree();
        let mut git = RecordingGit::new();

        let report = orchestrator
            .run_cycle_with(&worktree, &mut git, "token")
            .await
            .expect("cycle failed");
        assert_eq!(report.commands_applied, 0);
        assert_eq!(transport.mutations(), Vec::<String>::new());
        assert!(git.commits.is_empty());
        assert!(git.pushed_tags.is_empty());
    }
}

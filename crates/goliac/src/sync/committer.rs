//! Post-reconciliation bookkeeping against the teams repository.
//!
//! After a successful (non-dry-run) commit of the mutation batch, the
//! committer writes the state the platform now reflects back into Git:
//! the regenerated CODEOWNERS, `archived/*.yaml` stubs for repositories
//! archived this cycle, file moves for renames, and finally a branch
//! push plus a forced move of the applied tag.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::instrument;

use crate::{
    config::RepoConfig,
    engine::reconciliator::ReconcileOutcome,
    entity::{loader::Entities, repository::Repository, slugify},
    errors::CycleError,
    gitrepo::{GitAuthor, GitRepo},
    sync::codeowners::generate_codeowners,
    worktree::Worktree,
};

/// The movable tag marking the last successfully applied commit.
pub(crate) const APPLIED_TAG: &str = "goliac";

pub(crate) const CODEOWNERS_PATH: &str = ".github/CODEOWNERS";

pub(crate) struct Committer<'a> {
    worktree: &'a dyn Worktree,
    git: &'a mut dyn GitRepo,
    org: &'a str,
    config: &'a RepoConfig,
}

impl<'a> Committer<'a> {
    pub(crate) fn new(
        worktree: &'a dyn Worktree,
        git: &'a mut dyn GitRepo,
        org: &'a str,
        config: &'a RepoConfig,
    ) -> Self {
        Self {
            worktree,
            git,
            org,
            config,
        }
    }

    /// Runs the full bookkeeping pass and moves the applied tag to HEAD.
    #[instrument(skip_all)]
    pub(crate) fn update_and_commit(
        &mut self,
        entities: &Entities,
        outcome: &ReconcileOutcome,
        branch: &str,
        token: &str,
    ) -> Result<(), CycleError> {
        let author = GitAuthor::default();
        let mut dirty = false;

        dirty |= self.regenerate_codeowners(entities, &author)?;
        dirty |= self.write_archived_stubs(outcome, &author)?;
        dirty |= self.apply_renames(entities, outcome, &author)?;

        if dirty {
            self.git.push(branch, token).map_err(|e| CycleError::Git {
                context: "pushing bookkeeping commits".into(),
                source: e,
            })?;
        }

        let head = self.git.head().map_err(|e| CycleError::Git {
            context: "resolving HEAD".into(),
            source: e,
        })?;
        self.git
            .push_tag(APPLIED_TAG, &head, token)
            .map_err(|e| CycleError::Git {
                context: "moving the applied tag".into(),
                source: e,
            })?;
        Ok(())
    }

    fn regenerate_codeowners(
        &mut self,
        entities: &Entities,
        author: &GitAuthor,
    ) -> Result<bool, CycleError> {
        let admin_slug = slugify(&self.config.admin_team);
        let content = generate_codeowners(&entities.teams, self.org, &admin_slug);
        let path = Utf8Path::new(CODEOWNERS_PATH);

        let current = self
            .worktree
            .read_to_string(path)
            .unwrap_or_default();
        if current == content {
            return Ok(false);
        }

        self.worktree.write(path, content.as_bytes())?;
        self.commit("Regenerate CODEOWNERS", author)?;
        Ok(true)
    }

    fn write_archived_stubs(
        &mut self,
        outcome: &ReconcileOutcome,
        author: &GitAuthor,
    ) -> Result<bool, CycleError> {
        let mut dirty = false;
        for name in &outcome.repos_to_archive {
            let path = Utf8PathBuf::from(format!("archived/{name}.yaml"));
            if self.worktree.exists(&path) {
                continue;
            }
            self.worktree
                .write(&path, Repository::archived_stub(name).as_bytes())?;
            self.commit(&format!("Archive repository {name}"), author)?;
            dirty = true;
        }
        Ok(dirty)
    }

    fn apply_renames(
        &mut self,
        entities: &Entities,
        outcome: &ReconcileOutcome,
        author: &GitAuthor,
    ) -> Result<bool, CycleError> {
        let mut dirty = false;
        for (old, new) in &outcome.renamed {
            let Some(repo) = entities.repositories.get(old) else {
                continue;
            };
            let Some(owner) = &repo.owner else {
                continue;
            };

            let mut renamed = repo.clone();
            renamed.name = new.clone();
            renamed.rename_to = None;

            let old_path = Utf8PathBuf::from(format!("teams/{owner}/{old}.yaml"));
            let new_path = Utf8PathBuf::from(format!("teams/{owner}/{new}.yaml"));
            self.worktree
                .write(&new_path, renamed.to_yaml().as_bytes())?;
            if self.worktree.exists(&old_path) {
                self.worktree.remove(&old_path)?;
            }
            self.commit(&format!("Rename repository {old} to {new}"), author)?;
            dirty = true;
        }
        Ok(dirty)
    }

    fn commit(&mut self, message: &str, author: &GitAuthor) -> Result<(), CycleError> {
        self.git
            .commit(message, author)
            .map(|_| ())
            .map_err(|e| CycleError::Git {
                context: format!("committing `{message}`"),
                source: e,
            })
    }
}

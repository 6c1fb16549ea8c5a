//! The Git contract for the teams repository.
//!
//! The core only needs a handful of plumbing operations: clone a fresh
//! worktree, stage-and-commit, push the branch, and move the applied tag.
//! HTTPS authentication uses `x-access-token` basic auth with the
//! transport's installation token.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use git2::{
    Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature,
    build::RepoBuilder,
};

#[derive(Clone, Debug)]
pub(crate) struct GitAuthor {
    pub(crate) name: String,
    pub(crate) email: String,
}

impl Default for GitAuthor {
    fn default() -> Self {
        Self {
            name: "goliac".into(),
            email: "goliac@localhost".into(),
        }
    }
}

pub(crate) trait GitRepo: Send {
    /// The commit hash at HEAD.
    fn head(&self) -> Result<String>;
    /// Checks out the given commit, detached.
    fn checkout(&mut self, commit: &str) -> Result<()>;
    /// Commit hashes reachable from HEAD but not from `from_tag`.
    fn log_since(&self, from_tag: &str) -> Result<Vec<String>>;
    /// Stages every worktree change (deletions included) and commits.
    fn commit(&mut self, message: &str, author: &GitAuthor) -> Result<String>;
    /// Pushes the branch to origin.
    fn push(&mut self, branch: &str, token: &str) -> Result<()>;
    /// Moves the named tag to `hash` and force-pushes it. Pushing a tag
    /// that is already there counts as success.
    fn push_tag(&mut self, name: &str, hash: &str, token: &str) -> Result<()>;
}

fn auth_callbacks(token: &str) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username, _allowed| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    callbacks
}

/// The git2-backed implementation over a real on-disk clone.
pub(crate) struct Git2Repo {
    repo: Repository,
    workdir: Utf8PathBuf,
}

impl Git2Repo {
    /// Clones `url` at `branch` into `dest`, which must not exist yet.
    pub(crate) fn clone(
        url: &str,
        branch: &str,
        token: &str,
        dest: &Utf8Path,
    ) -> Result<Self> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(auth_callbacks(token));
        let repo = RepoBuilder::new()
            .branch(branch)
            .fetch_options(fetch)
            .clone(url, dest.as_std_path())
            .with_context(|| format!("couldn't clone {url}"))?;
        Ok(Self {
            repo,
            workdir: dest.to_path_buf(),
        })
    }

    pub(crate) fn workdir(&self) -> &Utf8Path {
        &self.workdir
    }
}

impl GitRepo for Git2Repo {
    fn head(&self) -> Result<String> {
        Ok(self.repo.head()?.peel_to_commit()?.id().to_string())
    }

    fn checkout(&mut self, commit: &str) -> Result<()> {
        let object = self.repo.revparse_single(commit)?;
        self.repo.checkout_tree(
            &object,
            Some(git2::build::CheckoutBuilder::new().force()),
        )?;
        self.repo.set_head_detached(object.id())?;
        Ok(())
    }

    fn log_since(&self, from_tag: &str) -> Result<Vec<String>> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push_head()?;
        if let Ok(tag) = self
            .repo
            .revparse_single(&format!("refs/tags/{from_tag}"))
        {
            revwalk.hide(tag.peel_to_commit()?.id())?;
        }
        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(oid?.to_string());
        }
        Ok(commits)
    }

    fn commit(&mut self, message: &str, author: &GitAuthor) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = Signature::now(&author.name, &author.email)?;
        let parent = self.repo.head()?.peel_to_commit()?;
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;
        Ok(oid.to_string())
    }

    fn push(&mut self, branch: &str, token: &str) -> Result<()> {
        let mut remote = self.repo.find_remote("origin")?;
        let mut options = PushOptions::new();
        options.remote_callbacks(auth_callbacks(token));
        remote
            .push(
                &[format!("refs/heads/{branch}:refs/heads/{branch}")],
                Some(&mut options),
            )
            .context("couldn't push branch")?;
        Ok(())
    }

    fn push_tag(&mut self, name: &str, hash: &str, token: &str) -> Result<()> {
        let oid = git2::Oid::from_str(hash)?;
        self.repo
            .reference(&format!("refs/tags/{name}"), oid, true, "move applied tag")?;
        let mut remote = self.repo.find_remote("origin")?;
        let mut options = PushOptions::new();
        options.remote_callbacks(auth_callbacks(token));
        match remote.push(
            &[format!("+refs/tags/{name}:refs/tags/{name}")],
            Some(&mut options),
        ) {
            Ok(()) => Ok(()),
            // Re-pushing the tag at the same commit is not a failure.
            Err(e) if e.message().contains("up to date") => Ok(()),
            Err(e) => Err(e).context("couldn't push tag"),
        }
    }
}

/// In-memory stand-in used by tests, mirroring the `inmemory:///` scheme
/// of the git contract.
#[cfg(test)]
pub(crate) struct RecordingGit {
    pub(crate) commits: Vec<String>,
    pub(crate) pushed_branches: Vec<String>,
    pub(crate) pushed_tags: Vec<(String, String)>,
    head: u64,
}

#[cfg(test)]
impl RecordingGit {
    pub(crate) fn new() -> Self {
        Self {
            commits: Vec::new(),
            pushed_branches: Vec::new(),
            pushed_tags: Vec::new(),
            head: 0,
        }
    }
}

#[cfg(test)]
impl GitRepo for RecordingGit {
    fn head(&self) -> Result<String> {
        Ok(format!("commit-{}", self.head))
    }

    fn checkout(&mut self, _commit: &str) -> Result<()> {
        Ok(())
    }

    fn log_since(&self, _from_tag: &str) -> Result<Vec<String>> {
        Ok(self.commits.clone())
    }

    fn commit(&mut self, message: &str, _author: &GitAuthor) -> Result<String> {
        self.head += 1;
        self.commits.push(message.to_string());
        Ok(format!("commit-{}", self.head))
    }

    fn push(&mut self, branch: &str, _token: &str) -> Result<()> {
        self.pushed_branches.push(branch.to_string());
        Ok(())
    }

    fn push_tag(&mut self, name: &str, hash: &str, _token: &str) -> Result<()> {
        self.pushed_tags.push((name.to_string(), hash.to_string()));
        Ok(())
    }
}

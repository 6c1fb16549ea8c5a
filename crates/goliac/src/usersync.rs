//! The user-sync plugin mechanism.
//!
//! A plugin produces the authoritative set of organization users from an
//! external directory (IdP export, SAML listing, …). The core diffs the
//! returned map against `users/org/*.yaml` and rewrites the files; the
//! orchestrator commits the result as a "sync users and teams" change.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use tracing::instrument;

use crate::{
    config::RepoConfig,
    entity::{
        loader::Diagnostics,
        user::{User, UserKind},
    },
    worktree::Worktree,
};

pub(crate) const ORG_USER_DIR: &str = "users/org";

pub(crate) trait UserSyncPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the desired organization users, keyed by canonical name.
    fn update_users(
        &self,
        config: &RepoConfig,
        worktree: &dyn Worktree,
        org_user_dir: &Utf8Path,
        diagnostics: &mut Diagnostics,
    ) -> Result<BTreeMap<String, User>>;
}

/// The identity plugin: whatever is on disk is authoritative.
pub(crate) struct NoopPlugin;

impl UserSyncPlugin for NoopPlugin {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn update_users(
        &self,
        _config: &RepoConfig,
        worktree: &dyn Worktree,
        org_user_dir: &Utf8Path,
        diagnostics: &mut Diagnostics,
    ) -> Result<BTreeMap<String, User>> {
        Ok(read_org_users(worktree, org_user_dir, diagnostics))
    }
}

pub(crate) struct UserSyncRegistry {
    plugins: IndexMap<&'static str, Box<dyn UserSyncPlugin>>,
}

impl UserSyncRegistry {
    pub(crate) fn builtin() -> Self {
        let mut plugins: IndexMap<&'static str, Box<dyn UserSyncPlugin>> = IndexMap::new();
        let noop = NoopPlugin;
        plugins.insert(noop.name(), Box::new(noop));
        Self { plugins }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&dyn UserSyncPlugin> {
        self.plugins.get(name).map(|plugin| &**plugin)
    }
}

pub(crate) fn read_org_users(
    worktree: &dyn Worktree,
    org_user_dir: &Utf8Path,
    diagnostics: &mut Diagnostics,
) -> BTreeMap<String, User> {
    let mut users = BTreeMap::new();
    for path in worktree.walk(org_user_dir).unwrap_or_default() {
        if !matches!(path.extension(), Some("yaml") | Some("yml")) {
            continue;
        }
        match worktree
            .read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                User::parse(&contents, &path, UserKind::Org).map_err(|e| e.to_string())
            }) {
            Ok(user) => {
                users.insert(user.name.clone(), user);
            }
            Err(e) => diagnostics.warning(Some(&path), e),
        }
    }
    users
}

/// Diffs the plugin's user map against `users/org/*.yaml` and applies
/// additions, removals, and rewrites. Returns whether anything changed.
#[instrument(skip_all, fields(plugin = plugin.name()))]
pub(crate) fn apply_user_sync(
    plugin: &dyn UserSyncPlugin,
    config: &RepoConfig,
    worktree: &dyn Worktree,
    diagnostics: &mut Diagnostics,
) -> Result<bool> {
    let org_user_dir = Utf8Path::new(ORG_USER_DIR);
    let current = read_org_users(worktree, org_user_dir, diagnostics);
    let desired = plugin.update_users(config, worktree, org_user_dir, diagnostics)?;

    let mut changed = false;
    for (name, user) in &current {
        if !desired.contains_key(name) {
            worktree.remove(&user_path(name))?;
            tracing::info!("user sync removed `{name}`");
            changed = true;
        } else if desired[name] != *user {
            worktree.write(&user_path(name), desired[name].to_yaml().as_bytes())?;
            tracing::info!("user sync updated `{name}`");
            changed = true;
        }
    }
    for (name, user) in &desired {
        if !current.contains_key(name) {
            worktree.write(&user_path(name), user.to_yaml().as_bytes())?;
            tracing::info!("user sync added `{name}`");
            changed = true;
        }
    }

    Ok(changed)
}

fn user_path(name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{ORG_USER_DIR}/{name}.yaml"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::worktree::MemoryWorktree;

    struct FixedPlugin(BTreeMap<String, User>);

    impl UserSyncPlugin for FixedPlugin {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn update_users(
            &self,
            _config: &RepoConfig,
            _worktree: &dyn Worktree,
            _org_user_dir: &Utf8Path,
            _diagnostics: &mut Diagnostics,
        ) -> Result<BTreeMap<String, User>> {
            Ok(self.0.clone())
        }
    }

    fn user(name: &str, login: &str) -> User {
        User {
            name: name.into(),
            github_id: login.into(),
            kind: UserKind::Org,
        }
    }

    #[test]
    fn noop_plugin_changes_nothing() {
        let worktree = MemoryWorktree::new();
        worktree.seed(
            "users/org/alice.yaml",
            &user("alice", "alice-gh").to_yaml(),
        );
        let mut diags = Diagnostics::default();
        let registry = UserSyncRegistry::builtin();
        let plugin = registry.get("noop").expect("builtin plugin");

        let changed =
            apply_user_sync(plugin, &RepoConfig::default(), &worktree, &mut diags).unwrap();
        assert!(!changed);
    }

    #[test]
    fn additions_removals_and_rewrites_are_applied() {
        let worktree = MemoryWorktree::new();
        worktree.seed(
            "users/org/alice.yaml",
            &user("alice", "alice-gh").to_yaml(),
        );
        worktree.seed("users/org/bob.yaml", &user("bob", "bob").to_yaml());

        let plugin = FixedPlugin(BTreeMap::from([
            // alice gets a new login, carol is new, bob is gone.
            ("alice".to_string(), user("alice", "alice-2")),
            ("carol".to_string(), user("carol", "carol")),
        ]));

        let mut diags = Diagnostics::default();
        let changed =
            apply_user_sync(&plugin, &RepoConfig::default(), &worktree, &mut diags).unwrap();
        assert!(changed);

        let mut after = Diagnostics::default();
        let users = read_org_users(&worktree, Utf8Path::new(ORG_USER_DIR), &mut after);
        assert_eq!(
            users.keys().cloned().collect::<Vec<_>>(),
            vec!["alice", "carol"]
        );
        assert_eq!(users["alice"].github_id, "alice-2");
    }
}

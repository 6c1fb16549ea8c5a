//! Data model for the repository-level `goliac.yaml` configuration.
//!
//! This is the configuration that lives inside the teams repository itself,
//! next to the entities it governs. Process-level configuration (tokens,
//! URLs, intervals) is handled by the CLI in `main.rs`.

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;

use crate::worktree::Worktree;

pub(crate) const CONFIG_FILE: &str = "goliac.yaml";

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    /// An I/O error occurred while loading the configuration.
    #[error("I/O error while reading {CONFIG_FILE}")]
    Io(#[from] std::io::Error),

    /// The configuration file is syntactically invalid.
    #[error("invalid configuration syntax in {CONFIG_FILE}")]
    Syntax(#[from] serde_yaml::Error),
}

/// A single organization-ruleset binding: the named ruleset entity is
/// applied to every declared repository matching `pattern`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct RulesetBinding {
    pub(crate) pattern: String,
    pub(crate) ruleset: String,
}

/// Which entity classes may be destroyed remotely. Everything defaults to
/// off: an undeclared remote entity is reported as unmanaged, not deleted.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct DestructiveOperations {
    pub(crate) repositories: bool,
    pub(crate) teams: bool,
    pub(crate) users: bool,
    pub(crate) rulesets: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct VisibilityRules {
    pub(crate) forbid_public_repositories: bool,
    pub(crate) forbid_public_repositories_exclusions: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct UserSyncConfig {
    /// Name of the user-sync plugin to run each cycle, if any.
    pub(crate) plugin: Option<String>,
    /// Plugin-specific path argument (e.g. an export file location).
    pub(crate) path: Option<String>,
}

/// Data model for `goliac.yaml`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RepoConfig {
    /// Slug of the organization's administration team. The admin team is a
    /// fallback reviewer on every CODEOWNERS entry.
    pub(crate) admin_team: String,

    /// When enabled, a synthetic `everyone` team containing every
    /// organization user is maintained and granted read access everywhere.
    pub(crate) everyone_team_enabled: bool,

    /// Organization-level ruleset bindings.
    pub(crate) rulesets: Vec<RulesetBinding>,

    /// Per-cycle ceiling on emitted mutation commands.
    pub(crate) max_changesets: usize,

    /// Size of the worker pool used for remote detail fetches. `1` makes
    /// the snapshot load strictly sequential.
    pub(crate) github_concurrent_threads: usize,

    /// Archive repositories on removal instead of deleting them.
    pub(crate) archive_on_delete: bool,

    pub(crate) destructive_operations: DestructiveOperations,

    pub(crate) visibility_rules: VisibilityRules,

    pub(crate) usersync: UserSyncConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            admin_team: "admin".into(),
            everyone_team_enabled: false,
            rulesets: Vec::new(),
            max_changesets: 50,
            github_concurrent_threads: 1,
            archive_on_delete: true,
            destructive_operations: DestructiveOperations::default(),
            visibility_rules: VisibilityRules::default(),
            usersync: UserSyncConfig::default(),
        }
    }
}

impl RepoConfig {
    pub(crate) fn load(worktree: &dyn Worktree) -> Result<Self, ConfigError> {
        let contents = worktree.read_to_string(Utf8Path::new(CONFIG_FILE))?;
        let mut config: Self = serde_yaml::from_str(&contents)?;

        // A zero worker pool or a zero ceiling would deadlock or refuse
        // every commit; clamp both to their minimum useful values.
        config.github_concurrent_threads = config.github_concurrent_threads.max(1);
        config.max_changesets = config.max_changesets.max(1);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::worktree::MemoryWorktree;

    #[test]
    fn defaults() {
        let config = RepoConfig::default();
        assert_eq!(config.max_changesets, 50);
        assert_eq!(config.github_concurrent_threads, 1);
        assert!(config.archive_on_delete);
        assert!(!config.destructive_operations.repositories);
        assert!(!config.destructive_operations.users);
    }

    #[test]
    fn load_full() {
        let tree = MemoryWorktree::new();
        tree.seed(
            CONFIG_FILE,
            r#"
adminTeam: platform-admin
everyoneTeamEnabled: true
rulesets:
  - pattern: ".*"
    ruleset: default
maxChangesets: 10
githubConcurrentThreads: 4
archiveOnDelete: false
destructiveOperations:
  repositories: true
  users: false
visibilityRules:
  forbidPublicRepositories: true
  forbidPublicRepositoriesExclusions:
    - public-docs
usersync:
  plugin: noop
"#,
        );

        let config = RepoConfig::load(&tree).unwrap();
        assert_eq!(config.admin_team, "platform-admin");
        assert!(config.everyone_team_enabled);
        assert_eq!(
            config.rulesets,
            vec![RulesetBinding {
                pattern: ".*".into(),
                ruleset: "default".into(),
            }]
        );
        assert_eq!(config.max_changesets, 10);
        assert_eq!(config.github_concurrent_threads, 4);
        assert!(!config.archive_on_delete);
        assert!(config.destructive_operations.repositories);
        assert!(
            config
                .visibility_rules
                .forbid_public_repositories_exclusions
                .contains(&"public-docs".to_string())
        );
        assert_eq!(config.usersync.plugin.as_deref(), Some("noop"));
    }

    #[test]
    fn zero_knobs_are_clamped() {
        let tree = MemoryWorktree::new();
        tree.seed(CONFIG_FILE, "githubConcurrentThreads: 0\nmaxChangesets: 0\n");

        let config = RepoConfig::load(&tree).unwrap();
        assert_eq!(config.github_concurrent_threads, 1);
        assert_eq!(config.max_changesets, 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tree = MemoryWorktree::new();
        tree.seed(CONFIG_FILE, "adminTeam: admin\nnotAKnob: true\n");
        assert!(RepoConfig::load(&tree).is_err());
    }
}

//! Loading and validation of the desired state from a worktree.
//!
//! `load_and_validate_local` walks the on-disk layout (`users/*`,
//! `teams/**`, `archived/*`, `rulesets/*`), parses each file into at most
//! one entity, and accumulates diagnostics rather than aborting on the
//! first problem. Cross-entity validation runs after parsing, then the
//! synthetic teams (`everyone`, per-team owners) are attached.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::instrument;

use crate::{
    config::RepoConfig,
    entity::{
        Diagnostic, EVERYONE_TEAM, OWNERS_SUFFIX,
        repository::{Repository, Visibility},
        ruleset::Ruleset,
        team::Team,
        user::{User, UserKind},
    },
    worktree::Worktree,
};

/// Validation output with two severities: errors block the commit of a
/// cycle, warnings are informational only.
#[derive(Clone, Debug, Default)]
pub(crate) struct Diagnostics {
    pub(crate) errors: Vec<Diagnostic>,
    pub(crate) warnings: Vec<Diagnostic>,
}

impl Diagnostics {
    pub(crate) fn error(&mut self, path: Option<&Utf8Path>, message: impl Into<String>) {
        self.errors.push(Diagnostic {
            path: path.map(Utf8Path::to_path_buf),
            message: message.into(),
        });
    }

    pub(crate) fn warning(&mut self, path: Option<&Utf8Path>, message: impl Into<String>) {
        self.warnings.push(Diagnostic {
            path: path.map(Utf8Path::to_path_buf),
            message: message.into(),
        });
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// The parsed and validated desired state.
#[derive(Clone, Debug, Default)]
pub(crate) struct Entities {
    /// Organization users (protected + org), by canonical name.
    pub(crate) users: BTreeMap<String, User>,
    /// External users, by canonical name.
    pub(crate) external_users: BTreeMap<String, User>,
    /// Declared and synthesized teams, by name.
    pub(crate) teams: BTreeMap<String, Team>,
    /// All repositories, by name (archived declarations included).
    pub(crate) repositories: BTreeMap<String, Repository>,
    /// Organization ruleset entities, by name.
    pub(crate) rulesets: BTreeMap<String, Ruleset>,
}

#[instrument(skip_all)]
pub(crate) fn load_and_validate_local(
    worktree: &dyn Worktree,
    config: &RepoConfig,
) -> (Entities, Diagnostics) {
    let mut entities = Entities::default();
    let mut diags = Diagnostics::default();

    load_users(worktree, &mut entities, &mut diags);
    load_teams_tree(worktree, &mut entities, &mut diags);
    load_archived(worktree, &mut entities, &mut diags);
    load_rulesets(worktree, &mut entities, &mut diags);

    validate(&mut entities, config, &mut diags);

    if !diags.has_errors() {
        synthesize_teams(&mut entities, config);
    }

    (entities, diags)
}

fn load_users(worktree: &dyn Worktree, entities: &mut Entities, diags: &mut Diagnostics) {
    for (dir, kind) in [
        ("users/protected", UserKind::Protected),
        ("users/org", UserKind::Org),
        ("users/external", UserKind::External),
    ] {
        let files = match worktree.walk(Utf8Path::new(dir)) {
            Ok(files) => files,
            Err(e) => {
                diags.error(Some(Utf8Path::new(dir)), format!("cannot list: {e}"));
                continue;
            }
        };
        for path in files.iter().filter(|p| is_yaml(p)) {
            let contents = match worktree.read_to_string(path) {
                Ok(contents) => contents,
                Err(e) => {
                    diags.error(Some(path), format!("cannot read: {e}"));
                    continue;
                }
            };
            match User::parse(&contents, path, kind) {
                Ok(user) => {
                    let bucket = if kind == UserKind::External {
                        &mut entities.external_users
                    } else {
                        &mut entities.users
                    };
                    if bucket.contains_key(&user.name) {
                        diags.error(Some(path), format!("duplicate user `{}`", user.name));
                    } else {
                        bucket.insert(user.name.clone(), user);
                    }
                }
                Err(e) => diags.error(Some(path), e.to_string()),
            }
        }
    }
}

fn load_teams_tree(worktree: &dyn Worktree, entities: &mut Entities, diags: &mut Diagnostics) {
    let root = Utf8Path::new("teams");
    let dirs = match worktree.subdirs(root) {
        Ok(dirs) => dirs,
        Err(e) => {
            diags.error(Some(root), format!("cannot list: {e}"));
            return;
        }
    };
    for dir in dirs {
        load_team_dir(worktree, &dir, None, entities, diags);
    }
}

fn load_team_dir(
    worktree: &dyn Worktree,
    dir: &Utf8Path,
    parent: Option<&str>,
    entities: &mut Entities,
    diags: &mut Diagnostics,
) {
    let dir_name = dir.file_name().unwrap_or_default().to_string();
    let team_file = dir.join("team.yaml");
    let mut team_name = None;

    if worktree.exists(&team_file) {
        match worktree
            .read_to_string(&team_file)
            .map_err(|e| e.to_string())
            .and_then(|contents| {
                Team::parse(&contents, &team_file, parent).map_err(|e| e.to_string())
            }) {
            Ok(team) => {
                if team.name != dir_name {
                    diags.error(
                        Some(&team_file),
                        format!(
                            "team `{name}` must live in a directory of the same name, not `{dir_name}`",
                            name = team.name
                        ),
                    );
                } else if entities.teams.contains_key(&team.name) {
                    diags.error(Some(&team_file), format!("duplicate team `{}`", team.name));
                } else {
                    team_name = Some(team.name.clone());
                    entities.teams.insert(team.name.clone(), team);
                }
            }
            Err(e) => diags.error(Some(&team_file), e),
        }
    } else {
        diags.error(Some(dir), "team directory without a team.yaml");
    }

    // Repository declarations live next to team.yaml.
    if let Some(owner) = team_name.as_deref() {
        let files = worktree.walk(dir).unwrap_or_default();
        for path in files.iter().filter(|p| {
            is_yaml(p)
                && p.parent() == Some(dir)
                && p.file_name() != Some("team.yaml")
        }) {
            let contents = match worktree.read_to_string(path) {
                Ok(contents) => contents,
                Err(e) => {
                    diags.error(Some(path), format!("cannot read: {e}"));
                    continue;
                }
            };
            match Repository::parse(&contents, path, Some(owner)) {
                Ok(repo) => {
                    if entities.repositories.contains_key(&repo.name) {
                        diags.error(
                            Some(path),
                            format!("repository `{}` is declared more than once", repo.name),
                        );
                    } else {
                        entities.repositories.insert(repo.name.clone(), repo);
                    }
                }
                Err(e) => diags.error(Some(path), e.to_string()),
            }
        }
    }

    let subdirs = worktree.subdirs(dir).unwrap_or_default();
    for subdir in subdirs {
        load_team_dir(worktree, &subdir, team_name.as_deref(), entities, diags);
    }
}

fn load_archived(worktree: &dyn Worktree, entities: &mut Entities, diags: &mut Diagnostics) {
    let files = worktree.walk(Utf8Path::new("archived")).unwrap_or_default();
    for path in files.iter().filter(|p| is_yaml(p)) {
        let contents = match worktree.read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                diags.error(Some(path), format!("cannot read: {e}"));
                continue;
            }
        };
        match Repository::parse(&contents, path, None) {
            Ok(repo) => {
                if entities.repositories.contains_key(&repo.name) {
                    diags.error(
                        Some(path),
                        format!(
                            "repository `{}` is declared both archived and owned by a team",
                            repo.name
                        ),
                    );
                } else {
                    entities.repositories.insert(repo.name.clone(), repo);
                }
            }
            Err(e) => diags.error(Some(path), e.to_string()),
        }
    }
}

fn load_rulesets(worktree: &dyn Worktree, entities: &mut Entities, diags: &mut Diagnostics) {
    let files = worktree.walk(Utf8Path::new("rulesets")).unwrap_or_default();
    for path in files.iter().filter(|p| is_yaml(p)) {
        let contents = match worktree.read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                diags.error(Some(path), format!("cannot read: {e}"));
                continue;
            }
        };
        match Ruleset::parse(&contents, path) {
            Ok(ruleset) => {
                entities.rulesets.insert(ruleset.name.clone(), ruleset);
            }
            Err(e) => diags.error(Some(path), e.to_string()),
        }
    }
}

/// Cross-entity validation. Runs after all files are parsed.
fn validate(entities: &mut Entities, config: &RepoConfig, diags: &mut Diagnostics) {
    validate_teams(entities, diags);
    validate_parent_cycles(entities, diags);
    validate_repositories(entities, config, diags);
    validate_ruleset_bindings(entities, config, diags);
}

fn validate_teams(entities: &Entities, diags: &mut Diagnostics) {
    for team in entities.teams.values() {
        let path = team.dirpath.join("team.yaml");
        if team.name == EVERYONE_TEAM {
            diags.error(Some(&path), format!("`{EVERYONE_TEAM}` is a reserved team name"));
        }
        if team.name.ends_with(OWNERS_SUFFIX) {
            diags.error(
                Some(&path),
                format!("team names must not end with the reserved suffix `{OWNERS_SUFFIX}`"),
            );
        }

        if team.externally_managed {
            if !team.owners.is_empty() || !team.members.is_empty() {
                diags.error(
                    Some(&path),
                    "externally managed teams must not declare owners or members",
                );
            }
        } else {
            for member in team.owners.iter().chain(&team.members) {
                if entities.users.contains_key(member) {
                    continue;
                }
                if entities.external_users.contains_key(member) {
                    diags.error(
                        Some(&path),
                        format!("external user `{member}` cannot be a team member"),
                    );
                } else {
                    diags.error(Some(&path), format!("unknown user `{member}`"));
                }
            }
        }

        if let Some(parent) = &team.parent_team
            && !entities.teams.contains_key(parent)
        {
            diags.error(Some(&path), format!("unknown parent team `{parent}`"));
        }
    }
}

/// Detects cycles in the parent graph by walking name indices over the
/// flat team table; a chain longer than the table is a cycle.
fn validate_parent_cycles(entities: &Entities, diags: &mut Diagnostics) {
    let limit = entities.teams.len();
    for (name, team) in &entities.teams {
        let mut hops = 0usize;
        let mut cursor = team.parent_team.as_deref();
        while let Some(parent) = cursor {
            hops += 1;
            if hops > limit {
                diags.error(
                    Some(&team.dirpath.join("team.yaml")),
                    format!("team `{name}` is part of a parent cycle"),
                );
                break;
            }
            cursor = entities
                .teams
                .get(parent)
                .and_then(|t| t.parent_team.as_deref());
        }
    }
}

fn validate_repositories(entities: &mut Entities, config: &RepoConfig, diags: &mut Diagnostics) {
    let team_names: Vec<String> = entities.teams.keys().cloned().collect();
    let repo_names: Vec<String> = entities.repositories.keys().cloned().collect();

    let mut rename_targets: BTreeMap<String, String> = BTreeMap::new();
    for repo in entities.repositories.values_mut() {
        let path = repo_path(repo);

        for team in repo.spec.writers.iter().chain(&repo.spec.readers) {
            if !team_names.contains(team) {
                diags.error(Some(&path), format!("unknown team `{team}`"));
            }
        }
        if let Some(owner) = &repo.owner
            && repo.spec.writers.contains(owner)
        {
            diags.warning(
                Some(&path),
                format!("owning team `{owner}` is implicitly a writer"),
            );
        }

        for user in repo
            .spec
            .external_user_readers
            .iter()
            .chain(&repo.spec.external_user_writers)
        {
            if !entities.external_users.contains_key(user) {
                diags.error(Some(&path), format!("unknown external user `{user}`"));
            }
        }

        if let Some(target) = &repo.rename_to {
            if repo_names.contains(target) {
                diags.error(
                    Some(&path),
                    format!("renameTo target `{target}` is already a declared repository"),
                );
            } else if let Some(previous) = rename_targets.insert(target.clone(), repo.name.clone())
            {
                diags.error(
                    Some(&path),
                    format!("renameTo target `{target}` is already used by `{previous}`"),
                );
            }
        }

        // Visibility policy: a forbidden public repository is demoted and
        // reported; the cycle continues.
        if repo.spec.visibility == Visibility::Public
            && config.visibility_rules.forbid_public_repositories
            && !config
                .visibility_rules
                .forbid_public_repositories_exclusions
                .contains(&repo.name)
        {
            diags.warning(
                Some(&path),
                format!(
                    "public repositories are forbidden: `{}` is kept private",
                    repo.name
                ),
            );
            repo.spec.visibility = Visibility::Private;
        }
    }
}

fn validate_ruleset_bindings(entities: &Entities, config: &RepoConfig, diags: &mut Diagnostics) {
    for binding in &config.rulesets {
        if !entities.rulesets.contains_key(&binding.ruleset) {
            diags.error(
                Some(Utf8Path::new(crate::config::CONFIG_FILE)),
                format!("unknown ruleset `{}`", binding.ruleset),
            );
        }
    }
}

/// Attaches the synthetic teams: the optional `everyone` team and the
/// per-team owners shadow teams.
fn synthesize_teams(entities: &mut Entities, config: &RepoConfig) {
    let admin_owners: Vec<String> = entities
        .teams
        .get(&config.admin_team)
        .map(|team| team.owners.clone())
        .unwrap_or_default();

    let mut synthesized: Vec<Team> = Vec::new();
    for team in entities.teams.values() {
        let mut members = team.owners.clone();
        for owner in &admin_owners {
            if !members.contains(owner) {
                members.push(owner.clone());
            }
        }
        synthesized.push(Team {
            name: format!("{}{OWNERS_SUFFIX}", team.name),
            externally_managed: false,
            owners: Vec::new(),
            members,
            parent_team: None,
            dirpath: team.dirpath.clone(),
        });
    }

    if config.everyone_team_enabled {
        synthesized.push(Team {
            name: EVERYONE_TEAM.into(),
            externally_managed: false,
            owners: Vec::new(),
            members: entities.users.keys().cloned().collect(),
            parent_team: None,
            dirpath: Utf8PathBuf::from("teams"),
        });
    }

    for team in synthesized {
        entities.teams.insert(team.name.clone(), team);
    }
}

fn repo_path(repo: &Repository) -> Utf8PathBuf {
    match &repo.owner {
        Some(owner) => Utf8PathBuf::from(format!("teams/{owner}/{}.yaml", repo.name)),
        None => Utf8PathBuf::from(format!("archived/{}.yaml", repo.name)),
    }
}

fn is_yaml(path: &Utf8Path) -> bool {
    matches!(path.extension(), Some("yaml") | Some("yml"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::worktree::MemoryWorktree;

    fn user_yaml(name: &str) -> String {
        format!("apiVersion: v1\nkind: User\nname: {name}\n")
    }

    fn seeded_tree() -> MemoryWorktree {
        let tree = MemoryWorktree::new();
        tree.seed("users/org/alice.yaml", &user_yaml("alice"));
        tree.seed("users/org/bob.yaml", &user_yaml("bob"));
        tree.seed("users/external/carol.yaml", &user_yaml("carol"));
        tree.seed(
            "teams/admin/team.yaml",
            "apiVersion: v1\nkind: Team\nname: admin\nspec:\n  owners: [alice]\n",
        );
        tree.seed(
            "teams/sre/team.yaml",
            "apiVersion: v1\nkind: Team\nname: sre\nspec:\n  owners: [alice]\n  members: [bob]\n",
        );
        tree.seed(
            "teams/sre/repo1.yaml",
            "apiVersion: v1\nkind: Repository\nname: repo1\nspec:\n  externalUserReaders: [carol]\n",
        );
        tree
    }

    #[test]
    fn loads_a_valid_tree() {
        let (entities, diags) = load_and_validate_local(&seeded_tree(), &RepoConfig::default());
        assert_eq!(diags.errors, vec![]);

        assert_eq!(entities.users.len(), 2);
        assert_eq!(entities.external_users.len(), 1);
        assert!(entities.repositories.contains_key("repo1"));

        // Declared teams plus their owners shadows.
        assert!(entities.teams.contains_key("sre"));
        assert!(entities.teams.contains_key("sre-owners"));
        assert!(entities.teams.contains_key("admin-owners"));
        // Owners shadow carries the team owners plus the admin owners.
        assert_eq!(entities.teams["sre-owners"].members, vec!["alice"]);
    }

    #[test]
    fn everyone_team_synthesis() {
        let config = RepoConfig {
            everyone_team_enabled: true,
            ..RepoConfig::default()
        };
        let (entities, diags) = load_and_validate_local(&seeded_tree(), &config);
        assert_eq!(diags.errors, vec![]);
        assert_eq!(entities.teams[EVERYONE_TEAM].members, vec!["alice", "bob"]);
    }

    #[test]
    fn duplicate_repo_is_rejected() {
        let tree = seeded_tree();
        tree.seed(
            "archived/repo1.yaml",
            "apiVersion: v1\nkind: Repository\nname: repo1\n",
        );
        let (_, diags) = load_and_validate_local(&tree, &RepoConfig::default());
        assert!(
            diags
                .errors
                .iter()
                .any(|d| d.message.contains("declared both archived"))
        );
    }

    #[test]
    fn unknown_member_and_external_member_are_rejected() {
        let tree = seeded_tree();
        tree.seed(
            "teams/bad/team.yaml",
            "apiVersion: v1\nkind: Team\nname: bad\nspec:\n  members: [ghost, carol]\n",
        );
        let (_, diags) = load_and_validate_local(&tree, &RepoConfig::default());
        assert!(diags.errors.iter().any(|d| d.message.contains("unknown user `ghost`")));
        assert!(
            diags
                .errors
                .iter()
                .any(|d| d.message.contains("external user `carol` cannot be a team member"))
        );
    }

    #[test]
    fn reserved_names_are_rejected() {
        let tree = seeded_tree();
        tree.seed(
            "teams/everyone/team.yaml",
            "apiVersion: v1\nkind: Team\nname: everyone\n",
        );
        tree.seed(
            "teams/x-owners/team.yaml",
            "apiVersion: v1\nkind: Team\nname: x-owners\n",
        );
        let (_, diags) = load_and_validate_local(&tree, &RepoConfig::default());
        assert!(diags.errors.iter().any(|d| d.message.contains("reserved team name")));
        assert!(diags.errors.iter().any(|d| d.message.contains("reserved suffix")));
    }

    #[test]
    fn parent_cycles_are_rejected() {
        let tree = seeded_tree();
        tree.seed(
            "teams/a/team.yaml",
            "apiVersion: v1\nkind: Team\nname: a\nspec:\n  parentTeam: b\n",
        );
        tree.seed(
            "teams/b/team.yaml",
            "apiVersion: v1\nkind: Team\nname: b\nspec:\n  parentTeam: a\n",
        );
        let (_, diags) = load_and_validate_local(&tree, &RepoConfig::default());
        assert!(diags.errors.iter().any(|d| d.message.contains("parent cycle")));
    }

    #[test]
    fn externally_managed_must_have_empty_membership() {
        let tree = seeded_tree();
        tree.seed(
            "teams/platform/team.yaml",
            "apiVersion: v1\nkind: Team\nname: platform\nspec:\n  externallyManaged: true\n  members: [bob]\n",
        );
        let (_, diags) = load_and_validate_local(&tree, &RepoConfig::default());
        assert!(
            diags
                .errors
                .iter()
                .any(|d| d.message.contains("externally managed"))
        );
    }

    #[test]
    fn forbidden_public_repo_is_demoted_with_warning() {
        let tree = seeded_tree();
        tree.seed(
            "teams/sre/repo2.yaml",
            "apiVersion: v1\nkind: Repository\nname: repo2\nspec:\n  visibility: public\n",
        );
        let config = RepoConfig {
            visibility_rules: crate::config::VisibilityRules {
                forbid_public_repositories: true,
                forbid_public_repositories_exclusions: vec![],
            },
            ..RepoConfig::default()
        };
        let (entities, diags) = load_and_validate_local(&tree, &config);
        assert_eq!(diags.errors, vec![]);
        assert_eq!(
            entities.repositories["repo2"].spec.visibility,
            Visibility::Private
        );
        assert!(diags.warnings.iter().any(|d| d.message.contains("kept private")));
    }

    #[test]
    fn rename_collision_is_rejected() {
        let tree = seeded_tree();
        tree.seed(
            "teams/sre/repo5.yaml",
            "apiVersion: v1\nkind: Repository\nname: repo5\nrenameTo: repo1\n",
        );
        let (_, diags) = load_and_validate_local(&tree, &RepoConfig::default());
        assert!(
            diags
                .errors
                .iter()
                .any(|d| d.message.contains("already a declared repository"))
        );
    }
}

//! Deterministic CODEOWNERS generation from the team tree.
//!
//! The file is a pure function of the team tree and the admin team name:
//! regenerating it from unchanged inputs is byte-identical. Entries are
//! sorted by path-prefix length (shortest first, ties lexicographic) so
//! the platform's last-match-wins semantics yield the expected coverage.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::entity::{EVERYONE_TEAM, OWNERS_SUFFIX, slugify, team::Team};

pub(crate) fn generate_codeowners(
    teams: &BTreeMap<String, Team>,
    org: &str,
    admin_team_slug: &str,
) -> String {
    let mut lines = vec![format!("* @{org}/{admin_team_slug}")];

    let entries = teams
        .values()
        .filter(|team| !team.name.ends_with(OWNERS_SUFFIX) && team.name != EVERYONE_TEAM)
        .map(|team| {
            let chain = team_path(team);
            let prefix = format!("/teams/{chain}/*");
            let line = format!(
                "{prefix} @{org}/{slug}{OWNERS_SUFFIX} @{org}/{admin_team_slug}",
                slug = slugify(&team.name),
            );
            (prefix.len(), line)
        })
        .sorted_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    lines.extend(entries.map(|(_, line)| line));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// The slash-joined directory chain from the root ancestor to the team,
/// with spaces escaped for the CODEOWNERS syntax.
fn team_path(team: &Team) -> String {
    team.dirpath
        .strip_prefix("teams")
        .unwrap_or(&team.dirpath)
        .as_str()
        .trim_start_matches('/')
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    use super::*;

    fn team(name: &str, dir: &str) -> (String, Team) {
        (
            name.to_string(),
            Team {
                name: name.to_string(),
                externally_managed: false,
                owners: vec![],
                members: vec![],
                parent_team: None,
                dirpath: Utf8PathBuf::from(dir),
            },
        )
    }

    fn tree() -> BTreeMap<String, Team> {
        BTreeMap::from([
            team("platform", "teams/platform"),
            team("SRE Team", "teams/SRE Team"),
            team("app", "teams/platform/app"),
        ])
    }

    #[test]
    fn layout_and_ordering() {
        let rendered = generate_codeowners(&tree(), "acme", "admin");
        insta::assert_snapshot!(rendered, @r"
        * @acme/admin
        /teams/platform/* @acme/platform-owners @acme/admin
        /teams/SRE\ Team/* @acme/sre-team-owners @acme/admin
        /teams/platform/app/* @acme/app-owners @acme/admin
        ");
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let teams = tree();
        assert_eq!(
            generate_codeowners(&teams, "acme", "admin"),
            generate_codeowners(&teams, "acme", "admin"),
        );
    }

    #[test]
    fn synthetic_teams_are_excluded() {
        let mut teams = tree();
        teams.extend([
            team("platform-owners", "teams/platform"),
            team("everyone", "teams"),
        ]);
        let rendered = generate_codeowners(&teams, "acme", "admin");
        assert!(!rendered.contains("platform-owners-owners"));
        assert!(!rendered.contains("@acme/everyone-owners"));
    }
}

//! The `Team` entity.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityError, Manifest, parse_manifest, slugify};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct TeamSpec {
    /// When true, membership is mirrored from the platform and the local
    /// owner/member lists must be empty.
    pub(crate) externally_managed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) owners: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) members: Vec<String>,
    /// Explicit parent team. Defaults to the directory-implied parent for
    /// nested team directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) parent_team: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Team {
    pub(crate) name: String,
    pub(crate) externally_managed: bool,
    /// Owners are a superset of members with administrative authority over
    /// the team's subtree of the teams repository.
    pub(crate) owners: Vec<String>,
    pub(crate) members: Vec<String>,
    pub(crate) parent_team: Option<String>,
    /// Directory of the team inside `teams/`, e.g. `teams/sre/app`.
    pub(crate) dirpath: Utf8PathBuf,
}

impl Team {
    /// Parses a `team.yaml`. `dir_parent` is the team implied by directory
    /// nesting, overridden by an explicit `parentTeam`.
    pub(crate) fn parse(
        contents: &str,
        path: &Utf8Path,
        dir_parent: Option<&str>,
    ) -> Result<Self, EntityError> {
        let manifest: Manifest<TeamSpec> = parse_manifest(contents, "Team", path)?;
        let spec = manifest.spec.unwrap_or_default();
        let dirpath = path.parent().unwrap_or(Utf8Path::new("")).to_path_buf();
        Ok(Self {
            name: manifest.name,
            externally_managed: spec.externally_managed,
            owners: spec.owners,
            members: spec.members,
            parent_team: spec
                .parent_team
                .or_else(|| dir_parent.map(str::to_string)),
            dirpath,
        })
    }

    pub(crate) fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// All humans attached to the team. Owners are also members.
    pub(crate) fn all_members(&self) -> Vec<String> {
        let mut all = self.owners.clone();
        for member in &self.members {
            if !all.contains(member) {
                all.push(member.clone());
            }
        }
        all
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_team() {
        let team = Team::parse(
            "apiVersion: v1\nkind: Team\nname: sre\nspec:\n  owners: [alice]\n  members: [bob]\n",
            Utf8Path::new("teams/sre/team.yaml"),
            None,
        )
        .unwrap();
        assert_eq!(team.name, "sre");
        assert_eq!(team.owners, vec!["alice"]);
        assert_eq!(team.members, vec!["bob"]);
        assert_eq!(team.parent_team, None);
        assert_eq!(team.dirpath, Utf8PathBuf::from("teams/sre"));
        assert_eq!(team.all_members(), vec!["alice", "bob"]);
    }

    #[test]
    fn directory_nesting_implies_parent() {
        let team = Team::parse(
            "apiVersion: v1\nkind: Team\nname: app\n",
            Utf8Path::new("teams/sre/app/team.yaml"),
            Some("sre"),
        )
        .unwrap();
        assert_eq!(team.parent_team.as_deref(), Some("sre"));
    }

    #[test]
    fn explicit_parent_wins() {
        let team = Team::parse(
            "apiVersion: v1\nkind: Team\nname: app\nspec:\n  parentTeam: platform\n",
            Utf8Path::new("teams/sre/app/team.yaml"),
            Some("sre"),
        )
        .unwrap();
        assert_eq!(team.parent_team.as_deref(), Some("platform"));
    }

    #[test]
    fn owners_are_deduplicated_in_all_members() {
        let team = Team::parse(
            "apiVersion: v1\nkind: Team\nname: sre\nspec:\n  owners: [alice]\n  members: [alice, bob]\n",
            Utf8Path::new("teams/sre/team.yaml"),
            None,
        )
        .unwrap();
        assert_eq!(team.all_members(), vec!["alice", "bob"]);
    }
}

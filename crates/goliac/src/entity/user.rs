//! The `User` entity.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityError, Manifest, parse_manifest};

/// Which directory a user was declared in. External users may only appear
/// as repository collaborators, never as team members.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserKind {
    Protected,
    Org,
    External,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct UserSpec {
    /// The user's login on the platform.
    #[serde(default)]
    pub(crate) github_i_d: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct User {
    /// Canonical handle used in cross-references (team members, owners,
    /// external collaborator lists).
    pub(crate) name: String,
    /// The platform login.
    pub(crate) github_id: String,
    pub(crate) kind: UserKind,
}

impl User {
    pub(crate) fn parse(
        contents: &str,
        path: &Utf8Path,
        kind: UserKind,
    ) -> Result<Self, EntityError> {
        let manifest: Manifest<UserSpec> = parse_manifest(contents, "User", path)?;
        let spec = manifest.spec.unwrap_or_default();
        let github_id = if spec.github_i_d.is_empty() {
            // Absent githubID means the handle is the login.
            manifest.name.clone()
        } else {
            spec.github_i_d
        };
        Ok(Self {
            name: manifest.name,
            github_id,
            kind,
        })
    }

    /// Serializes back to the on-disk YAML form, used by the user-sync
    /// apply path.
    pub(crate) fn to_yaml(&self) -> String {
        let manifest = Manifest {
            api_version: crate::entity::API_VERSION.into(),
            kind: "User".into(),
            name: self.name.clone(),
            spec: Some(UserSpec {
                github_i_d: self.github_id.clone(),
            }),
        };
        serde_yaml::to_string(&manifest).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_explicit_login() {
        let user = User::parse(
            "apiVersion: v1\nkind: User\nname: alice\nspec:\n  githubID: alice-gh\n",
            Utf8Path::new("users/org/alice.yaml"),
            UserKind::Org,
        )
        .unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.github_id, "alice-gh");
        assert_eq!(user.kind, UserKind::Org);
    }

    #[test]
    fn login_defaults_to_name() {
        let user = User::parse(
            "apiVersion: v1\nkind: User\nname: bob\n",
            Utf8Path::new("users/external/bob.yaml"),
            UserKind::External,
        )
        .unwrap();
        assert_eq!(user.github_id, "bob");
    }

    #[test]
    fn yaml_roundtrip() {
        let user = User {
            name: "alice".into(),
            github_id: "alice-gh".into(),
            kind: UserKind::Org,
        };
        let reparsed = User::parse(
            &user.to_yaml(),
            Utf8Path::new("users/org/alice.yaml"),
            UserKind::Org,
        )
        .unwrap();
        assert_eq!(user, reparsed);
    }
}

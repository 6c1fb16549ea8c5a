//! The `Repository` entity.

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::entity::{
    EntityError, Manifest, parse_manifest,
    ruleset::{BranchProtection, NamedRuleset},
};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Visibility {
    Public,
    #[default]
    Private,
    Internal,
}

impl Visibility {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Internal => "internal",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct Environment {
    pub(crate) name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) variables: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct Autolink {
    pub(crate) key_prefix: String,
    pub(crate) url_template: String,
    pub(crate) is_alphanumeric: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RepositorySpec {
    pub(crate) visibility: Visibility,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) archived: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) writers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) readers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) external_user_readers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) external_user_writers: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) allow_auto_merge: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) delete_branch_on_merge: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) allow_update_branch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) default_branch_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) rulesets: Vec<NamedRuleset>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) branch_protections: Vec<BranchProtection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) environments: Vec<Environment>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) actions_variables: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) autolinks: Option<Vec<Autolink>>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Repository {
    pub(crate) name: String,
    /// Owning team, implicit from the directory the file lives in.
    /// `None` for `archived/` declarations.
    pub(crate) owner: Option<String>,
    pub(crate) spec: RepositorySpec,
    pub(crate) rename_to: Option<String>,
    pub(crate) fork_from: Option<String>,
    /// Whether the repository was declared under `archived/`.
    pub(crate) archived_marker: bool,
}

/// Envelope extension carrying the repository-only top-level fields.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryManifestExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rename_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fork_from: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryManifest {
    #[serde(flatten)]
    manifest: Manifest<RepositorySpec>,
    #[serde(flatten)]
    extras: RepositoryManifestExtras,
}

impl Repository {
    pub(crate) fn parse(
        contents: &str,
        path: &Utf8Path,
        owner: Option<&str>,
    ) -> Result<Self, EntityError> {
        // Envelope checks run on the plain manifest parse.
        let _checked: Manifest<serde_yaml::Value> = parse_manifest(contents, "Repository", path)?;
        let full: RepositoryManifest = serde_yaml::from_str(contents)?;
        let mut spec = full.manifest.spec.unwrap_or_default();
        let archived_marker = owner.is_none();
        if archived_marker {
            spec.archived = true;
        }
        Ok(Self {
            name: full.manifest.name,
            owner: owner.map(str::to_string),
            spec,
            rename_to: full.extras.rename_to,
            fork_from: full.extras.fork_from,
            archived_marker,
        })
    }

    /// The four managed boolean repository properties.
    pub(crate) fn bool_properties(&self) -> BTreeMap<String, bool> {
        BTreeMap::from([
            ("allow_auto_merge".to_string(), self.spec.allow_auto_merge),
            (
                "delete_branch_on_merge".to_string(),
                self.spec.delete_branch_on_merge,
            ),
            (
                "allow_update_branch".to_string(),
                self.spec.allow_update_branch,
            ),
            ("archived".to_string(), self.spec.archived),
        ])
    }

    /// The minimal body written to `archived/{name}.yaml`.
    pub(crate) fn archived_stub(name: &str) -> String {
        let manifest = Manifest::<RepositorySpec> {
            api_version: crate::entity::API_VERSION.into(),
            kind: "Repository".into(),
            name: name.into(),
            spec: None,
        };
        serde_yaml::to_string(&manifest).unwrap_or_default()
    }

    pub(crate) fn to_yaml(&self) -> String {
        let manifest = RepositoryManifest {
            manifest: Manifest {
                api_version: crate::entity::API_VERSION.into(),
                kind: "Repository".into(),
                name: self.name.clone(),
                spec: Some(self.spec.clone()),
            },
            extras: RepositoryManifestExtras {
                rename_to: self.rename_to.clone(),
                fork_from: self.fork_from.clone(),
            },
        };
        serde_yaml::to_string(&manifest).unwrap_or_default()
    }
}

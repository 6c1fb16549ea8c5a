//! Typed models for the declarative entities held in the teams repository.
//!
//! Every on-disk entity shares the `{apiVersion, kind, name}` envelope;
//! filenames must match the entity name. Parsing is per-file and collects
//! diagnostics instead of failing fast, so one malformed file never hides
//! the errors in the next one.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

pub(crate) mod loader;
pub(crate) mod repository;
pub(crate) mod ruleset;
pub(crate) mod team;
pub(crate) mod user;

pub(crate) use loader::load_and_validate_local;

pub(crate) const API_VERSION: &str = "v1";

/// Suffix of the synthesized per-team owners team.
pub(crate) const OWNERS_SUFFIX: &str = "-owners";

/// Name of the optional synthetic team containing every organization user.
pub(crate) const EVERYONE_TEAM: &str = "everyone";

#[derive(Debug, Error)]
pub(crate) enum EntityError {
    #[error("invalid YAML: {0}")]
    Syntax(#[from] serde_yaml::Error),
    #[error("unsupported apiVersion `{0}` (expected `{API_VERSION}`)")]
    ApiVersion(String),
    #[error("unexpected kind `{found}` (expected `{expected}`)")]
    Kind { expected: &'static str, found: String },
    #[error("entity name `{name}` does not match file name `{file}`")]
    NameMismatch { name: String, file: String },
    #[error("entity name `{0}` is empty or not a valid slug source")]
    BadName(String),
}

/// The shared `{apiVersion, kind, name}` envelope around an entity `spec`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Manifest<S> {
    pub(crate) api_version: String,
    pub(crate) kind: String,
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) spec: Option<S>,
}

/// Parses one entity file, checking the envelope against `kind` and the
/// file stem.
pub(crate) fn parse_manifest<S: DeserializeOwned + Default>(
    contents: &str,
    kind: &'static str,
    path: &Utf8Path,
) -> Result<Manifest<S>, EntityError> {
    let manifest: Manifest<S> = serde_yaml::from_str(contents)?;

    if manifest.api_version != API_VERSION {
        return Err(EntityError::ApiVersion(manifest.api_version));
    }
    if manifest.kind != kind {
        return Err(EntityError::Kind {
            expected: kind,
            found: manifest.kind,
        });
    }
    if manifest.name.trim().is_empty() {
        return Err(EntityError::BadName(manifest.name));
    }

    let stem = path.file_stem().unwrap_or_default();
    // `team.yaml` files take their name from the manifest, not the file.
    if stem != "team" && stem != manifest.name {
        return Err(EntityError::NameMismatch {
            name: manifest.name,
            file: path.to_string(),
        });
    }

    Ok(manifest)
}

/// GitHub-style slug: lowercased, with every non-alphanumeric run
/// collapsed into a single dash.
pub(crate) fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// A single validation diagnostic, tied to the file it came from when one
/// is known.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct Diagnostic {
    pub(crate) path: Option<Utf8PathBuf>,
    pub(crate) message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}: {message}", message = self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_basics() {
        assert_eq!(slugify("SRE Team"), "sre-team");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
        assert_eq!(slugify("weird__name!!x"), "weird-name-x");
        assert_eq!(slugify("--edge--"), "edge");
    }

    #[test]
    fn envelope_is_checked() {
        let err = parse_manifest::<serde_yaml::Value>(
            "apiVersion: v2\nkind: User\nname: alice\n",
            "User",
            Utf8Path::new("users/org/alice.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, EntityError::ApiVersion(_)));

        let err = parse_manifest::<serde_yaml::Value>(
            "apiVersion: v1\nkind: Team\nname: alice\n",
            "User",
            Utf8Path::new("users/org/alice.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, EntityError::Kind { .. }));

        let err = parse_manifest::<serde_yaml::Value>(
            "apiVersion: v1\nkind: User\nname: bob\n",
            "User",
            Utf8Path::new("users/org/alice.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, EntityError::NameMismatch { .. }));
    }
}

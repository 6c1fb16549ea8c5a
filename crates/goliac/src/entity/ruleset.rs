//! Ruleset and branch-protection models, shared by organization-level
//! ruleset entities (`rulesets/*.yaml`) and per-repository rulesets.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityError, Manifest, parse_manifest};

/// Reserved include/exclude patterns that must not be `refs/heads/`-prefixed
/// when building API payloads.
pub(crate) const DEFAULT_BRANCH_PATTERN: &str = "~DEFAULT_BRANCH";
pub(crate) const ALL_BRANCHES_PATTERN: &str = "~ALL";

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Enforcement {
    Disabled,
    #[default]
    Evaluate,
    Active,
}

impl Enforcement {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Evaluate => "evaluate",
            Self::Active => "active",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct RulesetConditions {
    pub(crate) include: Vec<String>,
    pub(crate) exclude: Vec<String>,
}

/// A typed enforcement rule. Variant names map one-to-one onto the
/// platform's canonical lower-cased rule types.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Rule {
    RequiredSignatures,
    PullRequest {
        #[serde(default, rename = "dismissStaleReviewsOnPush")]
        dismiss_stale_reviews_on_push: bool,
        #[serde(default, rename = "requireCodeOwnerReview")]
        require_code_owner_review: bool,
        #[serde(default, rename = "requiredApprovingReviewCount")]
        required_approving_review_count: u32,
        #[serde(default, rename = "requireLastPushApproval")]
        require_last_push_approval: bool,
        #[serde(default, rename = "requiredReviewThreadResolution")]
        required_review_thread_resolution: bool,
    },
    RequiredStatusChecks {
        #[serde(default)]
        contexts: Vec<String>,
        #[serde(default)]
        strict: bool,
    },
    Creation,
    Update,
    Deletion,
    NonFastForward,
}

impl Rule {
    /// The canonical platform rule type.
    pub(crate) fn rule_type(&self) -> &'static str {
        match self {
            Self::RequiredSignatures => "required_signatures",
            Self::PullRequest { .. } => "pull_request",
            Self::RequiredStatusChecks { .. } => "required_status_checks",
            Self::Creation => "creation",
            Self::Update => "update",
            Self::Deletion => "deletion",
            Self::NonFastForward => "non_fast_forward",
        }
    }
}

/// The ruleset body shared by org-level entities and per-repo lists.
///
/// No `deny_unknown_fields` here: the body is also deserialized through a
/// `flatten` in [`NamedRuleset`], which is incompatible with it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct RulesetDefinition {
    pub(crate) enforcement: Enforcement,
    pub(crate) bypass_apps: Vec<String>,
    pub(crate) bypass_teams: Vec<String>,
    pub(crate) conditions: RulesetConditions,
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub(crate) rules: Vec<Rule>,
}

/// A per-repository ruleset: a named [`RulesetDefinition`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NamedRuleset {
    pub(crate) name: String,
    #[serde(flatten)]
    pub(crate) definition: RulesetDefinition,
}

/// An organization-level ruleset entity (`rulesets/<name>.yaml`).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Ruleset {
    pub(crate) name: String,
    pub(crate) definition: RulesetDefinition,
}

impl Ruleset {
    pub(crate) fn parse(contents: &str, path: &Utf8Path) -> Result<Self, EntityError> {
        let manifest: Manifest<RulesetDefinition> = parse_manifest(contents, "Ruleset", path)?;
        Ok(Self {
            name: manifest.name,
            definition: manifest.spec.unwrap_or_default(),
        })
    }
}

/// A classic branch protection, kept alongside rulesets for repositories
/// that still use them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct BranchProtection {
    pub(crate) pattern: String,
    pub(crate) requires_approving_reviews: bool,
    pub(crate) required_approving_review_count: u32,
    pub(crate) dismisses_stale_reviews: bool,
    pub(crate) requires_code_owner_reviews: bool,
    pub(crate) require_last_push_approval: bool,
    pub(crate) requires_status_checks: bool,
    pub(crate) requires_strict_status_checks: bool,
    pub(crate) required_status_check_contexts: Vec<String>,
    pub(crate) requires_conversation_resolution: bool,
    pub(crate) requires_commit_signatures: bool,
    pub(crate) requires_linear_history: bool,
    pub(crate) allows_force_pushes: bool,
    pub(crate) allows_deletions: bool,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_org_ruleset() {
        let ruleset = Ruleset::parse(
            r#"
apiVersion: v1
kind: Ruleset
name: default
spec:
  enforcement: active
  bypassApps: [goliac-app]
  conditions:
    include: ["~DEFAULT_BRANCH"]
  rules:
    - required_signatures
    - pull_request:
        requiredApprovingReviewCount: 2
        requireCodeOwnerReview: true
    - required_status_checks:
        contexts: [ci/build]
        strict: true
"#,
            Utf8Path::new("rulesets/default.yaml"),
        )
        .unwrap();

        assert_eq!(ruleset.name, "default");
        assert_eq!(ruleset.definition.enforcement, Enforcement::Active);
        assert_eq!(ruleset.definition.bypass_apps, vec!["goliac-app"]);
        assert_eq!(
            ruleset.definition.conditions.include,
            vec![DEFAULT_BRANCH_PATTERN]
        );
        assert_eq!(ruleset.definition.rules.len(), 3);
        assert_eq!(
            ruleset.definition.rules[1],
            Rule::PullRequest {
                dismiss_stale_reviews_on_push: false,
                require_code_owner_review: true,
                required_approving_review_count: 2,
                require_last_push_approval: false,
                required_review_thread_resolution: false,
            }
        );
        assert_eq!(ruleset.definition.rules[2].rule_type(), "required_status_checks");
    }

    #[test]
    fn enforcement_defaults_to_evaluate() {
        let ruleset = Ruleset::parse(
            "apiVersion: v1\nkind: Ruleset\nname: empty\n",
            Utf8Path::new("rulesets/empty.yaml"),
        )
        .unwrap();
        assert_eq!(ruleset.definition.enforcement, Enforcement::Evaluate);
        assert!(ruleset.definition.rules.is_empty());
    }
}

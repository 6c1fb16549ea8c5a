//! The status document surfaced to operators.

use serde::Serialize;

use crate::{
    engine::reconciliator::UnmanagedResources,
    entity::loader::{Diagnostics, Entities},
};

/// Per-class counts of unmanaged entities.
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct UnmanagedCounts {
    pub(crate) users: usize,
    pub(crate) teams: usize,
    pub(crate) externally_managed_teams: usize,
    pub(crate) repositories: usize,
    pub(crate) rulesets: usize,
}

impl From<&UnmanagedResources> for UnmanagedCounts {
    fn from(unmanaged: &UnmanagedResources) -> Self {
        Self {
            users: unmanaged.users.len(),
            teams: unmanaged.teams.len(),
            externally_managed_teams: unmanaged.externally_managed_teams.len(),
            repositories: unmanaged.repositories.len(),
            rulesets: unmanaged.rulesets.len(),
        }
    }
}

/// Counts of declared entities.
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct EntityCounts {
    pub(crate) users: usize,
    pub(crate) external_users: usize,
    pub(crate) teams: usize,
    pub(crate) repositories: usize,
    pub(crate) rulesets: usize,
}

impl From<&Entities> for EntityCounts {
    fn from(entities: &Entities) -> Self {
        Self {
            users: entities.users.len(),
            external_users: entities.external_users.len(),
            teams: entities.teams.len(),
            repositories: entities.repositories.len(),
            rulesets: entities.rulesets.len(),
        }
    }
}

/// What the last cycles left behind, for the operator's eyes.
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct Status {
    /// Seconds since the epoch of the last completed sync, if any.
    pub(crate) last_sync_epoch: Option<u64>,
    pub(crate) last_sync_error: Option<String>,
    pub(crate) entities: EntityCounts,
    pub(crate) unmanaged: UnmanagedCounts,
    pub(crate) errors: Vec<String>,
    pub(crate) warnings: Vec<String>,
}

impl Status {
    pub(crate) fn record_success(
        &mut self,
        entities: &Entities,
        unmanaged: &UnmanagedResources,
        diagnostics: &Diagnostics,
    ) {
        self.last_sync_epoch = Some(now_epoch());
        self.last_sync_error = None;
        self.entities = entities.into();
        self.unmanaged = unmanaged.into();
        self.errors = diagnostics.errors.iter().map(|d| d.to_string()).collect();
        self.warnings = diagnostics.warnings.iter().map(|d| d.to_string()).collect();
    }

    pub(crate) fn record_failure(&mut self, error: &str, diagnostics: Option<&Diagnostics>) {
        self.last_sync_epoch = Some(now_epoch());
        self.last_sync_error = Some(error.to_string());
        if let Some(diags) = diagnostics {
            self.errors = diags.errors.iter().map(|d| d.to_string()).collect();
            self.warnings = diags.warnings.iter().map(|d| d.to_string()).collect();
        }
    }
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_clears_the_last_error() {
        let mut status = Status::default();
        status.record_failure("boom", None);
        assert_eq!(status.last_sync_error.as_deref(), Some("boom"));

        status.record_success(
            &Entities::default(),
            &UnmanagedResources::default(),
            &Diagnostics::default(),
        );
        assert_eq!(status.last_sync_error, None);
        assert!(status.last_sync_epoch.is_some());
    }
}

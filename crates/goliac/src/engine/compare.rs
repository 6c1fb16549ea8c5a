//! The generic diff primitive.
//!
//! `compare` walks two keyed collections and invokes the callback with
//! one event per difference. Removals and changes are delivered before
//! additions, so a rename of an existing entity always lands before the
//! creation of one reusing its old name.

use std::collections::BTreeMap;

/// One difference between the desired and observed collections.
#[derive(Debug)]
pub(crate) enum DiffEvent<'a, V> {
    /// Present observed, absent desired.
    Removed(&'a str, &'a V),
    /// Present on both sides but not equal: (key, desired, observed).
    Changed(&'a str, &'a V, &'a V),
    /// Present desired, absent observed.
    Added(&'a str, &'a V),
}

/// Diffs `desired` against `observed`. The equality check and the event
/// callback may fail; the first failure aborts the walk.
pub(crate) fn compare<'a, V, E>(
    desired: &'a BTreeMap<String, V>,
    observed: &'a BTreeMap<String, V>,
    mut eq: impl FnMut(&'a V, &'a V) -> Result<bool, E>,
    mut on_event: impl FnMut(DiffEvent<'a, V>) -> Result<(), E>,
) -> Result<(), E> {
    for (key, observed_value) in observed {
        match desired.get(key) {
            None => on_event(DiffEvent::Removed(key, observed_value))?,
            Some(desired_value) => {
                if !eq(desired_value, observed_value)? {
                    on_event(DiffEvent::Changed(key, desired_value, observed_value))?;
                }
            }
        }
    }

    for (key, desired_value) in desired {
        if !observed.contains_key(key) {
            on_event(DiffEvent::Added(key, desired_value))?;
        }
    }

    Ok(())
}

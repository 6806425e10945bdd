//! Three-way field classification.
//!
//! Every field of a keyed feature (and its geometry, as one more field) is
//! classified from three observations: the base snapshot, the returned
//! package and the source as it is now. Only equality matters, so callers
//! compare digests.

use serde::{Deserialize, Serialize};

/// Sync-time state of one field of one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldState {
    /// Neither side touched the field.
    Unmodified,
    /// Edited offline only; safe to apply to the source.
    LocallyModified,
    /// Changed at the source only; the source keeps its value.
    RemotelyModified,
    /// Both sides changed it to the same value.
    Converged,
    /// Both sides changed it, differently.
    Conflicted,
}

impl FieldState {
    /// Whether the local value has to be written to the source.
    #[must_use]
    pub const fn needs_apply(self) -> bool {
        matches!(self, Self::LocallyModified)
    }
}

/// Classifies one field from its base, local and remote observations.
#[must_use]
pub fn classify<T: PartialEq + ?Sized>(base: &T, local: &T, remote: &T) -> FieldState {
    match (local == base, remote == base) {
        (true, true) => FieldState::Unmodified,
        (false, true) => FieldState::LocallyModified,
        (true, false) => FieldState::RemotelyModified,
        (false, false) if local == remote => FieldState::Converged,
        (false, false) => FieldState::Conflicted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn each_state_is_reachable() {
        assert_eq!(classify("a", "a", "a"), FieldState::Unmodified);
        assert_eq!(classify("a", "b", "a"), FieldState::LocallyModified);
        assert_eq!(classify("a", "a", "c"), FieldState::RemotelyModified);
        assert_eq!(classify("a", "b", "b"), FieldState::Converged);
        assert_eq!(classify("a", "b", "c"), FieldState::Conflicted);
    }

    proptest! {
        #[test]
        fn untouched_local_never_writes(base in 0u8..4, remote in 0u8..4) {
            let state = classify(&base, &base, &remote);
            prop_assert!(!state.needs_apply());
            prop_assert_ne!(state, FieldState::Conflicted);
        }

        #[test]
        fn untouched_remote_takes_local(base in 0u8..4, local in 0u8..4) {
            let state = classify(&base, &local, &base);
            prop_assert_eq!(state.needs_apply(), local != base);
            prop_assert_ne!(state, FieldState::Conflicted);
        }

        #[test]
        fn conflict_needs_three_distinct_values(base in 0u8..4, local in 0u8..4, remote in 0u8..4) {
            let conflicted = classify(&base, &local, &remote) == FieldState::Conflicted;
            prop_assert_eq!(conflicted, base != local && base != remote && local != remote);
        }

        #[test]
        fn swapping_sides_mirrors_the_state(base in 0u8..4, local in 0u8..4, remote in 0u8..4) {
            let forward = classify(&base, &local, &remote);
            let mirrored = match classify(&base, &remote, &local) {
                FieldState::LocallyModified => FieldState::RemotelyModified,
                FieldState::RemotelyModified => FieldState::LocallyModified,
                other => other,
            };
            prop_assert_eq!(forward, mirrored);
        }
    }
}

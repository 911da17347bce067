//! Consultants that reference stored records by id.
//!
//! Other parts of an application (bookings, favourites, reports, ...) may
//! point at amenities by their OSM id. Before a run deletes or rewrites such a
//! record, every registered consultant is asked which ids it uses and which of
//! those are currently safe to change.

use crate::error::SyncError;
use crate::models::{IdSet, OsmId};
use tracing::debug;

pub trait UsageConsultant {
    fn name(&self) -> &str;

    /// Ids this consultant currently references. Not implementing it means
    /// referencing nothing.
    fn used_ids(&self) -> anyhow::Result<IdSet> {
        Ok(IdSet::default())
    }

    /// The subset of `candidates` that may be updated right now. Not
    /// implementing it means approving nothing.
    fn safe_update_ids(&self, _candidates: &IdSet) -> anyhow::Result<IdSet> {
        Ok(IdSet::default())
    }
}

/// Consultants registered at startup; lives for the whole process and is
/// handed to each run by reference.
#[derive(Default)]
pub struct UsageRegistry {
    consultants: Vec<Box<dyn UsageConsultant>>,
}

impl UsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, consultant: Box<dyn UsageConsultant>) {
        debug!(consultant = consultant.name(), "Registered consultant");
        self.consultants.push(consultant);
    }

    pub fn len(&self) -> usize {
        self.consultants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consultants.is_empty()
    }

    /// Union of every consultant's used ids.
    pub fn used_ids(&self) -> Result<IdSet, SyncError> {
        let mut result = IdSet::default();
        for consultant in &self.consultants {
            let ids = consultant
                .used_ids()
                .map_err(|source| consultant_err(consultant.as_ref(), source))?;
            debug!(consultant = consultant.name(), used = ids.len(), "Collected used ids");
            result.extend(ids);
        }
        Ok(result)
    }

    /// The subset of `candidates` every referencing consultant approves.
    ///
    /// Each consultant is asked only about the candidates it uses; any id it
    /// does not approve is vetoed. Candidates no consultant uses stay approved.
    pub fn safe_update_ids(&self, candidates: &IdSet) -> Result<IdSet, SyncError> {
        let mut vetoed = IdSet::default();
        if candidates.is_empty() {
            return Ok(IdSet::default());
        }
        for consultant in &self.consultants {
            let used = consultant
                .used_ids()
                .map_err(|source| consultant_err(consultant.as_ref(), source))?;
            let referenced = candidates & &used;
            if referenced.is_empty() {
                continue;
            }
            let approved = consultant
                .safe_update_ids(&referenced)
                .map_err(|source| consultant_err(consultant.as_ref(), source))?;
            let denied = &referenced - &approved;
            debug!(
                consultant = consultant.name(),
                referenced = referenced.len(),
                denied = denied.len(),
                "Checked update candidates"
            );
            vetoed.extend(denied);
        }
        Ok(candidates - &vetoed)
    }
}

fn consultant_err(consultant: &dyn UsageConsultant, source: anyhow::Error) -> SyncError {
    SyncError::Consultant {
        name: consultant.name().to_string(),
        source,
    }
}

/// A fixed id set that is always in use and never approved for update.
#[derive(Debug, Clone, Default)]
pub struct ProtectedIds {
    ids: IdSet,
}

impl ProtectedIds {
    pub fn new(ids: impl IntoIterator<Item = OsmId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

impl UsageConsultant for ProtectedIds {
    fn name(&self) -> &str {
        "protected-ids"
    }

    fn used_ids(&self) -> anyhow::Result<IdSet> {
        Ok(self.ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn set(ids: &[i64]) -> IdSet {
        ids.iter().copied().collect()
    }

    struct Bookings {
        used: IdSet,
        safe: IdSet,
    }

    impl UsageConsultant for Bookings {
        fn name(&self) -> &str {
            "bookings"
        }

        fn used_ids(&self) -> anyhow::Result<IdSet> {
            Ok(self.used.clone())
        }

        fn safe_update_ids(&self, candidates: &IdSet) -> anyhow::Result<IdSet> {
            Ok(candidates.intersection(&self.safe).copied().collect())
        }
    }

    struct ApprovesEverything {
        used: IdSet,
    }

    impl UsageConsultant for ApprovesEverything {
        fn name(&self) -> &str {
            "lenient"
        }

        fn used_ids(&self) -> anyhow::Result<IdSet> {
            Ok(self.used.clone())
        }

        fn safe_update_ids(&self, _candidates: &IdSet) -> anyhow::Result<IdSet> {
            Ok(set(&[1, 2, 3, 100]))
        }
    }

    struct Broken;

    impl UsageConsultant for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn used_ids(&self) -> anyhow::Result<IdSet> {
            bail!("database unavailable")
        }
    }

    #[test]
    fn empty_registry_uses_and_vetoes_nothing() {
        let registry = UsageRegistry::new();
        assert!(registry.used_ids().unwrap().is_empty());
        assert_eq!(registry.safe_update_ids(&set(&[1])).unwrap(), set(&[1]));
    }

    #[test]
    fn used_ids_are_unioned() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(ProtectedIds::new([1, 2])));
        registry.register(Box::new(Bookings {
            used: set(&[2, 3]),
            safe: set(&[]),
        }));
        assert_eq!(registry.used_ids().unwrap(), set(&[1, 2, 3]));
    }

    #[test]
    fn one_veto_outweighs_other_approvals() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(ProtectedIds::new([5])));
        registry.register(Box::new(ApprovesEverything { used: set(&[5, 6]) }));
        assert_eq!(registry.used_ids().unwrap(), set(&[5, 6]));
        assert_eq!(registry.safe_update_ids(&set(&[5, 6])).unwrap(), set(&[6]));
    }

    #[test]
    fn unreferenced_candidates_are_not_vetoed() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(Bookings {
            used: set(&[1]),
            safe: set(&[]),
        }));
        assert_eq!(registry.safe_update_ids(&set(&[1, 7])).unwrap(), set(&[7]));
    }

    #[test]
    fn approvals_are_limited_to_candidates() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(ApprovesEverything { used: set(&[2, 7]) }));
        assert_eq!(registry.safe_update_ids(&set(&[2])).unwrap(), set(&[2]));
    }

    #[test]
    fn consultant_can_withhold_approval() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(Bookings {
            used: set(&[5, 6]),
            safe: set(&[6]),
        }));
        assert_eq!(registry.safe_update_ids(&set(&[5, 6])).unwrap(), set(&[6]));
    }

    #[test]
    fn protected_ids_are_never_approved() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(ProtectedIds::new([5])));
        assert!(registry.safe_update_ids(&set(&[5])).unwrap().is_empty());
    }

    #[test]
    fn consultant_failure_names_the_consultant() {
        let mut registry = UsageRegistry::new();
        registry.register(Box::new(Broken));
        match registry.used_ids() {
            Err(SyncError::Consultant { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("expected consultant error, got {other:?}"),
        }
    }
}

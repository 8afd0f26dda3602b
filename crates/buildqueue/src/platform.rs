//! Platform properties of actions and workers.

use std::collections::BTreeSet;

/// A single `name = value` platform property.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformProperty {
    pub name: String,
    pub value: String,
}

/// A set of platform properties.
///
/// On an action it lists the requirements; on a worker it lists what the
/// worker provides. A name may appear with several values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Platform {
    properties: BTreeSet<PlatformProperty>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(PlatformProperty {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Properties in `(name, value)` order.
    pub fn properties(&self) -> impl Iterator<Item = &PlatformProperty> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Whether a worker declaring `worker` can run an action requiring
    /// `self`: every required property must be present with an equal value.
    /// Extra worker properties are ignored.
    pub fn is_satisfied_by(&self, worker: &Platform) -> bool {
        self.properties.is_subset(&worker.properties)
    }
}

impl<N, V> FromIterator<(N, V)> for Platform
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut platform = Self::new();
        for (name, value) in iter {
            platform.insert(name, value);
        }
        platform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_requirements_match_any_worker() {
        let worker = Platform::new().with_property("OSFamily", "linux");
        assert!(Platform::new().is_satisfied_by(&worker));
        assert!(Platform::new().is_satisfied_by(&Platform::new()));
    }

    #[test]
    fn worker_may_declare_extra_properties() {
        let required = Platform::new().with_property("OSFamily", "linux");
        let worker: Platform = [("OSFamily", "linux"), ("gpu", "a100")].into_iter().collect();
        assert!(required.is_satisfied_by(&worker));
        assert!(!worker.is_satisfied_by(&required));
    }

    #[test]
    fn values_must_match_exactly() {
        let required = Platform::new().with_property("OSFamily", "linux");
        let worker = Platform::new().with_property("OSFamily", "Linux");
        assert!(!required.is_satisfied_by(&worker));
    }

    #[test]
    fn multi_valued_names_are_kept() {
        let worker: Platform = [("isa", "x86-64"), ("isa", "x86-64-v3")].into_iter().collect();
        assert_eq!(worker.len(), 2);
        assert!(
            Platform::new()
                .with_property("isa", "x86-64-v3")
                .is_satisfied_by(&worker)
        );
    }
}

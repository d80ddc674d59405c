use std::collections::BTreeMap;

use crate::{Fnv64, Kind, Resource, ResourceList};

/// Point-in-time view of every watched resource: kind -> namespace -> list.
///
/// A snapshot is never mutated once published; [`Snapshot::with_entry`]
/// produces the successor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: BTreeMap<Kind, BTreeMap<String, ResourceList>>,
}

impl Snapshot {
    pub fn new() -> Self { Self::default() }

    /// Copy of `self` with only the `(kind, namespace)` entry replaced.
    pub fn with_entry(&self, kind: &Kind, namespace: &str, list: ResourceList) -> Self {
        let mut next = self.clone();
        next.entries.entry(kind.clone()).or_default().insert(namespace.to_string(), list);
        next
    }

    /// All resources of `kind` across namespaces, in namespace order.
    pub fn get(&self, kind: &Kind) -> Vec<&Resource> {
        self.entries
            .get(kind)
            .map(|by_ns| by_ns.values().flat_map(|l| l.iter()).collect())
            .unwrap_or_default()
    }

    pub fn namespace(&self, kind: &Kind, namespace: &str) -> &[Resource] {
        self.entries
            .get(kind)
            .and_then(|by_ns| by_ns.get(namespace))
            .map(|l| l.as_slice())
            .unwrap_or(&[])
    }

    pub fn find(&self, kind: &Kind, namespace: &str, name: &str) -> Option<&Resource> {
        self.namespace(kind, namespace).iter().find(|r| r.metadata.name == name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Kind> { self.entries.keys() }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.entries.values().flat_map(|by_ns| by_ns.values()).flat_map(|l| l.iter())
    }

    pub fn len(&self) -> usize { self.iter().count() }

    pub fn is_empty(&self) -> bool { self.iter().next().is_none() }

    /// Structural hash of the whole snapshot, excluding resource versions
    /// and statuses so that status write-backs do not look like changes.
    /// Empty entries hash the same as absent ones.
    pub fn hash(&self) -> u64 {
        let mut h = Fnv64::new();
        for (kind, by_ns) in &self.entries {
            for (ns, list) in by_ns.iter().filter(|(_, l)| !l.is_empty()) {
                h.write_str(kind.as_str());
                h.write_str(ns);
                h.write_u64(list.len() as u64);
                for r in list { r.hash_content(&mut h); }
            }
        }
        h.finish()
    }
}

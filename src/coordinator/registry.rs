//! The coordinator's view of the scene: every dumped object, its
//! dependency closure, and which workers hold it.

use crate::error::{Error, Result};
use crate::rays::{TreeletId, WorkerId};
use crate::scene::{Manifest, ObjectKey, ObjectType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Placement record for one scene object.
#[derive(Clone, Debug, Default)]
pub struct SceneObjectInfo {
    /// The object's size in bytes.
    pub size: u64,

    /// Workers currently holding the object.
    pub workers: HashSet<WorkerId>,
}

/// Registry built from the manifest before any worker connects; the
/// treelet id set is closed from then on.
pub struct SceneRegistry {
    /// Every object in the dump.
    pub scene_objects: HashMap<ObjectKey, SceneObjectInfo>,

    /// All treelet ids, in order.
    pub treelet_ids: BTreeSet<TreeletId>,

    /// Flattened dependency closure per treelet.
    pub treelet_dependencies: BTreeMap<TreeletId, BTreeSet<ObjectKey>>,

    /// Treelet size plus the sizes of everything in its closure.
    pub treelet_total_sizes: BTreeMap<TreeletId, u64>,

    /// Expected ray fraction per treelet, when the dumper profiled one.
    pub treelet_probs: Option<Vec<f64>>,

    dependencies: HashMap<ObjectKey, Vec<ObjectKey>>,
}

impl SceneRegistry {
    /// Build the registry from a manifest.
    ///
    /// * `manifest` - The scene dump manifest.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let mut registry = Self {
            scene_objects: HashMap::new(),
            treelet_ids: BTreeSet::new(),
            treelet_dependencies: BTreeMap::new(),
            treelet_total_sizes: BTreeMap::new(),
            treelet_probs: manifest.treelet_probs.clone(),
            dependencies: manifest
                .dependencies
                .iter()
                .map(|(from, to)| (*from, to.clone()))
                .collect(),
        };

        for object in &manifest.objects {
            registry.scene_objects.insert(
                object.key,
                SceneObjectInfo {
                    size: object.size,
                    workers: HashSet::new(),
                },
            );
            if object.key.object_type == ObjectType::Treelet {
                registry.treelet_ids.insert(object.key.id as TreeletId);
            }
        }

        for treelet_id in registry.treelet_ids.clone() {
            let key = ObjectKey::new(ObjectType::Treelet, treelet_id as u64);
            let deps = registry.recursive_dependencies(&key);

            let mut total = registry.object_size(&key)?;
            for dep in &deps {
                total += registry.object_size(dep)?;
            }
            registry.treelet_dependencies.insert(treelet_id, deps);
            registry.treelet_total_sizes.insert(treelet_id, total);
        }

        Ok(registry)
    }

    fn object_size(&self, key: &ObjectKey) -> Result<u64> {
        self.scene_objects
            .get(key)
            .map(|info| info.size)
            .ok_or_else(|| Error::UnknownObject(key.object_name()))
    }

    fn recursive_dependencies(&self, key: &ObjectKey) -> BTreeSet<ObjectKey> {
        let mut all = BTreeSet::new();
        if let Some(direct) = self.dependencies.get(key) {
            for dep in direct {
                if all.insert(*dep) {
                    all.extend(self.recursive_dependencies(dep));
                }
            }
        }
        all
    }

    /// Workers holding a treelet.
    ///
    /// * `treelet_id` - The treelet.
    pub fn treelet_holders(&self, treelet_id: TreeletId) -> Option<&HashSet<WorkerId>> {
        self.scene_objects
            .get(&ObjectKey::new(ObjectType::Treelet, treelet_id as u64))
            .map(|info| &info.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ManifestObject;

    fn key(object_type: ObjectType, id: u64) -> ObjectKey {
        ObjectKey::new(object_type, id)
    }

    fn manifest() -> Manifest {
        Manifest {
            objects: vec![
                ManifestObject { key: key(ObjectType::Scene, 0), size: 10 },
                ManifestObject { key: key(ObjectType::Treelet, 0), size: 100 },
                ManifestObject { key: key(ObjectType::Treelet, 1), size: 200 },
                ManifestObject { key: key(ObjectType::Material, 0), size: 30 },
                ManifestObject { key: key(ObjectType::Texture, 0), size: 40 },
            ],
            dependencies: vec![
                (key(ObjectType::Treelet, 1), vec![key(ObjectType::Material, 0)]),
                (key(ObjectType::Material, 0), vec![key(ObjectType::Texture, 0)]),
            ],
            treelet_probs: None,
        }
    }

    #[test]
    fn dependency_closure_is_transitive() {
        let registry = SceneRegistry::from_manifest(&manifest()).unwrap();
        let deps = &registry.treelet_dependencies[&1];
        assert!(deps.contains(&key(ObjectType::Material, 0)));
        assert!(deps.contains(&key(ObjectType::Texture, 0)));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn treelet_total_size_includes_the_closure() {
        let registry = SceneRegistry::from_manifest(&manifest()).unwrap();
        assert_eq!(registry.treelet_total_sizes[&0], 100);
        assert_eq!(registry.treelet_total_sizes[&1], 200 + 30 + 40);
    }

    #[test]
    fn treelet_ids_are_collected_in_order() {
        let registry = SceneRegistry::from_manifest(&manifest()).unwrap();
        let ids: Vec<TreeletId> = registry.treelet_ids.iter().copied().collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn missing_dependency_object_is_an_error() {
        let mut bad = manifest();
        bad.dependencies
            .push((key(ObjectType::Treelet, 0), vec![key(ObjectType::Material, 9)]));
        assert!(SceneRegistry::from_manifest(&bad).is_err());
    }
}

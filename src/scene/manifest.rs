//! The scene dump manifest.

use crate::error::Result;
use crate::scene::ObjectKey;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Filename of the manifest inside a scene dump directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// One object listed in the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestObject {
    /// The object's key.
    pub key: ObjectKey,

    /// The object's size in bytes.
    pub size: u64,
}

/// The manifest written by the scene dumper: every object in the dump,
/// the dependency edges between them, and optionally the precomputed
/// fraction of rays expected to hit each treelet.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// All objects in the dump.
    pub objects: Vec<ManifestObject>,

    /// Direct dependencies per object.
    #[serde(default)]
    pub dependencies: Vec<(ObjectKey, Vec<ObjectKey>)>,

    /// `treelet_probs[t]` is the fraction of rays expected to hit treelet
    /// `t`. Present only when the dumper ran the profiling pass.
    #[serde(default)]
    pub treelet_probs: Option<Vec<f64>>,
}

impl Manifest {
    /// Load the manifest from a scene dump directory.
    ///
    /// * `dir` - The dump directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let bytes = std::fs::read(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the manifest into a scene dump directory.
    ///
    /// * `dir` - The dump directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ObjectType;

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = Manifest {
            objects: vec![
                ManifestObject {
                    key: ObjectKey::new(ObjectType::Treelet, 1),
                    size: 4096,
                },
                ManifestObject {
                    key: ObjectKey::new(ObjectType::Material, 0),
                    size: 128,
                },
            ],
            dependencies: vec![(
                ObjectKey::new(ObjectType::Treelet, 1),
                vec![ObjectKey::new(ObjectType::Material, 0)],
            )],
            treelet_probs: Some(vec![0.0, 1.0]),
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let decoded: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.objects.len(), 2);
        assert_eq!(decoded.dependencies[0].1.len(), 1);
        assert_eq!(decoded.treelet_probs, Some(vec![0.0, 1.0]));
    }
}

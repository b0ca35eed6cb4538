//! Classifying the files of a layer against its ancestry.
//!
//! Walking back in time through the ancestors, the first ancestor that
//! knows a path decides what happened to it:
//!
//! - marked as deleted in the layer itself: deleted
//! - ancestor has the file, not marked as deleted: changed
//! - ancestor has the file, marked as deleted: created
//! - no ancestor has the file: created

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{FileInfo, Manifest};

/// What a layer did to the files it contains, relative to its ancestry.
/// Every path of the layer ends up in exactly one of the maps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub deleted: BTreeMap<String, FileInfo>,
    pub changed: BTreeMap<String, FileInfo>,
    pub created: BTreeMap<String, FileInfo>,
}

/// Incremental diff computation. Ancestor manifests are fed to
/// [AncestryWalk::visit], nearest parent first.
#[derive(Debug)]
pub struct AncestryWalk {
    /// Paths of the layer not yet classified.
    live: HashMap<String, FileInfo>,
    result: DiffResult,
}

impl AncestryWalk {
    pub fn new(manifest: Manifest) -> Self {
        let mut result = DiffResult::default();
        let mut live = HashMap::new();

        for (path, info) in manifest.into_map() {
            if info.deleted {
                result.deleted.insert(path, info);
            } else {
                live.insert(path, info);
            }
        }

        Self { live, result }
    }

    /// Number of paths not classified yet.
    pub fn remaining(&self) -> usize {
        self.live.len()
    }

    pub fn visit(&mut self, ancestor: &Manifest) {
        let ancestor = ancestor.to_map();
        let Self { live, result } = self;

        live.retain(|path, info| match ancestor.get(path.as_str()) {
            Some(ancestor_info) if ancestor_info.deleted => {
                result.created.insert(path.clone(), *info);
                false
            }
            Some(_) => {
                result.changed.insert(path.clone(), *info);
                false
            }
            None => true,
        });
    }

    /// Everything no ancestor knew about was created by the layer.
    pub fn finish(self) -> DiffResult {
        let mut result = self.result;
        result.created.extend(self.live);
        result
    }
}

/// Computes the diff of a layer against all of its ancestors at once.
pub fn diff<'a, I>(manifest: Manifest, ancestors: I) -> DiffResult
where
    I: IntoIterator<Item = &'a Manifest>,
{
    let mut walk = AncestryWalk::new(manifest);
    for ancestor in ancestors {
        walk.visit(ancestor);
    }
    walk.finish()
}

//! Key layout of layer data and derived artifacts inside a [ContentStore].
//!
//! Everything belonging to a layer lives below `images/<id>/`:
//!
//! - `json`: the layer metadata as pushed by the client,
//! - `layer`: the raw (possibly xz-compressed) tarball,
//! - `ancestry`: JSON array of layer ids, the layer itself first,
//! - `_files`: the cached file manifest,
//! - `_diff`: the cached diff against the ancestry.
//!
//! [ContentStore]: crate::ContentStore

const IMAGES: &str = "images";

fn image_path(image_id: &str, name: &str) -> String {
    format!("{IMAGES}/{image_id}/{name}")
}

pub fn image_json_path(image_id: &str) -> String {
    image_path(image_id, "json")
}

pub fn image_layer_path(image_id: &str) -> String {
    image_path(image_id, "layer")
}

pub fn image_ancestry_path(image_id: &str) -> String {
    image_path(image_id, "ancestry")
}

pub fn image_files_path(image_id: &str) -> String {
    image_path(image_id, "_files")
}

pub fn image_diff_path(image_id: &str) -> String {
    image_path(image_id, "_diff")
}

//! Mapping from a filesystem scene path to the target's virtual content
//! path, e.g. `/projects/Demo/Content/Maps/Main.umap` to `/Game/Maps/Main`.

use crashbisect_error::{BisectError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPathRule {
    /// Directory segment whose contents map onto `virtual_root`.
    pub content_marker: String,
    pub virtual_root: String,
    pub strip_extension: String,
}

impl ContentPathRule {
    /// Normalize `raw` into a virtual path.
    ///
    /// Backslashes become forward slashes and the extension is dropped.
    /// Anything up to the last `content_marker` is replaced with
    /// `virtual_root`. A path already under `virtual_root` passes through.
    ///
    /// # Errors
    ///
    /// [`BisectError::InvalidTargetPath`] when the result does not live
    /// under `virtual_root`.
    pub fn normalize(&self, raw: &str) -> Result<String> {
        let mut path = raw.trim().replace('\\', "/");
        if !self.strip_extension.is_empty() {
            if let Some(stem) = path.strip_suffix(self.strip_extension.as_str()) {
                path = stem.to_owned();
            }
        }
        if !self.content_marker.is_empty() {
            if let Some(idx) = path.rfind(self.content_marker.as_str()) {
                let rest = &path[idx + self.content_marker.len()..];
                path = format!("{}{rest}", self.virtual_root);
            }
        }
        let under_root = path.starts_with(self.virtual_root.as_str());
        if !under_root || path.len() == self.virtual_root.len() {
            return Err(BisectError::InvalidTargetPath {
                path: raw.to_owned(),
            });
        }
        Ok(path)
    }
}

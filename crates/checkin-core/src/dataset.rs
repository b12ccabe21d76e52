//! Dataset indexing: one subdirectory per enrolled person.
//!
//! ```text
//! dataset/
//!   alice/  a1.jpg a2.png ...
//!   bob/    b1.jpeg ...
//! ```
//!
//! Identity names are sorted before labels are assigned so the same
//! directory always yields the same label map.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions accepted as training/enrollment images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset directory not found: {0}")]
    NotFound(PathBuf),
    #[error("dataset path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("no identity subdirectories under {0}")]
    NoIdentities(PathBuf),
    #[error("duplicate identity name in label map: {0}")]
    DuplicateName(String),
    #[error("invalid person name {0:?}")]
    InvalidPersonName(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Dense mapping between integer labels `0..n` and person names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    /// Build a label map from names in label order. Names must be unique.
    pub fn new(names: Vec<String>) -> Result<Self, DatasetError> {
        let mut seen = std::collections::HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(DatasetError::DuplicateName(name.clone()));
            }
        }
        Ok(Self { names })
    }

    /// Enumerate the identity subdirectories of `root`, sorted by name.
    ///
    /// Plain files and hidden directories directly under `root` are ignored.
    pub fn scan(root: &Path) -> Result<Self, DatasetError> {
        if !root.exists() {
            return Err(DatasetError::NotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(DatasetError::NotADirectory(root.to_path_buf()));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(root).map_err(io_err(root))? {
            let entry = entry.map_err(io_err(root))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::warn!(path = %path.display(), "skipping identity directory with non-UTF-8 name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }

        if names.is_empty() {
            return Err(DatasetError::NoIdentities(root.to_path_buf()));
        }

        names.sort();
        tracing::info!(root = %root.display(), identities = names.len(), "label map built");
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    pub fn label_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }

    /// Hex SHA-256 over the ordered names; changes whenever labels would shift.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for name in &self.names {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// One image file belonging to a labelled identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetImage {
    pub path: PathBuf,
    pub label: usize,
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Sorted image files directly inside one identity directory.
pub fn identity_images(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if !path.is_file() {
            continue;
        }
        if is_image_file(&path) {
            images.push(path);
        } else {
            tracing::debug!(path = %path.display(), "skipped non-image file");
        }
    }
    images.sort();
    Ok(images)
}

/// List every candidate image under `root` for the identities in `labels`.
///
/// Identities in the map whose folder has disappeared are skipped with a warning.
pub fn index_images(root: &Path, labels: &LabelMap) -> Result<Vec<DatasetImage>, DatasetError> {
    let mut images = Vec::new();
    for (label, name) in labels.iter() {
        let dir = root.join(name);
        if !dir.is_dir() {
            tracing::warn!(person = name, dir = %dir.display(), "identity directory missing");
            continue;
        }
        images.extend(
            identity_images(&dir)?
                .into_iter()
                .map(|path| DatasetImage { path, label }),
        );
    }
    tracing::debug!(root = %root.display(), images = images.len(), "dataset indexed");
    Ok(images)
}

/// Reject names that cannot be used as a single directory component.
pub fn validate_person_name(name: &str) -> Result<(), DatasetError> {
    let bad = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(DatasetError::InvalidPersonName(name.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_scan_sorts_and_ignores_files() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["carol", "alice", "bob", ".cache"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }
        touch(&tmp.path().join("README.txt"));

        let labels = LabelMap::scan(tmp.path()).unwrap();
        assert_eq!(labels.names(), ["alice", "bob", "carol"]);
        assert_eq!(labels.label_of("bob"), Some(1));
        assert_eq!(labels.name(2), Some("carol"));
        assert_eq!(labels.name(3), None);
    }

    #[test]
    fn test_scan_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let err = LabelMap::scan(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_scan_no_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.jpg"));
        let err = LabelMap::scan(tmp.path()).unwrap_err();
        assert!(matches!(err, DatasetError::NoIdentities(_)));
    }

    #[test]
    fn test_index_images_filters_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let alice = tmp.path().join("alice");
        let bob = tmp.path().join("bob");
        fs::create_dir(&alice).unwrap();
        fs::create_dir(&bob).unwrap();
        touch(&alice.join("2.JPG"));
        touch(&alice.join("1.png"));
        touch(&alice.join("notes.txt"));
        touch(&bob.join("x.bmp"));
        touch(&bob.join("y.jpeg"));
        touch(&bob.join("z.gif"));

        let labels = LabelMap::scan(tmp.path()).unwrap();
        let images = index_images(tmp.path(), &labels).unwrap();

        let names: Vec<(String, usize)> = images
            .iter()
            .map(|i| (i.path.file_name().unwrap().to_string_lossy().into_owned(), i.label))
            .collect();
        assert_eq!(
            names,
            vec![
                ("1.png".to_string(), 0),
                ("2.JPG".to_string(), 0),
                ("x.bmp".to_string(), 1),
                ("y.jpeg".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_label_map_rejects_duplicates() {
        let err = LabelMap::new(vec!["a".into(), "b".into(), "a".into()]).unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateName(n) if n == "a"));
    }

    #[test]
    fn test_fingerprint_tracks_order() {
        let ab = LabelMap::new(vec!["a".into(), "b".into()]).unwrap();
        let ba = LabelMap::new(vec!["b".into(), "a".into()]).unwrap();
        assert_eq!(ab.fingerprint(), ab.clone().fingerprint());
        assert_ne!(ab.fingerprint(), ba.fingerprint());
        assert_eq!(ab.fingerprint().len(), 64);
    }

    #[test]
    fn test_validate_person_name() {
        assert!(validate_person_name("Anh_Dung").is_ok());
        for bad in ["", "  ", ".", "..", ".hidden", "a/b", "a\\b"] {
            assert!(validate_person_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}

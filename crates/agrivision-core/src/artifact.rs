//! Stage artifacts: content digests, validity checks, manifests and atomic publishing.
//!
//! A stage never edits its published output in place. It builds a fresh copy in
//! a staging location next to the destination and swaps it in only once the
//! executor has returned successfully.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::run::Stage;

/// Name of the manifest file written next to each stage's outputs.
pub const MANIFEST_FILE: &str = ".artifact.json";

/// SHA-256 digest of artifact content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest of any serializable value through its canonical JSON form.
    ///
    /// `serde_json` maps are ordered, so equal values always hash equally.
    pub fn of_json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::compute(&serde_json::to_vec(value)?))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid digest hex '{s}': {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("digest '{s}' is not 32 bytes"))?;
        Ok(Self(arr))
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_hex()
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Digest of a single file's bytes.
pub fn digest_file(path: &Path) -> std::io::Result<Digest> {
    Ok(Digest::compute(&fs::read(path)?))
}

/// Digest of a directory tree.
///
/// Hashes the sorted `(relative path, file digest)` pairs of every regular file,
/// skipping hidden entries so manifests and staging leftovers never count.
pub fn digest_dir(dir: &Path) -> std::io::Result<Digest> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for rel in &files {
        let file_digest = digest_file(&dir.join(rel))?;
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(file_digest.to_hex().as_bytes());
        hasher.update(b"\0");
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    Ok(Digest(bytes))
}

/// Digest of a path, file or directory.
pub fn digest_path(path: &Path) -> std::io::Result<Digest> {
    if path.is_dir() {
        digest_dir(path)
    } else {
        digest_file(path)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}

/// Non-hidden regular files directly inside `dir`, sorted by name.
pub fn list_visible_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Check that `path` exists and holds data.
///
/// A file must be non-empty; a directory must contain at least one visible
/// file with content. The error string describes what is wrong.
pub fn check_non_empty(path: &Path) -> Result<(), String> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err("does not exist".to_string())
        }
        Err(e) => return Err(format!("cannot be read: {e}")),
    };
    if meta.is_dir() {
        let mut files = Vec::new();
        collect_files(path, path, &mut files).map_err(|e| format!("cannot be listed: {e}"))?;
        let has_data = files.iter().any(|rel| {
            fs::metadata(path.join(rel))
                .map(|m| m.len() > 0)
                .unwrap_or(false)
        });
        if has_data {
            Ok(())
        } else {
            Err("directory contains no non-empty files".to_string())
        }
    } else if meta.len() == 0 {
        Err("file is empty".to_string())
    } else {
        Ok(())
    }
}

/// The durable output of one stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageArtifact {
    pub stage: Stage,
    /// Primary output location: a file, or a directory of files.
    pub path: PathBuf,
    pub digest: Option<Digest>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl StageArtifact {
    /// An artifact location that has not been inspected yet.
    pub fn at(stage: Stage, path: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            path: path.into(),
            digest: None,
            modified_at: None,
        }
    }

    /// Verify the artifact exists and is non-empty, then record its digest and mtime.
    pub fn inspect(mut self) -> Result<Self, String> {
        check_non_empty(&self.path)?;
        let digest = digest_path(&self.path).map_err(|e| format!("cannot be hashed: {e}"))?;
        self.digest = Some(digest);
        self.modified_at = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(self)
    }
}

/// Provenance written next to every published stage output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifest {
    pub stage: Stage,
    /// Digest of the stage inputs and the stage-relevant configuration.
    pub inputs_digest: Digest,
    pub output_digest: Digest,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

impl ArtifactManifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Load the manifest of `dir`, or `None` when absent or unreadable.
    pub fn load(dir: &Path) -> Option<Self> {
        let path = Self::path_in(dir);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable artifact manifest");
                None
            }
        }
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&Self::path_in(dir), &json)
    }
}

/// Write `data` to `path` through a temporary file in the same directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Copy `src` to `dest` atomically.
pub fn copy_atomic(src: &Path, dest: &Path) -> std::io::Result<()> {
    write_atomic(dest, &fs::read(src)?)
}

/// Replace directory `dest` with `staged`.
///
/// The previous `dest` is moved aside first and restored if the final rename
/// fails, so `dest` is never left half-written.
pub fn swap_dir(staged: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let previous = if dest.exists() {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let aside = dest.with_file_name(format!(
            ".previous-{}-{}",
            name,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::rename(dest, &aside)?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(staged, dest) {
        if let Some(aside) = &previous {
            let _ = fs::rename(aside, dest);
        }
        return Err(e);
    }

    if let Some(aside) = previous {
        if let Err(e) = fs::remove_dir_all(&aside) {
            warn!(path = %aside.display(), error = %e, "Failed to remove previous artifact copy");
        } else {
            debug!(path = %aside.display(), "Removed previous artifact copy");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip_and_serde() {
        let d = Digest::compute(b"ndvi");
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(parsed, d);

        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
    }

    #[test]
    fn test_dir_digest_ignores_hidden_files_and_is_order_independent() {
        let a = tempfile::tempdir().unwrap();
        fs::write(a.path().join("b.jpg"), b"bbb").unwrap();
        fs::write(a.path().join("a.jpg"), b"aaa").unwrap();

        let before = digest_dir(a.path()).unwrap();
        fs::write(a.path().join(MANIFEST_FILE), b"{}").unwrap();
        assert_eq!(digest_dir(a.path()).unwrap(), before);

        fs::write(a.path().join("a.jpg"), b"changed").unwrap();
        assert_ne!(digest_dir(a.path()).unwrap(), before);
    }

    #[test]
    fn test_check_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.tif");
        assert_eq!(check_non_empty(&missing).unwrap_err(), "does not exist");

        let empty = dir.path().join("empty.tif");
        fs::write(&empty, b"").unwrap();
        assert_eq!(check_non_empty(&empty).unwrap_err(), "file is empty");

        let sub = dir.path().join("images");
        fs::create_dir(&sub).unwrap();
        assert!(check_non_empty(&sub).is_err());
        fs::write(sub.join(".hidden"), b"x").unwrap();
        assert!(check_non_empty(&sub).is_err());
        fs::write(sub.join("img.jpg"), b"x").unwrap();
        assert!(check_non_empty(&sub).is_ok());
    }

    #[test]
    fn test_inspect_records_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndvi.tif");
        fs::write(&path, b"raster").unwrap();
        let artifact = StageArtifact::at(Stage::Ndvi, &path).inspect().unwrap();
        assert_eq!(artifact.digest, Some(Digest::compute(b"raster")));
        assert!(artifact.modified_at.is_some());
    }

    #[test]
    fn test_swap_dir_replaces_previous_contents() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("ndvi");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("old.tif"), b"old").unwrap();

        let staged = root.path().join(".staging");
        fs::create_dir(&staged).unwrap();
        fs::write(staged.join("new.tif"), b"new").unwrap();

        swap_dir(&staged, &dest).unwrap();
        assert!(dest.join("new.tif").exists());
        assert!(!dest.join("old.tif").exists());
        assert!(!staged.exists());

        let leftovers: Vec<_> = fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".previous"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_manifest_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ArtifactManifest {
            stage: Stage::GridClassify,
            inputs_digest: Digest::compute(b"in"),
            output_digest: Digest::compute(b"out"),
            run_id: "r1".to_string(),
            created_at: Utc::now(),
        };
        manifest.save(dir.path()).unwrap();
        assert_eq!(ArtifactManifest::load(dir.path()), Some(manifest));
    }

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report_latest.html");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }
}

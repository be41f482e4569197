//! Layer store.
//!
//! Named layers live under `<place>/porto_layers/<name>`. Import goes
//! through a temp directory plus rename so readers never observe a
//! half-extracted tree; opening a layer for a volume build touches its
//! mtime, which the asynchronous sweep uses to expire weak layers.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use arbor_shared::{ArborError, ArborResult};

use super::place::LAYERS_DIR;
use crate::helpers::Helper;
use crate::util::path::validate_name;

/// Prefix of half-removed layers awaiting the sweep.
const GARBAGE_PREFIX: &str = "_remove_";
/// Prefix of in-flight imports.
const IMPORT_PREFIX: &str = "_import_";
/// Marker file of weak layers.
const WEAK_MARKER: &str = ".arbor_weak";

/// Layer store of one place.
#[derive(Debug, Clone)]
pub struct LayerStore {
    place: PathBuf,
}

impl LayerStore {
    pub fn new(place: impl Into<PathBuf>) -> Self {
        Self {
            place: place.into(),
        }
    }

    fn dir(&self) -> PathBuf {
        self.place.join(LAYERS_DIR)
    }

    pub fn layer_path(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    fn check_layer_name(name: &str) -> ArborResult<()> {
        validate_name(name).map_err(|e| e.context("layer name"))?;
        if name.contains('/') || name.starts_with('_') {
            return Err(ArborError::invalid_value(format!(
                "bad layer name {:?}",
                name
            )));
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.layer_path(name).is_dir()
    }

    /// Open a layer for a build and touch its mtime for the sweep.
    pub fn open(&self, name: &str) -> ArborResult<PathBuf> {
        Self::check_layer_name(name)?;
        let path = self.layer_path(name);
        if !path.is_dir() {
            return Err(ArborError::no_layer(name));
        }
        touch(&path);
        Ok(path)
    }

    /// Import a tarball as a named layer.
    pub fn import(
        &self,
        name: &str,
        tarball: &Path,
        merge: bool,
        deadline: Instant,
    ) -> ArborResult<()> {
        Self::check_layer_name(name)?;
        let final_path = self.layer_path(name);
        if final_path.exists() && !merge {
            return Err(ArborError::layer_exists(name));
        }
        if !tarball.is_file() {
            return Err(ArborError::invalid_path(format!(
                "tarball {} not found",
                tarball.display()
            )));
        }

        let target = if merge && final_path.exists() {
            final_path.clone()
        } else {
            let staging = self.dir().join(format!("{}{}", IMPORT_PREFIX, name));
            let _ = std::fs::remove_dir_all(&staging);
            std::fs::create_dir_all(&staging)
                .map_err(|e| ArborError::from(e).context("creating import staging dir"))?;
            staging
        };

        let extracted = Helper::new("tar")
            .args(["--numeric-owner", "-xf"])
            .arg(tarball)
            .arg("-C")
            .arg(&target)
            .deadline(deadline)
            .run();
        if let Err(e) = extracted {
            if target != final_path {
                let _ = std::fs::remove_dir_all(&target);
            }
            return Err(e.context(format!("importing layer {}", name)));
        }

        if target != final_path {
            std::fs::rename(&target, &final_path)
                .map_err(|e| ArborError::from(e).context("publishing imported layer"))?;
        }
        tracing::info!(layer = name, place = %self.place.display(), "layer imported");
        Ok(())
    }

    /// Remove a layer: renamed out of the namespace first, deleted after.
    pub fn remove(&self, name: &str) -> ArborResult<()> {
        Self::check_layer_name(name)?;
        let path = self.layer_path(name);
        if !path.is_dir() {
            return Err(ArborError::no_layer(name));
        }
        let garbage = self.dir().join(format!("{}{}", GARBAGE_PREFIX, name));
        std::fs::rename(&path, &garbage)
            .map_err(|e| ArborError::from(e).context("unlinking layer"))?;
        std::fs::remove_dir_all(&garbage)
            .map_err(|e| ArborError::from(e).context("deleting layer tree"))?;
        tracing::info!(layer = name, "layer removed");
        Ok(())
    }

    /// Visible layer names, sorted.
    pub fn list(&self) -> ArborResult<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(self.dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(ArborError::from(e).context("listing layers")),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('_') && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Mark a layer weak: unused past `max_age` it is swept away.
    pub fn set_weak(&self, name: &str) -> ArborResult<()> {
        let path = self.layer_path(name);
        if !path.is_dir() {
            return Err(ArborError::no_layer(name));
        }
        std::fs::write(path.join(WEAK_MARKER), b"")
            .map_err(|e| ArborError::from(e).context("marking layer weak"))
    }

    /// One sweep pass: delete leftover import/garbage trees and weak
    /// layers idle past `max_age`. Returns the number of trees removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        let entries = match std::fs::read_dir(self.dir()) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if name.starts_with(GARBAGE_PREFIX) || name.starts_with(IMPORT_PREFIX) {
                if std::fs::remove_dir_all(&path).is_ok() {
                    removed += 1;
                }
                continue;
            }
            if !path.join(WEAK_MARKER).is_file() {
                continue;
            }
            let idle = std::fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok());
            if matches!(idle, Some(idle) if idle > max_age) {
                tracing::info!(layer = name, "sweeping idle weak layer");
                if std::fs::remove_dir_all(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }
}

fn touch(path: &Path) {
    // A no-op chmod updates ctime but not mtime; rewrite the times via
    // utimensat with UTIME_NOW instead.
    let c_path = match std::ffi::CString::new(path.to_string_lossy().into_owned()) {
        Ok(c) => c,
        Err(_) => return,
    };
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
    ];
    unsafe {
        libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LayerStore) {
        let dir = TempDir::new().unwrap();
        let store = LayerStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join(LAYERS_DIR)).unwrap();
        (dir, store)
    }

    fn plant_layer(store: &LayerStore, name: &str) {
        std::fs::create_dir_all(store.layer_path(name)).unwrap();
    }

    #[test]
    fn test_open_missing_layer() {
        let (_dir, store) = store();
        let err = store.open("base").unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::LayerNotFound);
    }

    #[test]
    fn test_list_hides_internal_names() {
        let (_dir, store) = store();
        plant_layer(&store, "base");
        plant_layer(&store, "_import_x");
        plant_layer(&store, "_remove_y");
        assert_eq!(store.list().unwrap(), vec!["base".to_string()]);
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store();
        plant_layer(&store, "base");
        store.remove("base").unwrap();
        assert!(!store.exists("base"));
        assert_eq!(
            store.remove("base").unwrap_err().kind,
            arbor_shared::ErrorKind::LayerNotFound
        );
    }

    #[test]
    fn test_bad_layer_names() {
        let (_dir, store) = store();
        for bad in ["", "a/b", "_x", "self"] {
            assert!(store.open(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_sweep_removes_leftovers_and_idle_weak() {
        let (_dir, store) = store();
        plant_layer(&store, "_import_partial");
        plant_layer(&store, "_remove_old");
        plant_layer(&store, "keep");
        plant_layer(&store, "weak");
        store.set_weak("weak").unwrap();

        // Zero max-age expires the weak layer immediately.
        let removed = store.sweep(Duration::from_secs(0));
        assert_eq!(removed, 3);
        assert!(store.exists("keep"));
        assert!(!store.exists("weak"));
    }

    #[test]
    fn test_import_roundtrip() {
        let (dir, store) = store();
        // Build a tiny tarball with the system tar.
        let payload = dir.path().join("payload");
        std::fs::create_dir_all(payload.join("etc")).unwrap();
        std::fs::write(payload.join("etc/os"), "arbor").unwrap();
        let tarball = dir.path().join("layer.tar");
        Helper::new("tar")
            .arg("-cf")
            .arg(&tarball)
            .arg("-C")
            .arg(&payload)
            .arg(".")
            .run()
            .unwrap();

        store
            .import("base", &tarball, false, Instant::now() + Duration::from_secs(30))
            .unwrap();
        assert!(store.exists("base"));
        assert_eq!(
            std::fs::read_to_string(store.layer_path("base").join("etc/os")).unwrap(),
            "arbor"
        );
        let err = store
            .import("base", &tarball, false, Instant::now() + Duration::from_secs(30))
            .unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::LayerAlreadyExists);
    }
}

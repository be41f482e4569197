//! Declarative volume content: directories, symlinks and shares.
//!
//! A share hardlinks a file, or clones a directory tree via hardlinks,
//! from an origin path in the caller's root into the volume. Shares
//! flagged `cow` land in the overlay's cow branch so the first write
//! copies up instead of touching the origin.

use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use arbor_shared::{ArborError, ArborResult};
use walkdir::WalkDir;

use crate::util::path::require_normal_absolute;

/// One pre-created directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDir {
    pub path: PathBuf,
    pub mode: u32,
}

/// One pre-created symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSymlink {
    pub path: PathBuf,
    pub target: PathBuf,
}

/// One share: hardlink clone of an origin path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentShare {
    pub path: PathBuf,
    pub origin: PathBuf,
    pub cow: bool,
}

/// Declared content of one volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeContent {
    pub dirs: Vec<ContentDir>,
    pub symlinks: Vec<ContentSymlink>,
    pub shares: Vec<ContentShare>,
}

impl VolumeContent {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.symlinks.is_empty() && self.shares.is_empty()
    }

    pub fn has_cow_shares(&self) -> bool {
        self.shares.iter().any(|share| share.cow)
    }

    /// Parse the `dirs` property: `path [mode];...`.
    pub fn parse_dirs(text: &str) -> ArborResult<Vec<ContentDir>> {
        let mut dirs = Vec::new();
        for entry in text.split(';').filter(|e| !e.trim().is_empty()) {
            let mut words = entry.split_whitespace();
            let path = words
                .next()
                .ok_or_else(|| ArborError::invalid_value("empty dir entry"))?;
            let mode = match words.next() {
                Some(mode) => u32::from_str_radix(mode, 8)
                    .map_err(|_| ArborError::invalid_value(format!("bad mode {:?}", mode)))?,
                None => 0o775,
            };
            dirs.push(ContentDir {
                path: check_rel(path)?,
                mode,
            });
        }
        Ok(dirs)
    }

    /// Parse the `symlinks` property: `path target;...`.
    pub fn parse_symlinks(text: &str) -> ArborResult<Vec<ContentSymlink>> {
        let mut symlinks = Vec::new();
        for entry in text.split(';').filter(|e| !e.trim().is_empty()) {
            let words: Vec<&str> = entry.split_whitespace().collect();
            let [path, target] = words.as_slice() else {
                return Err(ArborError::invalid_value(format!(
                    "bad symlink entry {:?}",
                    entry
                )));
            };
            symlinks.push(ContentSymlink {
                path: check_rel(path)?,
                target: PathBuf::from(target),
            });
        }
        Ok(symlinks)
    }

    /// Parse the `shares` property: `path origin [cow];...`.
    pub fn parse_shares(text: &str) -> ArborResult<Vec<ContentShare>> {
        let mut shares = Vec::new();
        for entry in text.split(';').filter(|e| !e.trim().is_empty()) {
            let words: Vec<&str> = entry.split_whitespace().collect();
            let (path, origin, cow) = match words.as_slice() {
                [path, origin] => (path, origin, false),
                [path, origin, flag] if *flag == "cow" => (path, origin, true),
                _ => {
                    return Err(ArborError::invalid_value(format!(
                        "bad share entry {:?}",
                        entry
                    )))
                }
            };
            let origin = PathBuf::from(origin);
            require_normal_absolute(&origin)?;
            shares.push(ContentShare {
                path: check_rel(path)?,
                origin,
                cow,
            });
        }
        Ok(shares)
    }
}

fn check_rel(path: &str) -> ArborResult<PathBuf> {
    let path = PathBuf::from(path);
    if path.is_absolute() || crate::util::path::has_dotdot(&path) {
        return Err(ArborError::invalid_path(format!(
            "content path {} must be relative and normal",
            path.display()
        )));
    }
    Ok(path)
}

/// Chown and chmod one path.
pub fn apply_ownership(path: &Path, uid: u32, gid: u32, mode: u32) -> ArborResult<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|e| {
        ArborError::with_errno(
            arbor_shared::ErrorKind::Unknown,
            e as i32,
            format!("chown {}: {}", path.display(), e),
        )
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ArborError::from(e).context(format!("chmod {}", path.display())))
}

/// Materialize declared content into `root` (the volume's writable
/// branch); cow shares go into `cow_root` instead.
pub fn materialize(
    root: &Path,
    cow_root: Option<&Path>,
    content: &VolumeContent,
    uid: u32,
    gid: u32,
) -> ArborResult<()> {
    for dir in &content.dirs {
        let path = root.join(&dir.path);
        std::fs::create_dir_all(&path)
            .map_err(|e| ArborError::from(e).context(format!("creating {}", path.display())))?;
        apply_ownership(&path, uid, gid, dir.mode)?;
    }
    for link in &content.symlinks {
        let path = root.join(&link.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ArborError::from(e).context("creating symlink parent"))?;
        }
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::remove_file(&path)
                    .map_err(|e| ArborError::from(e).context("replacing symlink"))?;
            }
            Ok(_) => {
                return Err(ArborError::busy(format!(
                    "{} exists and is not a symlink",
                    path.display()
                )))
            }
            Err(_) => {}
        }
        symlink(&link.target, &path)
            .map_err(|e| ArborError::from(e).context(format!("creating {}", path.display())))?;
    }
    for share in &content.shares {
        let base = match (share.cow, cow_root) {
            (true, Some(cow)) => cow,
            _ => root,
        };
        let dest = base.join(&share.path);
        clone_share(&share.origin, &dest)?;
    }
    Ok(())
}

/// Hardlink a file, or clone a directory tree with hardlinks.
///
/// Regular files are hardlinked, symlinks replicated, sockets and
/// device nodes skipped.
pub fn clone_share(origin: &Path, dest: &Path) -> ArborResult<()> {
    let meta = std::fs::symlink_metadata(origin)
        .map_err(|e| ArborError::from(e).context(format!("share origin {}", origin.display())))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ArborError::from(e).context("creating share parent"))?;
    }
    if meta.is_file() {
        std::fs::hard_link(origin, dest)
            .map_err(|e| ArborError::from(e).context(format!("sharing {}", origin.display())))?;
        return Ok(());
    }
    if !meta.is_dir() {
        return Err(ArborError::not_supported(format!(
            "share origin {} is neither a file nor a directory",
            origin.display()
        )));
    }

    for entry in WalkDir::new(origin).follow_links(false) {
        let entry = entry.map_err(|e| {
            ArborError::invalid_path(format!("walking share origin: {}", e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(origin)
            .expect("walkdir stays under its root");
        let target = dest.join(rel);
        let ftype = entry.file_type();
        if ftype.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| ArborError::from(e).context("cloning share dir"))?;
            if let Ok(meta) = entry.metadata() {
                let _ = std::fs::set_permissions(&target, meta.permissions());
            }
        } else if ftype.is_file() {
            std::fs::hard_link(entry.path(), &target)
                .map_err(|e| ArborError::from(e).context("hardlinking share file"))?;
        } else if ftype.is_symlink() {
            let link_target = std::fs::read_link(entry.path())
                .map_err(|e| ArborError::from(e).context("reading share symlink"))?;
            symlink(&link_target, &target)
                .map_err(|e| ArborError::from(e).context("replicating share symlink"))?;
        } else {
            // Sockets, fifos and device nodes are skipped.
            tracing::debug!(path = %entry.path().display(), "skipping special file in share");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_parse_dirs() {
        let dirs = VolumeContent::parse_dirs("var/log 0755; data").unwrap();
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].mode, 0o755);
        assert_eq!(dirs[1].mode, 0o775);
        assert!(VolumeContent::parse_dirs("/abs").is_err());
        assert!(VolumeContent::parse_dirs("a/../b").is_err());
    }

    #[test]
    fn test_parse_shares() {
        let shares = VolumeContent::parse_shares("etc/conf /host/conf cow; bin /host/bin").unwrap();
        assert!(shares[0].cow);
        assert!(!shares[1].cow);
        assert!(VolumeContent::parse_shares("x relative/origin").is_err());
        assert!(VolumeContent::parse_shares("x /origin wat").is_err());
    }

    #[test]
    fn test_materialize_dirs_and_symlinks() {
        let dir = TempDir::new().unwrap();
        let content = VolumeContent {
            dirs: VolumeContent::parse_dirs("var/log 0700").unwrap(),
            symlinks: VolumeContent::parse_symlinks("log var/log").unwrap(),
            shares: Vec::new(),
        };
        let uid = nix::unistd::Uid::current().as_raw();
        let gid = nix::unistd::Gid::current().as_raw();
        materialize(dir.path(), None, &content, uid, gid).unwrap();

        assert!(dir.path().join("var/log").is_dir());
        let link = std::fs::read_link(dir.path().join("log")).unwrap();
        assert_eq!(link, PathBuf::from("var/log"));

        // A second pass replaces the symlink instead of failing.
        materialize(dir.path(), None, &content, uid, gid).unwrap();
    }

    #[test]
    fn test_clone_share_directory() {
        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("origin");
        std::fs::create_dir_all(origin.join("sub")).unwrap();
        std::fs::write(origin.join("file"), "data").unwrap();
        std::fs::write(origin.join("sub/inner"), "x").unwrap();
        symlink("file", origin.join("link")).unwrap();

        let dest = dir.path().join("clone");
        clone_share(&origin, &dest).unwrap();

        // Files are hardlinks of the originals.
        let orig_ino = std::fs::metadata(origin.join("file")).unwrap().ino();
        let clone_ino = std::fs::metadata(dest.join("file")).unwrap().ino();
        assert_eq!(orig_ino, clone_ino);
        assert!(dest.join("sub/inner").is_file());
        assert_eq!(
            std::fs::read_link(dest.join("link")).unwrap(),
            PathBuf::from("file")
        );
    }

    #[test]
    fn test_clone_share_single_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), "1").unwrap();
        clone_share(&dir.path().join("f"), &dir.path().join("out/f2")).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("out/f2")).unwrap(), "1");
    }
}

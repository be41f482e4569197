//! Place quota accounting.
//!
//! Every volume charges its claimed space against the owner container
//! and each of its ancestors, in a `total` bucket plus one bucket per
//! place. A charge rolls back at the first ancestor whose limit it
//! would exceed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_shared::{ArborError, ArborResult};

use crate::container::{Container, ContainerMap, CtId};

/// Bucket shared by every place.
pub const TOTAL_BUCKET: &str = "total";

/// On-disk layout names under a place.
pub const VOLUMES_DIR: &str = "porto_volumes";
pub const LAYERS_DIR: &str = "porto_layers";
pub const STORAGE_DIR: &str = "porto_storage";

/// Prepare a place's subdirectories.
pub fn prepare_place(place: &Path) -> ArborResult<()> {
    for sub in [VOLUMES_DIR, LAYERS_DIR, STORAGE_DIR] {
        std::fs::create_dir_all(place.join(sub))
            .map_err(|e| ArborError::from(e).context(format!("preparing place {}", place.display())))?;
    }
    Ok(())
}

/// Check a place against a container's whitelist; an empty whitelist
/// admits only the daemon default place.
pub fn check_place_allowed(
    ct_places: &[PathBuf],
    default_place: &Path,
    place: &Path,
) -> ArborResult<()> {
    if ct_places.is_empty() {
        if place == default_place {
            return Ok(());
        }
        return Err(ArborError::permission(format!(
            "place {} is not whitelisted",
            place.display()
        )));
    }
    if ct_places.iter().any(|allowed| allowed == place) {
        return Ok(());
    }
    Err(ArborError::permission(format!(
        "place {} is not whitelisted",
        place.display()
    )))
}

fn bucket_of(place: &Path) -> String {
    place.display().to_string()
}

fn usage_of(ct: &Container, bucket: &str) -> u64 {
    ct.place_usage.get(bucket).copied().unwrap_or(0)
}

fn limit_of(ct: &Container, bucket: &str) -> Option<u64> {
    ct.place_limit.get(bucket).copied()
}

/// Charge `delta` bytes of claimed space for `owner` in `place`.
///
/// Walks the owner and all ancestors; on the first node whose limit
/// would be exceeded, everything already applied is rolled back and
/// `NoSpace` returned.
pub fn charge(
    map: &Arc<ContainerMap>,
    owner: CtId,
    place: &Path,
    delta: u64,
) -> ArborResult<()> {
    if delta == 0 {
        return Ok(());
    }
    let bucket = bucket_of(place);
    let mut chain = vec![owner];
    chain.extend(map.ancestors(owner));

    let mut inner = map.inner.lock();
    let mut applied = 0usize;
    let mut failure = None;
    for id in &chain {
        let ct = match inner.get_mut(*id) {
            Ok(ct) => ct,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        let mut exceeded = None;
        for key in [TOTAL_BUCKET, bucket.as_str()] {
            if let Some(limit) = limit_of(ct, key) {
                if usage_of(ct, key) + delta > limit {
                    exceeded = Some(ArborError::no_space(format!(
                        "place limit {} for {} exceeded on {}",
                        limit, key, ct.name
                    )));
                }
            }
        }
        if let Some(e) = exceeded {
            failure = Some(e);
            break;
        }
        *ct.place_usage.entry(TOTAL_BUCKET.to_string()).or_insert(0) += delta;
        *ct.place_usage.entry(bucket.clone()).or_insert(0) += delta;
        applied += 1;
    }

    if let Some(e) = failure {
        for id in chain.iter().take(applied) {
            if let Ok(ct) = inner.get_mut(*id) {
                for key in [TOTAL_BUCKET, bucket.as_str()] {
                    if let Some(usage) = ct.place_usage.get_mut(key) {
                        *usage = usage.saturating_sub(delta);
                    }
                }
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Release previously charged space.
pub fn release(map: &Arc<ContainerMap>, owner: CtId, place: &Path, delta: u64) {
    if delta == 0 {
        return;
    }
    let bucket = bucket_of(place);
    let mut chain = vec![owner];
    chain.extend(map.ancestors(owner));
    let mut inner = map.inner.lock();
    for id in chain {
        if let Ok(ct) = inner.get_mut(id) {
            for key in [TOTAL_BUCKET, bucket.as_str()] {
                if let Some(usage) = ct.place_usage.get_mut(key) {
                    *usage = usage.saturating_sub(delta);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Cred, DEFAULT_MAX_CONTAINERS};

    fn setup() -> (Arc<ContainerMap>, CtId, CtId) {
        let map = ContainerMap::new(DEFAULT_MAX_CONTAINERS);
        let a = map.create("a", &Cred::root()).unwrap();
        let ab = map.create("a/b", &Cred::root()).unwrap();
        (map, a, ab)
    }

    #[test]
    fn test_charge_walks_ancestors() {
        let (map, a, ab) = setup();
        charge(&map, ab, Path::new("/place"), 100).unwrap();
        for id in [ab, a, map.root] {
            let usage = map
                .with(id, |ct| ct.place_usage.get(TOTAL_BUCKET).copied())
                .unwrap();
            assert_eq!(usage, Some(100));
        }
    }

    #[test]
    fn test_limit_rolls_back_cleanly() {
        let (map, a, ab) = setup();
        map.with_mut(a, |ct| {
            ct.place_limit.insert(TOTAL_BUCKET.to_string(), 50);
        })
        .unwrap();

        let err = charge(&map, ab, Path::new("/place"), 100).unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::NoSpace);

        // Nothing may remain charged anywhere in the chain.
        for id in [ab, a, map.root] {
            let usage = map
                .with(id, |ct| usage_of(ct, TOTAL_BUCKET))
                .unwrap();
            assert_eq!(usage, 0, "leftover charge after rollback");
        }
    }

    #[test]
    fn test_per_place_bucket_limit() {
        let (map, a, ab) = setup();
        map.with_mut(a, |ct| {
            ct.place_limit.insert("/fast".to_string(), 10);
        })
        .unwrap();
        charge(&map, ab, Path::new("/slow"), 100).unwrap();
        let err = charge(&map, ab, Path::new("/fast"), 11).unwrap_err();
        assert_eq!(err.kind, arbor_shared::ErrorKind::NoSpace);
        charge(&map, ab, Path::new("/fast"), 10).unwrap();
    }

    #[test]
    fn test_release_undoes_charge() {
        let (map, _a, ab) = setup();
        charge(&map, ab, Path::new("/place"), 100).unwrap();
        release(&map, ab, Path::new("/place"), 100);
        let usage = map.with(map.root, |ct| usage_of(ct, TOTAL_BUCKET)).unwrap();
        assert_eq!(usage, 0);
    }

    #[test]
    fn test_place_whitelist() {
        let default = Path::new("/place");
        check_place_allowed(&[], default, default).unwrap();
        assert!(check_place_allowed(&[], default, Path::new("/other")).is_err());
        let allowed = vec![PathBuf::from("/other")];
        check_place_allowed(&allowed, default, Path::new("/other")).unwrap();
        assert!(check_place_allowed(&allowed, default, Path::new("/third")).is_err());
    }
}

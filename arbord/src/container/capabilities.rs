//! Capability sets and start-time sanitization.
//!
//! Container properties hold four sets (ambient, allowed, limit, bound).
//! At create/start time the declared sets are clamped against the host
//! bounding set, the chroot-safe set, every ancestor's declared limit,
//! and per-feature remove sets for features (pid namespace, memory
//! limit, net namespace) the container chain does not actually use.

use std::collections::HashSet;
use std::str::FromStr;

use arbor_shared::{ArborError, ArborResult};
use caps::Capability;

/// A set of Linux capabilities with porto-style text form:
/// names without the `CAP_` prefix joined by `;`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapSet(HashSet<Capability>);

impl CapSet {
    pub fn empty() -> Self {
        Self(HashSet::new())
    }

    pub fn from_caps(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Every capability this build of the kernel headers knows.
    pub fn all_known() -> Self {
        Self(caps::all())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn is_subset(&self, other: &CapSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersect(&self, other: &CapSet) -> CapSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn subtract(&self, other: &CapSet) -> CapSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    pub fn union(&self, other: &CapSet) -> CapSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn format(&self) -> String {
        let mut names: Vec<String> = self
            .0
            .iter()
            .map(|cap| {
                cap.to_string()
                    .trim_start_matches("CAP_")
                    .to_string()
            })
            .collect();
        names.sort();
        names.join(";")
    }

    pub fn parse(text: &str) -> ArborResult<CapSet> {
        let mut set = HashSet::new();
        for name in text.split(';').filter(|n| !n.trim().is_empty()) {
            let name = name.trim().to_uppercase();
            let full = if name.starts_with("CAP_") {
                name
            } else {
                format!("CAP_{}", name)
            };
            let cap = Capability::from_str(&full).map_err(|_| {
                ArborError::invalid_value(format!("unknown capability {:?}", full))
            })?;
            set.insert(cap);
        }
        Ok(Self(set))
    }
}

impl std::fmt::Display for CapSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// Capabilities safe to keep inside a chroot.
pub fn chroot_bound() -> CapSet {
    CapSet::from_caps([
        Capability::CAP_CHOWN,
        Capability::CAP_DAC_OVERRIDE,
        Capability::CAP_FOWNER,
        Capability::CAP_FSETID,
        Capability::CAP_KILL,
        Capability::CAP_SETGID,
        Capability::CAP_SETUID,
        Capability::CAP_SETPCAP,
        Capability::CAP_LINUX_IMMUTABLE,
        Capability::CAP_NET_BIND_SERVICE,
        Capability::CAP_NET_ADMIN,
        Capability::CAP_NET_RAW,
        Capability::CAP_IPC_LOCK,
        Capability::CAP_SYS_CHROOT,
        Capability::CAP_SYS_PTRACE,
        Capability::CAP_SYS_ADMIN,
        Capability::CAP_SYS_BOOT,
        Capability::CAP_SYS_NICE,
        Capability::CAP_SYS_RESOURCE,
        Capability::CAP_MKNOD,
        Capability::CAP_AUDIT_WRITE,
        Capability::CAP_SETFCAP,
    ])
}

/// Removed unless the container runs in a fresh pid namespace.
pub fn pid_ns_caps() -> CapSet {
    CapSet::from_caps([Capability::CAP_KILL, Capability::CAP_SYS_BOOT])
}

/// Removed unless a memory limit confines the container.
pub fn mem_cg_caps() -> CapSet {
    CapSet::from_caps([Capability::CAP_IPC_LOCK, Capability::CAP_SYS_RESOURCE])
}

/// Removed unless the container owns a net namespace.
pub fn net_ns_caps() -> CapSet {
    CapSet::from_caps([
        Capability::CAP_NET_ADMIN,
        Capability::CAP_NET_RAW,
        Capability::CAP_NET_BIND_SERVICE,
    ])
}

/// Host capability state sampled once at daemon start.
#[derive(Debug, Clone)]
pub struct HostCaps {
    pub bound: CapSet,
    pub allowed: CapSet,
}

impl HostCaps {
    pub fn probe() -> Self {
        let bound = caps::read(None, caps::CapSet::Bounding)
            .map(CapSet::from_caps)
            .unwrap_or_else(|_| CapSet::all_known());
        let allowed = caps::read(None, caps::CapSet::Permitted)
            .map(CapSet::from_caps)
            .unwrap_or_else(|_| bound.clone());
        Self { bound, allowed }
    }
}

/// What the ancestor chain (including the container itself) enables.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainFeatures {
    pub chroot: bool,
    pub new_pid_ns: bool,
    pub mem_limit: bool,
    pub new_net_ns: bool,
}

/// Clamp declared capability sets for one container.
///
/// Returns `(bound, allowed)`. `ancestor_limits` holds the `CapLimit` of
/// each ancestor that set one.
pub fn sanitize(
    host: &HostCaps,
    owner_is_root: bool,
    cap_limit: Option<&CapSet>,
    ancestor_limits: &[CapSet],
    features: ChainFeatures,
) -> (CapSet, CapSet) {
    if owner_is_root {
        let bound = cap_limit.cloned().unwrap_or_else(|| host.bound.clone());
        let allowed = bound.clone();
        return (bound, allowed);
    }

    let mut bound = host.bound.clone();
    for limit in ancestor_limits {
        bound = bound.intersect(limit);
    }
    if let Some(limit) = cap_limit {
        bound = bound.intersect(limit);
    }
    if features.chroot {
        bound = bound.intersect(&chroot_bound());
    }
    if !features.new_pid_ns {
        bound = bound.subtract(&pid_ns_caps());
    }
    if !features.mem_limit {
        bound = bound.subtract(&mem_cg_caps());
    }
    if !features.new_net_ns {
        bound = bound.subtract(&net_ns_caps());
    }
    let allowed = host.allowed.intersect(&bound);
    (bound, allowed)
}

/// Enforce `ambient ⊆ allowed ⊆ bound` after sanitization.
pub fn validate(ambient: &CapSet, allowed: &CapSet, bound: &CapSet) -> ArborResult<()> {
    if !allowed.is_subset(bound) {
        return Err(ArborError::permission(format!(
            "allowed capabilities [{}] exceed bound [{}]",
            allowed, bound
        )));
    }
    if !ambient.is_subset(allowed) {
        return Err(ArborError::permission(format!(
            "ambient capabilities [{}] exceed allowed [{}]",
            ambient, allowed
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostCaps {
        HostCaps {
            bound: CapSet::all_known(),
            allowed: CapSet::all_known(),
        }
    }

    #[test]
    fn test_parse_format_roundtrip() {
        let set = CapSet::parse("CHOWN;NET_ADMIN;SYS_PTRACE").unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.contains(Capability::CAP_NET_ADMIN));
        let back = CapSet::parse(&set.format()).unwrap();
        assert_eq!(back, set);
        // Prefixed and lowercase spellings are tolerated.
        assert_eq!(CapSet::parse("cap_chown").unwrap(), CapSet::parse("CHOWN").unwrap());
        assert!(CapSet::parse("NOT_A_CAP").is_err());
        assert!(CapSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_root_owner_keeps_host_bound() {
        let (bound, allowed) = sanitize(&host(), true, None, &[], ChainFeatures::default());
        assert_eq!(bound, CapSet::all_known());
        assert_eq!(allowed, bound);
    }

    #[test]
    fn test_root_owner_with_limit() {
        let limit = CapSet::parse("CHOWN;KILL").unwrap();
        let (bound, allowed) = sanitize(&host(), true, Some(&limit), &[], ChainFeatures::default());
        assert_eq!(bound, limit);
        assert_eq!(allowed, limit);
    }

    #[test]
    fn test_feature_caps_removed_without_features() {
        let (bound, _) = sanitize(&host(), false, None, &[], ChainFeatures::default());
        assert!(!bound.contains(Capability::CAP_KILL));
        assert!(!bound.contains(Capability::CAP_NET_ADMIN));
        assert!(!bound.contains(Capability::CAP_IPC_LOCK));
    }

    #[test]
    fn test_feature_caps_kept_with_features() {
        let features = ChainFeatures {
            chroot: false,
            new_pid_ns: true,
            mem_limit: true,
            new_net_ns: true,
        };
        let (bound, allowed) = sanitize(&host(), false, None, &[], features);
        assert!(bound.contains(Capability::CAP_KILL));
        assert!(bound.contains(Capability::CAP_NET_ADMIN));
        assert!(allowed.is_subset(&bound));
    }

    #[test]
    fn test_chroot_clamps_to_chroot_bound() {
        let features = ChainFeatures {
            chroot: true,
            new_pid_ns: true,
            mem_limit: true,
            new_net_ns: true,
        };
        let (bound, _) = sanitize(&host(), false, None, &[], features);
        assert!(bound.is_subset(&chroot_bound()));
    }

    #[test]
    fn test_ancestor_limits_intersect() {
        let limit_a = CapSet::parse("KILL;CHOWN;NET_ADMIN").unwrap();
        let limit_b = CapSet::parse("KILL;NET_ADMIN").unwrap();
        let features = ChainFeatures {
            new_pid_ns: true,
            new_net_ns: true,
            ..Default::default()
        };
        let (bound, _) = sanitize(&host(), false, None, &[limit_a, limit_b], features);
        assert!(bound.contains(Capability::CAP_KILL));
        assert!(bound.contains(Capability::CAP_NET_ADMIN));
        assert!(!bound.contains(Capability::CAP_CHOWN));
    }

    #[test]
    fn test_validate_orders_sets() {
        let bound = CapSet::parse("KILL;CHOWN").unwrap();
        let allowed = CapSet::parse("KILL").unwrap();
        let ambient = CapSet::parse("KILL").unwrap();
        validate(&ambient, &allowed, &bound).unwrap();

        let too_wide = CapSet::parse("KILL;NET_ADMIN").unwrap();
        assert!(validate(&too_wide, &allowed, &bound).is_err());
        assert!(validate(&ambient, &too_wide, &bound).is_err());
    }
}

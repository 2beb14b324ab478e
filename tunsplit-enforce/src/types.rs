//! Values handed to enforcement adapters
//!
//! [`ExceptionSet`] is the flattened list of destinations that must take the
//! redirect target instead of the adapter's normal path. [`AppIdentitySet`]
//! is the list of executables the per-app redirect applies to.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use ipnet::{IpNet, Ipv4Net};

/// Check whether a net is the `0.0.0.0` "resource blocked" sentinel
pub fn is_sentinel_net(net: &IpNet) -> bool {
    *net == IpNet::V4(Ipv4Net::from(Ipv4Addr::UNSPECIFIED))
}

/// Ordered, de-duplicated set of exception destinations
///
/// The blocked sentinel (`0.0.0.0`, `0.0.0.0/32`) can never be inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ExceptionSet {
    nets: BTreeSet<IpNet>,
}

impl ExceptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a net (host bits are cleared); returns false for duplicates and the sentinel
    pub fn insert(&mut self, net: IpNet) -> bool {
        let net = net.trunc();
        if is_sentinel_net(&net) {
            log::trace!("Ignoring sentinel exception {}", net);
            return false;
        }
        self.nets.insert(net)
    }

    /// Insert a single address as a host net (/32 or /128)
    pub fn insert_addr(&mut self, ip: IpAddr) -> bool {
        self.insert(IpNet::from(ip))
    }

    pub fn contains(&self, net: &IpNet) -> bool {
        self.nets.contains(net)
    }

    pub fn contains_addr(&self, ip: IpAddr) -> bool {
        self.nets.contains(&IpNet::from(ip))
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.nets.iter()
    }

    pub fn ipv4(&self) -> impl Iterator<Item = &IpNet> {
        self.nets.iter().filter(|n| matches!(n, IpNet::V4(_)))
    }

    pub fn ipv6(&self) -> impl Iterator<Item = &IpNet> {
        self.nets.iter().filter(|n| matches!(n, IpNet::V6(_)))
    }
}

impl FromIterator<IpNet> for ExceptionSet {
    fn from_iter<T: IntoIterator<Item = IpNet>>(iter: T) -> Self {
        let mut set = ExceptionSet::new();
        for net in iter {
            set.insert(net);
        }
        set
    }
}

impl Extend<IpNet> for ExceptionSet {
    fn extend<T: IntoIterator<Item = IpNet>>(&mut self, iter: T) {
        for net in iter {
            self.insert(net);
        }
    }
}

impl<'a> IntoIterator for &'a ExceptionSet {
    type Item = &'a IpNet;
    type IntoIter = std::collections::btree_set::Iter<'a, IpNet>;

    fn into_iter(self) -> Self::IntoIter {
        self.nets.iter()
    }
}

impl std::fmt::Display for ExceptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self.nets.iter().map(|n| n.to_string()).collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

/// Stable identity of an executable
///
/// On Unix the (device, inode) pair is recorded too, so a redirect keeps
/// matching the binary even if it is reached through another path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId {
    path: PathBuf,
    file_id: Option<(u64, u64)>,
}

impl AppId {
    pub fn new(path: impl Into<PathBuf>, file_id: Option<(u64, u64)>) -> Self {
        Self {
            path: path.into(),
            file_id,
        }
    }

    /// Resolve a path to the identity of the file it names
    ///
    /// Fails if the path does not exist or is not a regular file.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let canonical = std::fs::canonicalize(path.as_ref())?;
        let metadata = std::fs::metadata(&canonical)?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", canonical.display()),
            ));
        }

        #[cfg(unix)]
        let file_id = {
            use std::os::unix::fs::MetadataExt;
            Some((metadata.dev(), metadata.ino()))
        };
        #[cfg(not(unix))]
        let file_id = None;

        Ok(Self {
            path: canonical,
            file_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_id(&self) -> Option<(u64, u64)> {
        self.file_id
    }

    /// File name without directories, as seen in a process table
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Ordered, de-duplicated list of application identities
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AppIdentitySet {
    ids: Vec<AppId>,
}

impl AppIdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from executable paths
    ///
    /// Paths that cannot be resolved are dropped; the rest keep their order.
    pub fn set_from_list<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut set = Self::new();
        for path in paths {
            let path = path.as_ref();
            match AppId::from_path(path) {
                Ok(id) => {
                    set.push(id);
                }
                Err(e) => log::debug!("Skipping app {}: {}", path.display(), e),
            }
        }
        set
    }

    /// Append one identity; returns false if it was already present
    pub fn push(&mut self, id: AppId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Append every identity of `other` not already present
    pub fn add_from(&mut self, other: &AppIdentitySet) {
        for id in &other.ids {
            self.push(id.clone());
        }
    }

    pub fn contains(&self, id: &AppId) -> bool {
        self.ids.contains(id)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.ids.iter().any(|id| id.path() == path)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppId> {
        self.ids.iter()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.ids.iter().map(|id| id.path.clone()).collect()
    }
}

impl FromIterator<AppId> for AppIdentitySet {
    fn from_iter<T: IntoIterator<Item = AppId>>(iter: T) -> Self {
        let mut set = AppIdentitySet::new();
        for id in iter {
            set.push(id);
        }
        set
    }
}

impl<'a> IntoIterator for &'a AppIdentitySet {
    type Item = &'a AppId;
    type IntoIter = std::slice::Iter<'a, AppId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

//! net_cls cgroup holding redirected processes

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::AppIdentitySet;

pub(crate) struct NetClsCgroup {
    root: PathBuf,
    dir: PathBuf,
    classid: u32,
}

impl NetClsCgroup {
    pub(crate) fn new(root: impl Into<PathBuf>, name: &str, classid: u32) -> Self {
        let root = root.into();
        let dir = root.join(name);
        Self { root, dir, classid }
    }

    /// Create the cgroup and tag it with the class id
    pub(crate) fn create(&self) -> Result<()> {
        if !self.root.join("net_cls.classid").exists() {
            return Err(Error::Redirect(format!(
                "net_cls cgroup hierarchy is not mounted at {}",
                self.root.display()
            )));
        }
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join("net_cls.classid"), self.classid.to_string())?;
        Ok(())
    }

    pub(crate) fn assign(&self, pid: u32) -> Result<()> {
        append_line(&self.dir.join("cgroup.procs"), &pid.to_string())
    }

    /// Move every member back to the root cgroup
    pub(crate) fn release_all(&self) -> Result<usize> {
        let procs = self.dir.join("cgroup.procs");
        if !procs.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(&procs)?;
        let mut moved = 0;
        for pid in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            // The process may have exited in the meantime
            match append_line(&self.root.join("cgroup.procs"), pid) {
                Ok(()) => moved += 1,
                Err(e) => log::debug!("Could not release pid {}: {}", pid, e),
            }
        }
        Ok(moved)
    }

    pub(crate) fn remove(&self) {
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove cgroup {}: {}", self.dir.display(), e);
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Running processes whose executable is one of `apps`
pub(crate) fn matching_pids(proc_root: &Path, apps: &AppIdentitySet) -> Vec<u32> {
    if apps.is_empty() {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let exe = entry.path().join("exe");
        if exe_matches(&exe, apps) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

fn exe_matches(exe: &Path, apps: &AppIdentitySet) -> bool {
    #[cfg(unix)]
    if let Ok(metadata) = std::fs::metadata(exe) {
        use std::os::unix::fs::MetadataExt;
        let id = (metadata.dev(), metadata.ino());
        if apps.iter().any(|app| app.file_id() == Some(id)) {
            return true;
        }
    }
    match std::fs::read_link(exe) {
        Ok(target) => apps.contains_path(&target),
        Err(_) => false,
    }
}

//! Application identities, including the client's own executables

use std::path::{Path, PathBuf};

use tunsplit_enforce::{AppId, AppIdentitySet};

/// Directory holding the running client's executables
pub fn current_install_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Enumerate the executables shipped in `install_dir`
///
/// In exclude mode these are redirected along with the user's apps so the
/// client's helpers keep reaching the network outside the tunnel. The result
/// is sorted by file name. Unreadable directories yield an empty set.
pub fn detect_own_executables(install_dir: &Path) -> AppIdentitySet {
    let entries = match std::fs::read_dir(install_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!(
                "Cannot list client executables in {}: {}",
                install_dir.display(),
                e
            );
            return AppIdentitySet::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| is_executable(path))
        .collect();
    paths.sort();

    let mut set = AppIdentitySet::new();
    for path in paths {
        match AppId::from_path(&path) {
            Ok(id) => {
                log::debug!("Own executable: {}", id);
                set.push(id);
            }
            Err(e) => log::debug!("Skipping {}: {}", path.display(), e),
        }
    }
    set
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("exe"))
}

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::session::{CancelScope, SessionError};

/// Mode used for missing ancestors of the remote root.
pub const PARENT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyEntry {
    Dir {
        remote: String,
        mode: u32,
    },
    File {
        local: PathBuf,
        remote: String,
        mode: u32,
    },
}

/// Ordered list of remote operations reproducing a local tree.
///
/// Directories always precede their contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyPlan {
    /// Ancestors of the remote root, outermost first. Created only if missing.
    pub parents: Vec<String>,
    pub entries: Vec<CopyEntry>,
}

impl CopyPlan {
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, CopyEntry::File { .. }))
            .count()
    }
}

/// The slice of a remote filesystem a copy needs.
pub trait RemoteFs {
    fn is_dir(&mut self, path: &str) -> Result<bool, SessionError>;
    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), SessionError>;
    fn set_mode(&mut self, path: &str, mode: u32) -> Result<(), SessionError>;
    /// Create or truncate `path` and stream `contents` into it. Returns bytes written.
    fn write_file(
        &mut self,
        path: &str,
        mode: u32,
        contents: &mut dyn Read,
    ) -> Result<u64, SessionError>;
}

pub fn join_remote(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Every proper ancestor of an absolute or relative remote path.
///
/// `/srv/app/conf` yields `["/srv", "/srv/app"]`.
pub fn remote_ancestors(remote: &str) -> Vec<String> {
    let absolute = remote.starts_with('/');
    let parts: Vec<&str> = remote.split('/').filter(|p| !p.is_empty()).collect();
    let mut out = Vec::new();
    let mut cur = String::new();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        if absolute || !cur.is_empty() {
            cur.push('/');
        }
        cur.push_str(part);
        out.push(cur.clone());
    }
    out
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Walk `local_root` and describe how to reproduce it at `remote_root`.
///
/// A single file copies to exactly `remote_root`. A directory maps onto
/// `remote_root` itself, with children visited in name order. Symlinks and
/// special files are skipped.
pub fn plan_copy(local_root: &Path, remote_root: &str) -> Result<CopyPlan, SessionError> {
    let remote_root = remote_root.trim();
    if remote_root.is_empty() {
        return Err(SessionError::Transfer("remote destination is empty".into()));
    }
    let remote_root = if remote_root.len() > 1 {
        remote_root.trim_end_matches('/')
    } else {
        remote_root
    };

    let meta = fs::metadata(local_root).map_err(|e| {
        SessionError::Transfer(format!("stat '{}': {e}", local_root.display()))
    })?;

    let mut plan = CopyPlan {
        parents: remote_ancestors(remote_root),
        entries: Vec::new(),
    };

    if meta.is_file() {
        plan.entries.push(CopyEntry::File {
            local: local_root.to_path_buf(),
            remote: remote_root.to_string(),
            mode: mode_of(&meta),
        });
    } else if meta.is_dir() {
        plan.entries.push(CopyEntry::Dir {
            remote: remote_root.to_string(),
            mode: mode_of(&meta),
        });
        walk_dir(local_root, remote_root, &mut plan.entries)?;
    } else {
        return Err(SessionError::Transfer(format!(
            "'{}' is neither a file nor a directory",
            local_root.display()
        )));
    }

    Ok(plan)
}

fn walk_dir(local: &Path, remote: &str, out: &mut Vec<CopyEntry>) -> Result<(), SessionError> {
    let read = fs::read_dir(local)
        .map_err(|e| SessionError::Transfer(format!("read dir '{}': {e}", local.display())))?;

    let mut children = Vec::new();
    for entry in read {
        let entry = entry
            .map_err(|e| SessionError::Transfer(format!("read dir '{}': {e}", local.display())))?;
        children.push(entry.path());
    }
    children.sort();

    for path in children {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SessionError::Transfer(format!("non UTF-8 file name under '{}'", local.display()))
            })?
            .to_string();
        let meta = fs::symlink_metadata(&path)
            .map_err(|e| SessionError::Transfer(format!("stat '{}': {e}", path.display())))?;
        let remote_path = join_remote(remote, &name);

        if meta.is_dir() {
            out.push(CopyEntry::Dir {
                remote: remote_path.clone(),
                mode: mode_of(&meta),
            });
            walk_dir(&path, &remote_path, out)?;
        } else if meta.is_file() {
            out.push(CopyEntry::File {
                local: path,
                remote: remote_path,
                mode: mode_of(&meta),
            });
        } else {
            warn!(path = %path.display(), "skipping symlink or special file");
        }
    }
    Ok(())
}

/// Execute a plan against `remote`, checking `scope` between entries.
/// Returns total bytes written.
pub fn apply_plan(
    remote: &mut dyn RemoteFs,
    plan: &CopyPlan,
    scope: &CancelScope,
) -> Result<u64, SessionError> {
    for parent in &plan.parents {
        scope.check()?;
        if !remote.is_dir(parent)? {
            remote.mkdir(parent, PARENT_DIR_MODE)?;
        }
    }

    let mut written = 0u64;
    for entry in &plan.entries {
        scope.check()?;
        match entry {
            CopyEntry::Dir { remote: path, mode } => {
                if !remote.is_dir(path)? {
                    remote.mkdir(path, *mode)?;
                }
                remote.set_mode(path, *mode)?;
            }
            CopyEntry::File {
                local,
                remote: path,
                mode,
            } => {
                let mut file = fs::File::open(local).map_err(|e| {
                    SessionError::Transfer(format!("open '{}': {e}", local.display()))
                })?;
                let n = remote.write_file(path, *mode, &mut file)?;
                remote.set_mode(path, *mode)?;
                debug!(remote = %path, bytes = n, "copied file");
                written += n;
            }
        }
    }
    Ok(written)
}

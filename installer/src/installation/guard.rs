// Ownership / mode gate for the install root, and the post-extract repair walks.
//
// `check_root` attempts the repair first and verifies afterwards: the usual cause of a
// mismatch is a root created by an earlier step with the wrong owner, which we can often fix
// ourselves. Whatever we cannot fix is returned as copy-pasteable shell commands.

use crate::installation::error::InstallError;
use crate::installation::host_fs::{EntryKind, EntryMeta, HostFs};
use crate::params::catalog::{DIR_MODE, FILE_MODE, GID, UID};
use crate::params::resolver::ParameterResolver;
use crate::params::ParameterSet;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Parse an octal mode string (`"0755"`, `"755"`). Empty means "not configured".
pub fn parse_mode(raw: &str) -> Result<Option<u32>, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let mode = u32::from_str_radix(s, 8).map_err(|_| format!("'{}' is not an octal mode", raw))?;
    if mode > 0o7777 {
        return Err(format!("'{}' is out of range for a file mode", raw));
    }
    Ok(Some(mode))
}

fn non_empty(raw: String) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolved ownership/mode targets for one install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemTarget {
    pub root: PathBuf,
    /// User name or numeric uid; `None` leaves ownership alone.
    pub owner: Option<String>,
    /// Group name or numeric gid; `None` leaves the group alone.
    pub group: Option<String>,
    pub dir_mode: Option<u32>,
    pub file_mode: Option<u32>,
    /// Subtree whose pre-existing owner/group is restored after the root-wide rewrite.
    pub protected_subtree: Option<PathBuf>,
}

impl FilesystemTarget {
    pub fn from_params(
        root: &Path,
        fs_params: &ParameterSet,
        resolver: &ParameterResolver<'_>,
        protected_subtree: Option<&str>,
    ) -> Result<Self, InstallError> {
        let value = |key: &str| resolver.value_of(fs_params, key).unwrap_or_default();

        let dir_mode = parse_mode(&value(DIR_MODE))
            .map_err(|e| InstallError::Precondition(format!("Invalid {}: {}", DIR_MODE, e)))?;
        let file_mode = parse_mode(&value(FILE_MODE))
            .map_err(|e| InstallError::Precondition(format!("Invalid {}: {}", FILE_MODE, e)))?;

        Ok(Self {
            root: root.to_path_buf(),
            owner: non_empty(value(UID)),
            group: non_empty(value(GID)),
            dir_mode,
            file_mode,
            protected_subtree: protected_subtree.map(|s| root.join(s)),
        })
    }
}

/// Operator remediation for a failed pre-flight check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairInstructions {
    pub root: PathBuf,
    /// In order: chown, chgrp, chmod; only the failed checks.
    pub commands: Vec<String>,
}

impl fmt::Display for RepairInstructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run the following commands to setup the install script environment:"
        )?;
        writeln!(f)?;
        write!(f, "cd {}", self.root.display())?;
        for cmd in &self.commands {
            write!(f, "\n{}", cmd)?;
        }
        Ok(())
    }
}

/// One entry the repair walks could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairFailure {
    pub path: PathBuf,
    pub operation: &'static str,
    pub error: String,
}

#[derive(Clone)]
pub struct FilesystemGuard {
    fs: Arc<dyn HostFs>,
}

impl fmt::Debug for FilesystemGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemGuard").finish_non_exhaustive()
    }
}

impl FilesystemGuard {
    pub fn new(fs: Arc<dyn HostFs>) -> Self {
        Self { fs }
    }

    pub fn host(&self) -> &dyn HostFs {
        self.fs.as_ref()
    }

    fn uid_of(&self, owner: &str) -> Option<u32> {
        owner.parse::<u32>().ok().or_else(|| self.fs.user_id(owner))
    }

    fn gid_of(&self, group: &str) -> Option<u32> {
        group.parse::<u32>().ok().or_else(|| self.fs.group_id(group))
    }

    fn owner_matches(&self, target: &str, observed: u32) -> bool {
        match target.parse::<u32>() {
            Ok(n) => n == observed,
            Err(_) => self.fs.user_name(observed).as_deref() == Some(target),
        }
    }

    fn group_matches(&self, target: &str, observed: u32) -> bool {
        match target.parse::<u32>() {
            Ok(n) => n == observed,
            Err(_) => self.fs.group_name(observed).as_deref() == Some(target),
        }
    }

    /// Best-effort repair of the root directory itself, then verification.
    pub fn check_root(&self, target: &FilesystemTarget) -> Result<(), RepairInstructions> {
        let started = Instant::now();
        let root = target.root.as_path();
        info!(
            "[PHASE: preflight] [STEP: check_root] entered (root={:?}, owner={:?}, group={:?}, dir_mode={:?})",
            root,
            target.owner,
            target.group,
            target.dir_mode.map(|m| format!("{:04o}", m))
        );

        if let Some(owner) = target.owner.as_deref() {
            match self.uid_of(owner) {
                Some(uid) => {
                    if let Err(e) = self.fs.set_owner(root, Some(uid), None) {
                        debug!(
                            "[PHASE: preflight] [STEP: check_root] chown attempt failed (owner={}): {}",
                            owner, e
                        );
                    }
                }
                None => warn!(
                    "[PHASE: preflight] [STEP: check_root] Unknown user '{}'",
                    owner
                ),
            }
        }
        if let Some(group) = target.group.as_deref() {
            match self.gid_of(group) {
                Some(gid) => {
                    if let Err(e) = self.fs.set_owner(root, None, Some(gid)) {
                        debug!(
                            "[PHASE: preflight] [STEP: check_root] chgrp attempt failed (group={}): {}",
                            group, e
                        );
                    }
                }
                None => warn!(
                    "[PHASE: preflight] [STEP: check_root] Unknown group '{}'",
                    group
                ),
            }
        }
        if let Some(mode) = target.dir_mode {
            if let Err(e) = self.fs.set_mode(root, mode) {
                debug!(
                    "[PHASE: preflight] [STEP: check_root] chmod attempt failed (mode={:04o}): {}",
                    mode, e
                );
            }
        }

        let observed = match self.fs.stat(root) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(
                    "[PHASE: preflight] [STEP: check_root] Cannot stat install root {:?}: {}",
                    root, e
                );
                None
            }
        };

        let mut commands = Vec::new();
        if let Some(owner) = target.owner.as_deref() {
            if !observed.is_some_and(|m| self.owner_matches(owner, m.uid)) {
                commands.push(format!("chown {} .", owner));
            }
        }
        if let Some(group) = target.group.as_deref() {
            if !observed.is_some_and(|m| self.group_matches(group, m.gid)) {
                commands.push(format!("chgrp {} .", group));
            }
        }
        if let Some(mode) = target.dir_mode {
            if !observed.is_some_and(|m| m.mode == mode) {
                commands.push(format!("chmod {:04o} .", mode));
            }
        }

        if commands.is_empty() {
            info!(
                "[PHASE: preflight] [STEP: check_root] exit ok (duration_ms={})",
                started.elapsed().as_millis()
            );
            Ok(())
        } else {
            warn!(
                "[PHASE: preflight] [STEP: check_root] exit failed (commands={}, duration_ms={})",
                commands.join("; "),
                started.elapsed().as_millis()
            );
            Err(RepairInstructions {
                root: root.to_path_buf(),
                commands,
            })
        }
    }

    /// Visit `start` and everything below it. Symlinks are visited but never followed.
    fn walk<F>(&self, start: &Path, operation: &'static str, mut visit: F) -> Vec<RepairFailure>
    where
        F: FnMut(&Path, &EntryMeta) -> std::io::Result<()>,
    {
        let mut failures = Vec::new();
        let mut stack: Vec<PathBuf> = vec![start.to_path_buf()];
        while let Some(path) = stack.pop() {
            let meta = match self.fs.stat(&path) {
                Ok(m) => m,
                Err(e) => {
                    failures.push(RepairFailure {
                        path,
                        operation: "stat",
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            if let Err(e) = visit(&path, &meta) {
                failures.push(RepairFailure {
                    path: path.clone(),
                    operation,
                    error: e.to_string(),
                });
            }

            if meta.kind == EntryKind::Dir {
                match self.fs.read_dir(&path) {
                    Ok(children) => stack.extend(children),
                    Err(e) => failures.push(RepairFailure {
                        path,
                        operation: "read_dir",
                        error: e.to_string(),
                    }),
                }
            }
        }
        failures
    }

    /// Directories get `dir_mode`, regular files get `file_mode`; everything else is skipped.
    pub fn apply_modes(&self, target: &FilesystemTarget) -> Vec<RepairFailure> {
        let started = Instant::now();
        info!(
            "[PHASE: install] [STEP: permissions] apply_modes entered (root={:?}, dir_mode={:?}, file_mode={:?})",
            target.root,
            target.dir_mode.map(|m| format!("{:04o}", m)),
            target.file_mode.map(|m| format!("{:04o}", m))
        );

        if target.dir_mode.is_none() && target.file_mode.is_none() {
            return Vec::new();
        }

        let failures = self.walk(&target.root, "chmod", |path, meta| {
            let mode = match meta.kind {
                EntryKind::Dir => target.dir_mode,
                EntryKind::File => target.file_mode,
                EntryKind::Symlink | EntryKind::Other => None,
            };
            match mode {
                Some(m) => self.fs.set_mode(path, m),
                None => Ok(()),
            }
        });

        log_failures("apply_modes", &failures);
        info!(
            "[PHASE: install] [STEP: permissions] apply_modes exit (failures={}, duration_ms={})",
            failures.len(),
            started.elapsed().as_millis()
        );
        failures
    }

    /// Recursively assign the target owner/group, then put the protected subtree back the way
    /// it was before the rewrite.
    pub fn apply_ownership(&self, target: &FilesystemTarget) -> Vec<RepairFailure> {
        let started = Instant::now();
        info!(
            "[PHASE: install] [STEP: ownership] apply_ownership entered (root={:?}, owner={:?}, group={:?}, protected={:?})",
            target.root, target.owner, target.group, target.protected_subtree
        );

        let mut failures = Vec::new();
        let uid = match target.owner.as_deref() {
            Some(owner) => {
                let id = self.uid_of(owner);
                if id.is_none() {
                    failures.push(RepairFailure {
                        path: target.root.clone(),
                        operation: "chown",
                        error: format!("unknown user '{}'", owner),
                    });
                }
                id
            }
            None => None,
        };
        let gid = match target.group.as_deref() {
            Some(group) => {
                let id = self.gid_of(group);
                if id.is_none() {
                    failures.push(RepairFailure {
                        path: target.root.clone(),
                        operation: "chgrp",
                        error: format!("unknown group '{}'", group),
                    });
                }
                id
            }
            None => None,
        };

        if uid.is_none() && gid.is_none() {
            log_failures("apply_ownership", &failures);
            return failures;
        }

        // Captured before anything under the root changes hands.
        let preserved = target.protected_subtree.as_deref().and_then(|sub| {
            match self.fs.stat(sub) {
                Ok(m) => Some((sub.to_path_buf(), m.uid, m.gid)),
                Err(e) => {
                    debug!(
                        "[PHASE: install] [STEP: ownership] Protected subtree {:?} not present: {}",
                        sub, e
                    );
                    None
                }
            }
        });

        failures.extend(self.walk(&target.root, "chown", |path, _| {
            self.fs.set_owner(path, uid, gid)
        }));

        if let Some((sub, sub_uid, sub_gid)) = preserved {
            debug!(
                "[PHASE: install] [STEP: ownership] Restoring protected subtree {:?} to {}:{}",
                sub, sub_uid, sub_gid
            );
            failures.extend(self.walk(&sub, "chown", |path, _| {
                self.fs.set_owner(path, Some(sub_uid), Some(sub_gid))
            }));
        }

        log_failures("apply_ownership", &failures);
        info!(
            "[PHASE: install] [STEP: ownership] apply_ownership exit (failures={}, duration_ms={})",
            failures.len(),
            started.elapsed().as_millis()
        );
        failures
    }
}

fn log_failures(operation: &str, failures: &[RepairFailure]) {
    for f in failures {
        warn!(
            "[PHASE: install] [STEP: {}] {} failed for {:?}: {}",
            operation, f.operation, f.path, f.error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installation::host_fs::fake::MemoryFs;
    use crate::params::catalog;
    use crate::params::profile::RequestOverrides;

    const ROOT: &str = "/srv/shop";

    fn target(owner: Option<&str>, group: Option<&str>, dir_mode: Option<u32>) -> FilesystemTarget {
        FilesystemTarget {
            root: PathBuf::from(ROOT),
            owner: owner.map(str::to_string),
            group: group.map(str::to_string),
            dir_mode,
            file_mode: Some(0o644),
            protected_subtree: Some(PathBuf::from(ROOT).join("shell")),
        }
    }

    fn host() -> Arc<MemoryFs> {
        let fs = MemoryFs::new();
        fs.add_user("www-data", 33);
        fs.add_group("www-data", 33);
        fs.add_user("deploy", 1000);
        fs.add_group("deploy", 1000);
        fs.add(ROOT, EntryKind::Dir, 1000, 1000, 0o700);
        Arc::new(fs)
    }

    #[test]
    fn parse_mode_accepts_octal_strings() {
        assert_eq!(parse_mode("0755"), Ok(Some(0o755)));
        assert_eq!(parse_mode("644"), Ok(Some(0o644)));
        assert_eq!(parse_mode(""), Ok(None));
        assert!(parse_mode("0789").is_err());
        assert!(parse_mode("17777").is_err());
    }

    #[test]
    fn target_from_params_resolves_and_validates() {
        let fs_params = catalog::filesystem_params().unwrap();
        let overrides = RequestOverrides::from_pairs([("uid", "www-data"), ("filemod", "")]);
        let resolver = ParameterResolver::new(Some(&overrides), None);

        let t = FilesystemTarget::from_params(Path::new(ROOT), &fs_params, &resolver, Some("shell"))
            .unwrap();
        assert_eq!(t.owner.as_deref(), Some("www-data"));
        assert_eq!(t.group, None);
        assert_eq!(t.dir_mode, Some(0o755));
        assert_eq!(t.file_mode, None);
        assert_eq!(t.protected_subtree, Some(PathBuf::from("/srv/shop/shell")));

        let bad = RequestOverrides::from_pairs([("dirmod", "rwxr-xr-x")]);
        let resolver = ParameterResolver::new(Some(&bad), None);
        let err = FilesystemTarget::from_params(Path::new(ROOT), &fs_params, &resolver, None)
            .unwrap_err();
        assert!(matches!(err, InstallError::Precondition(_)));
    }

    #[test]
    fn check_root_repairs_when_permitted() {
        let fs = host();
        let guard = FilesystemGuard::new(fs.clone());
        guard
            .check_root(&target(Some("www-data"), Some("www-data"), Some(0o755)))
            .unwrap();
        let meta = fs.meta(Path::new(ROOT));
        assert_eq!((meta.uid, meta.gid, meta.mode), (33, 33, 0o755));
    }

    #[test]
    fn check_root_reports_unrepairable_ownership_in_order() {
        let fs = host();
        fs.deny_chown();
        let guard = FilesystemGuard::new(fs.clone());

        let instructions = guard
            .check_root(&target(Some("www-data"), Some("www-data"), Some(0o755)))
            .unwrap_err();
        // chmod still succeeded, so only ownership is left to the operator.
        assert_eq!(instructions.commands, ["chown www-data .", "chgrp www-data ."]);
        let text = instructions.to_string();
        assert!(text.starts_with("Run the following commands"));
        assert!(text.contains("cd /srv/shop\nchown www-data .\nchgrp www-data ."));
    }

    #[test]
    fn check_root_reports_mode_last() {
        let fs = host();
        fs.deny_chown();
        fs.break_path(ROOT);
        let guard = FilesystemGuard::new(fs);
        let instructions = guard
            .check_root(&target(Some("www-data"), None, Some(0o775)))
            .unwrap_err();
        assert_eq!(instructions.commands, ["chown www-data .", "chmod 0775 ."]);
    }

    #[test]
    fn check_root_ignores_unset_targets() {
        let fs = host();
        fs.deny_chown();
        let guard = FilesystemGuard::new(fs);
        assert!(guard.check_root(&target(None, None, None)).is_ok());
    }

    #[test]
    fn check_root_accepts_numeric_ids_and_matching_names() {
        let fs = host();
        fs.deny_chown();
        let guard = FilesystemGuard::new(fs);
        assert!(guard
            .check_root(&target(Some("1000"), Some("deploy"), None))
            .is_ok());
        assert!(guard
            .check_root(&target(Some("deploy"), Some("1000"), None))
            .is_ok());
    }

    #[test]
    fn check_root_fails_when_root_is_missing() {
        let fs = Arc::new(MemoryFs::new());
        let guard = FilesystemGuard::new(fs);
        let instructions = guard
            .check_root(&target(None, None, Some(0o755)))
            .unwrap_err();
        assert_eq!(instructions.commands, ["chmod 0755 ."]);
    }

    fn populated_host() -> Arc<MemoryFs> {
        let fs = host();
        fs.add("/srv/shop/index.php", EntryKind::File, 1000, 1000, 0o600);
        fs.add("/srv/shop/app", EntryKind::Dir, 1000, 1000, 0o700);
        fs.add("/srv/shop/app/Mage.php", EntryKind::File, 1000, 1000, 0o600);
        fs.add("/srv/shop/.htaccess", EntryKind::File, 1000, 1000, 0o600);
        fs.add("/srv/shop/shell", EntryKind::Dir, 0, 0, 0o700);
        fs.add("/srv/shop/shell/indexer.php", EntryKind::File, 0, 0, 0o600);
        fs.add("/srv/shop/shell/lib", EntryKind::Dir, 0, 0, 0o700);
        fs.add("/srv/shop/shell/lib/abstract.php", EntryKind::File, 0, 0, 0o600);
        fs.add("/srv/shop/media", EntryKind::Symlink, 1000, 1000, 0o777);
        fs
    }

    #[test]
    fn apply_ownership_preserves_protected_subtree() {
        let fs = populated_host();
        let guard = FilesystemGuard::new(fs.clone());

        let failures = guard.apply_ownership(&target(Some("www-data"), Some("www-data"), None));
        assert!(failures.is_empty(), "{:?}", failures);

        let shell = PathBuf::from("/srv/shop/shell");
        for path in fs.paths() {
            let meta = fs.meta(&path);
            if path.starts_with(&shell) {
                assert_eq!((meta.uid, meta.gid), (0, 0), "{:?}", path);
            } else {
                assert_eq!((meta.uid, meta.gid), (33, 33), "{:?}", path);
            }
        }
    }

    #[test]
    fn apply_ownership_continues_past_failed_entries() {
        let fs = populated_host();
        fs.break_path("/srv/shop/app/Mage.php");
        let guard = FilesystemGuard::new(fs.clone());

        let failures = guard.apply_ownership(&target(Some("www-data"), None, None));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, PathBuf::from("/srv/shop/app/Mage.php"));
        assert_eq!(failures[0].operation, "chown");
        assert_eq!(fs.meta(Path::new("/srv/shop/index.php")).uid, 33);
        assert_eq!(fs.meta(Path::new("/srv/shop/app")).uid, 33);
        // Group untouched when not configured.
        assert_eq!(fs.meta(Path::new("/srv/shop/index.php")).gid, 1000);
    }

    #[test]
    fn apply_ownership_reports_unknown_user() {
        let fs = populated_host();
        let guard = FilesystemGuard::new(fs.clone());
        let failures = guard.apply_ownership(&target(Some("nobody-here"), None, None));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("nobody-here"));
        assert_eq!(fs.meta(Path::new("/srv/shop/index.php")).uid, 1000);
    }

    #[test]
    fn apply_ownership_without_protected_subtree_rewrites_everything() {
        let fs = populated_host();
        let guard = FilesystemGuard::new(fs.clone());
        let mut t = target(Some("www-data"), Some("www-data"), None);
        t.protected_subtree = Some(PathBuf::from("/srv/shop/not-there"));
        assert!(guard.apply_ownership(&t).is_empty());
        assert_eq!(fs.meta(Path::new("/srv/shop/shell/lib/abstract.php")).uid, 33);
    }

    #[test]
    fn apply_modes_sets_dirs_and_files_and_skips_links() {
        let fs = populated_host();
        let guard = FilesystemGuard::new(fs.clone());
        let mut t = target(None, None, Some(0o755));
        t.file_mode = Some(0o644);

        assert!(guard.apply_modes(&t).is_empty());
        assert_eq!(fs.meta(Path::new(ROOT)).mode, 0o755);
        assert_eq!(fs.meta(Path::new("/srv/shop/shell/lib")).mode, 0o755);
        assert_eq!(fs.meta(Path::new("/srv/shop/.htaccess")).mode, 0o644);
        assert_eq!(fs.meta(Path::new("/srv/shop/shell/lib/abstract.php")).mode, 0o644);
        assert_eq!(fs.meta(Path::new("/srv/shop/media")).mode, 0o777);
    }

    #[cfg(unix)]
    #[test]
    fn apply_modes_on_real_tree_survives_dangling_symlink() {
        use crate::installation::host_fs::UnixHostFs;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("app/etc")).unwrap();
        std::fs::write(root.join("index.php"), "<?php").unwrap();
        std::fs::write(root.join("app/etc/local.xml"), "<config/>").unwrap();
        std::os::unix::fs::symlink(root.join("gone"), root.join("app/dangling")).unwrap();

        let guard = FilesystemGuard::new(Arc::new(UnixHostFs));
        let t = FilesystemTarget {
            root: root.to_path_buf(),
            owner: None,
            group: None,
            dir_mode: Some(0o750),
            file_mode: Some(0o640),
            protected_subtree: None,
        };
        let failures = guard.apply_modes(&t);
        assert!(failures.is_empty(), "{:?}", failures);

        let mode = |p: &Path| UnixHostFs.stat(p).unwrap().mode;
        assert_eq!(mode(&root.join("app/etc")), 0o750);
        assert_eq!(mode(&root.join("index.php")), 0o640);
        assert_eq!(mode(&root.join("app/etc/local.xml")), 0o640);
    }
}

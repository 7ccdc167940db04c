// The install pipeline: prepare -> fetch -> extract -> permission fix -> invoke installer.
//
// Stages run strictly in order. A fatal stage error marks the run `Failed`, records the stage
// and diagnostic, and is handed back to the caller; nothing is rolled back. An installer that
// runs but does not report success is not fatal: the run ends `Failed` with its output kept.

use crate::installation::error::InstallError;
use crate::installation::guard::{FilesystemGuard, FilesystemTarget, RepairFailure};
use crate::installation::installer_output::{join_captured, parse_install_output};
use crate::installation::lock::RunLock;
use crate::installation::{run_cmd_with_timeout, CommandSpec};
use crate::params::catalog::{INTERPRETER, VERSION};
use crate::params::resolver::ParameterResolver;
use crate::params::{ParameterSet, ResolvedParameter};
use crate::settings::InstallerSettings;
use crate::utils::logging::mask_sensitive;
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    Idle,
    Prepared,
    Fetched,
    Extracted,
    PermissionsFixed,
    Invoked,
    Succeeded,
    Failed,
}

impl InstallStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStage::Idle => "idle",
            InstallStage::Prepared => "prepared",
            InstallStage::Fetched => "fetched",
            InstallStage::Extracted => "extracted",
            InstallStage::PermissionsFixed => "permissions_fixed",
            InstallStage::Invoked => "invoked",
            InstallStage::Succeeded => "succeeded",
            InstallStage::Failed => "failed",
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRun,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotRun => "not_run",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// State of one orchestration pass.
#[derive(Debug, Clone, Serialize)]
pub struct InstallRun {
    pub run_id: String,
    pub download_url: String,
    pub archive_filename: String,
    pub status: RunStatus,
    pub captured_output: String,
    pub extracted_secret: Option<String>,
    /// Display form of the installer invocation, values in double quotes.
    pub command_line: Option<String>,
    pub exit_code: Option<i32>,
    pub archive_sha256: Option<String>,
    pub failed_stage: Option<&'static str>,
    pub diagnostic: Option<String>,
    pub repair_failures: Vec<RepairFailure>,
}

impl InstallRun {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            download_url: String::new(),
            archive_filename: String::new(),
            status: RunStatus::NotRun,
            captured_output: String::new(),
            extracted_secret: None,
            command_line: None,
            exit_code: None,
            archive_sha256: None,
            failed_stage: None,
            diagnostic: None,
            repair_failures: Vec::new(),
        }
    }
}

/// Everything the pipeline needs from parameter resolution, computed up front.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub root: PathBuf,
    pub target: FilesystemTarget,
    pub interpreter: String,
    pub version: String,
    /// Application parameters in declaration order; each becomes one installer flag.
    pub application: Vec<ResolvedParameter>,
    pub secret_keys: Vec<String>,
}

impl InstallPlan {
    pub fn resolve(
        root: &Path,
        settings: &InstallerSettings,
        fs_params: &ParameterSet,
        app_params: &ParameterSet,
        resolver: &ParameterResolver<'_>,
    ) -> Result<Self, InstallError> {
        let target =
            FilesystemTarget::from_params(root, fs_params, resolver, settings.protected_subtree())?;
        let interpreter = resolver.value_of(fs_params, INTERPRETER).unwrap_or_default();
        let version = resolver.value_of(app_params, VERSION).unwrap_or_default();
        if version.trim().is_empty() {
            return Err(InstallError::Precondition(
                "No release version configured (parameter 'version' is empty)".to_string(),
            ));
        }

        Ok(Self {
            root: root.to_path_buf(),
            target,
            interpreter,
            version: version.trim().to_string(),
            application: resolver.resolve_all(app_params),
            secret_keys: app_params
                .secret_keys()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
    }
}

/// Installer argument vector: `-f <entrypoint> -- --key value ...`.
pub fn build_installer_args(entrypoint: &str, params: &[ResolvedParameter]) -> Vec<String> {
    let mut args = Vec::with_capacity(3 + params.len() * 2);
    args.push("-f".to_string());
    args.push(entrypoint.to_string());
    args.push("--".to_string());
    for p in params {
        args.push(format!("--{}", p.key));
        args.push(p.value.clone());
    }
    args
}

/// Human-readable form of the installer invocation: `php -f install.php -- --key "value" ...`.
pub fn display_command_line(
    interpreter: &str,
    entrypoint: &str,
    params: &[ResolvedParameter],
) -> String {
    let mut line = format!("{} -f {} --", interpreter, entrypoint);
    for p in params {
        line.push_str(&format!(" --{} \"{}\"", p.key, p.value));
    }
    line
}

async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut f = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn output_tail(out: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = out.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join(" | ")
}

pub struct InstallOrchestrator {
    settings: InstallerSettings,
    plan: InstallPlan,
    guard: FilesystemGuard,
    stage: InstallStage,
    run: InstallRun,
    lock: Option<RunLock>,
}

impl InstallOrchestrator {
    pub fn new(settings: InstallerSettings, plan: InstallPlan, guard: FilesystemGuard) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        Self {
            settings,
            plan,
            guard,
            stage: InstallStage::Idle,
            run: InstallRun::new(run_id),
            lock: None,
        }
    }

    pub fn stage(&self) -> InstallStage {
        self.stage
    }

    pub fn run(&self) -> &InstallRun {
        &self.run
    }

    /// Finish the run: releases the lock and hands back the run record.
    pub fn into_run(mut self) -> InstallRun {
        self.lock.take();
        self.run.clone()
    }

    fn root(&self) -> &Path {
        &self.plan.root
    }

    fn archive_path(&self) -> PathBuf {
        self.root().join(&self.run.archive_filename)
    }

    fn package_dir(&self) -> PathBuf {
        self.root().join(self.settings.archive_root_dir())
    }

    fn expect_stage(&self, stage: &'static str, expected: InstallStage) -> Result<(), InstallError> {
        if self.stage == expected {
            Ok(())
        } else {
            Err(InstallError::OutOfOrder {
                stage,
                state: self.stage.as_str(),
            })
        }
    }

    /// Record a fatal stage error on the run and pass it through.
    fn settle<T>(&mut self, stage: &'static str, result: Result<T, InstallError>) -> Result<T, InstallError> {
        if let Err(e) = &result {
            // Calling a stage out of order does not change the run.
            if matches!(e, InstallError::OutOfOrder { .. }) {
                return result;
            }
            error!(
                "[PHASE: install] [STEP: {}] Fatal {} error (run_id={}): {}",
                stage,
                e.kind(),
                self.run.run_id,
                e
            );
            self.stage = InstallStage::Failed;
            self.run.status = RunStatus::Failed;
            self.run.failed_stage = Some(stage);
            self.run.diagnostic = Some(e.to_string());
        }
        result
    }

    fn require_tool(&self, program: &str, purpose: &str) -> Result<PathBuf, InstallError> {
        which::which(program).map_err(|e| {
            InstallError::Precondition(format!(
                "{} program '{}' not found: {}",
                purpose, program, e
            ))
        })
    }

    pub fn prepare(&mut self) -> Result<(), InstallError> {
        let result = self.prepare_inner();
        self.settle("prepare", result)
    }

    fn prepare_inner(&mut self) -> Result<(), InstallError> {
        let started = Instant::now();
        self.expect_stage("prepare", InstallStage::Idle)?;
        info!(
            "[PHASE: install] [STEP: prepare] entered (run_id={}, root={:?}, version={})",
            self.run.run_id,
            self.root(),
            self.plan.version
        );

        let root = self.plan.root.clone();
        if !root.is_dir() {
            return Err(InstallError::Precondition(format!(
                "Install root {:?} is not a directory",
                root
            )));
        }
        if !self.guard.host().is_writable(&root) {
            return Err(InstallError::Precondition(format!(
                "Install root {:?} is not writable",
                root
            )));
        }

        let fetch_tool = self.require_tool(&self.settings.fetch_program, "Fetch")?;
        let extract_tool = self.require_tool(&self.settings.extract_program, "Extract")?;
        let interpreter = self.plan.interpreter.trim();
        if interpreter.is_empty() {
            return Err(InstallError::Precondition(
                "No PHP interpreter configured (parameter 'php' is empty)".to_string(),
            ));
        }
        if interpreter.contains('/') {
            if !Path::new(interpreter).is_file() {
                return Err(InstallError::Precondition(format!(
                    "PHP interpreter {:?} does not exist",
                    interpreter
                )));
            }
        } else {
            self.require_tool(interpreter, "PHP interpreter")?;
        }
        debug!(
            "[PHASE: install] [STEP: prepare] Tools found (fetch={:?}, extract={:?}, php={})",
            fetch_tool, extract_tool, interpreter
        );

        let download_url = self.settings.download_url(&self.plan.version);
        let parsed = url::Url::parse(&download_url).map_err(|e| {
            InstallError::Precondition(format!("Invalid download URL '{}': {}", download_url, e))
        })?;
        let archive_filename = parsed
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                InstallError::Precondition(format!(
                    "Download URL '{}' has no file name",
                    download_url
                ))
            })?;

        self.lock = Some(RunLock::acquire(&root, &self.run.run_id)?);

        self.run.download_url = download_url;
        self.run.archive_filename = archive_filename;
        self.stage = InstallStage::Prepared;
        info!(
            "[PHASE: install] [STEP: prepare] exit ok (url={}, archive={}, duration_ms={})",
            self.run.download_url,
            self.run.archive_filename,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    pub async fn fetch(&mut self) -> Result<(), InstallError> {
        let result = self.fetch_inner().await;
        self.settle("fetch", result)
    }

    async fn fetch_inner(&mut self) -> Result<(), InstallError> {
        let started = Instant::now();
        self.expect_stage("fetch", InstallStage::Prepared)?;
        let archive = self.archive_path();
        info!(
            "[PHASE: install] [STEP: fetch] entered (url={}, archive={:?})",
            self.run.download_url, archive
        );

        if tokio::fs::symlink_metadata(&archive).await.is_ok() {
            return Err(InstallError::StaleState {
                what: "archive",
                path: archive,
            });
        }

        let mut args = self.settings.fetch_args.clone();
        args.push(self.run.download_url.clone());
        let out = run_cmd_with_timeout(&CommandSpec {
            program: &self.settings.fetch_program,
            args: &args,
            cwd: self.root(),
            timeout: self.settings.fetch_timeout(),
            operation: "fetch",
            secret_flags: &[],
        })
        .await
        .map_err(|e| InstallError::ExternalTool {
            stage: "fetch",
            tool: self.settings.fetch_program.clone(),
            detail: format!("{:#}", e),
        })?;

        if !out.success() {
            return Err(InstallError::ExternalTool {
                stage: "fetch",
                tool: self.settings.fetch_program.clone(),
                detail: format!(
                    "exited with {:?}: {}",
                    out.exit_code,
                    output_tail(&out.stderr, 5)
                ),
            });
        }
        if !archive.is_file() {
            return Err(InstallError::ExternalTool {
                stage: "fetch",
                tool: self.settings.fetch_program.clone(),
                detail: format!("did not produce {:?}", archive),
            });
        }

        let actual = sha256_file(&archive)
            .await
            .map_err(|e| InstallError::io(format!("Failed to hash {:?}", archive), e))?;
        info!(
            "[PHASE: install] [STEP: fetch] Archive sha256={} ({:?})",
            actual, archive
        );
        if let Some(expected) = self
            .settings
            .archive_sha256
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(InstallError::ChecksumMismatch {
                    path: archive,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        self.run.archive_sha256 = Some(actual);

        self.stage = InstallStage::Fetched;
        info!(
            "[PHASE: install] [STEP: fetch] exit ok (duration_ms={})",
            started.elapsed().as_millis()
        );
        Ok(())
    }

    pub async fn extract(&mut self) -> Result<(), InstallError> {
        let result = self.extract_inner().await;
        self.settle("extract", result)
    }

    async fn extract_inner(&mut self) -> Result<(), InstallError> {
        let started = Instant::now();
        self.expect_stage("extract", InstallStage::Fetched)?;
        let archive = self.archive_path();
        let package_dir = self.package_dir();
        info!(
            "[PHASE: install] [STEP: extract] entered (archive={:?}, package_dir={:?})",
            archive, package_dir
        );

        if tokio::fs::symlink_metadata(&package_dir).await.is_ok() {
            return Err(InstallError::StaleState {
                what: "package directory",
                path: package_dir,
            });
        }

        let mut args = self.settings.extract_args.clone();
        args.push(self.run.archive_filename.clone());
        let out = run_cmd_with_timeout(&CommandSpec {
            program: &self.settings.extract_program,
            args: &args,
            cwd: self.root(),
            timeout: self.settings.extract_timeout(),
            operation: "extract",
            secret_flags: &[],
        })
        .await
        .map_err(|e| InstallError::ExternalTool {
            stage: "extract",
            tool: self.settings.extract_program.clone(),
            detail: format!("{:#}", e),
        })?;

        if !out.success() {
            return Err(InstallError::ExternalTool {
                stage: "extract",
                tool: self.settings.extract_program.clone(),
                detail: format!(
                    "exited with {:?}: {}",
                    out.exit_code,
                    output_tail(&out.stderr, 5)
                ),
            });
        }
        if !package_dir.is_dir() {
            return Err(InstallError::ExternalTool {
                stage: "extract",
                tool: self.settings.extract_program.clone(),
                detail: format!("did not produce {:?}", package_dir),
            });
        }

        let moved = self.relocate_package(&package_dir).await?;

        tokio::fs::remove_dir(&package_dir)
            .await
            .map_err(|e| InstallError::io(format!("Failed to remove {:?}", package_dir), e))?;
        tokio::fs::remove_file(&archive)
            .await
            .map_err(|e| InstallError::io(format!("Failed to remove {:?}", archive), e))?;

        self.stage = InstallStage::Extracted;
        info!(
            "[PHASE: install] [STEP: extract] exit ok (entries_moved={}, duration_ms={})",
            moved,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Move every top-level entry of the package directory (dotfiles included) into the root.
    async fn relocate_package(&self, package_dir: &Path) -> Result<usize, InstallError> {
        let mut entries = tokio::fs::read_dir(package_dir)
            .await
            .map_err(|e| InstallError::io(format!("Failed to read {:?}", package_dir), e))?;

        let mut moved = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| InstallError::io(format!("Failed to read {:?}", package_dir), e))?
        {
            let from = entry.path();
            let to = self.root().join(entry.file_name());
            if tokio::fs::symlink_metadata(&to).await.is_ok() {
                return Err(InstallError::Relocate {
                    from,
                    to,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "destination already exists",
                    ),
                });
            }
            tokio::fs::rename(&from, &to)
                .await
                .map_err(|source| InstallError::Relocate {
                    from: from.clone(),
                    to: to.clone(),
                    source,
                })?;
            moved += 1;
        }
        Ok(moved)
    }

    pub fn fix_permissions(&mut self) -> Result<(), InstallError> {
        let result = self.fix_permissions_inner();
        self.settle("permissions", result)
    }

    fn fix_permissions_inner(&mut self) -> Result<(), InstallError> {
        let started = Instant::now();
        self.expect_stage("permissions", InstallStage::Extracted)?;
        info!(
            "[PHASE: install] [STEP: permissions] entered (root={:?})",
            self.root()
        );

        let mut failures = self.guard.apply_modes(&self.plan.target);
        failures.extend(self.guard.apply_ownership(&self.plan.target));
        if !failures.is_empty() {
            warn!(
                "[PHASE: install] [STEP: permissions] {} entries could not be repaired; continuing",
                failures.len()
            );
        }
        self.run.repair_failures = failures;

        self.stage = InstallStage::PermissionsFixed;
        info!(
            "[PHASE: install] [STEP: permissions] exit ok (failures={}, duration_ms={})",
            self.run.repair_failures.len(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    pub async fn invoke(&mut self) -> Result<(), InstallError> {
        let result = self.invoke_inner().await;
        self.settle("invoke", result)
    }

    async fn invoke_inner(&mut self) -> Result<(), InstallError> {
        let started = Instant::now();
        self.expect_stage("invoke", InstallStage::PermissionsFixed)?;

        let entrypoint = self.settings.installer_entrypoint.clone();
        let interpreter = self.plan.interpreter.trim().to_string();
        let args = build_installer_args(&entrypoint, &self.plan.application);
        self.run.command_line = Some(display_command_line(
            &interpreter,
            &entrypoint,
            &self.plan.application,
        ));
        info!(
            "[PHASE: install] [STEP: invoke] entered (run_id={}, interpreter={}, entrypoint={}, params={})",
            self.run.run_id,
            interpreter,
            entrypoint,
            self.plan.application.len()
        );

        let secret_flags: Vec<&str> = self.plan.secret_keys.iter().map(String::as_str).collect();
        let result = run_cmd_with_timeout(&CommandSpec {
            program: &interpreter,
            args: &args,
            cwd: self.root(),
            timeout: self.settings.installer_timeout(),
            operation: "installer",
            secret_flags: &secret_flags,
        })
        .await;
        self.stage = InstallStage::Invoked;

        match result {
            Ok(out) => {
                self.run.exit_code = out.exit_code;
                self.run.captured_output = join_captured(&out.stdout, &out.stderr);
                self.run.extracted_secret = parse_install_output(&self.run.captured_output);
            }
            Err(e) => {
                warn!(
                    "[PHASE: install] [STEP: invoke] Installer did not run to completion: {:#}",
                    e
                );
                self.run.captured_output = format!("{:#}", e);
                self.run.extracted_secret = None;
            }
        }

        if let Some(secret) = &self.run.extracted_secret {
            self.run.status = RunStatus::Succeeded;
            self.stage = InstallStage::Succeeded;
            info!(
                "[PHASE: install] [STEP: invoke] Installer reported success (secret={}, exit_code={:?}, duration_ms={})",
                mask_sensitive(secret),
                self.run.exit_code,
                started.elapsed().as_millis()
            );
        } else {
            self.run.status = RunStatus::Failed;
            self.run.failed_stage = Some("invoke");
            self.run.diagnostic =
                Some("Installer output did not contain a SUCCESS line".to_string());
            self.stage = InstallStage::Failed;
            warn!(
                "[PHASE: install] [STEP: invoke] Installer did not report success (exit_code={:?}, output_lines={}, duration_ms={})",
                self.run.exit_code,
                self.run.captured_output.lines().count(),
                started.elapsed().as_millis()
            );
        }
        Ok(())
    }

    /// All stages in order, stopping at the first fatal error.
    pub async fn auto_run(&mut self) -> Result<&InstallRun, InstallError> {
        let started = Instant::now();
        info!(
            "[PHASE: install] [STEP: auto_run] entered (run_id={})",
            self.run.run_id
        );

        self.prepare()?;
        self.fetch().await?;
        self.extract().await?;
        self.fix_permissions()?;
        self.invoke().await?;

        info!(
            "[PHASE: install] [STEP: auto_run] exit (status={}, duration_ms={})",
            self.run.status.as_str(),
            started.elapsed().as_millis()
        );
        Ok(&self.run)
    }
}

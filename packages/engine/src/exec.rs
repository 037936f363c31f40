//! External-toolchain execution.
//!
//! The engine never links the toolchain; it shells out to the `terraform`
//! binary and decodes its JSON output. Everything the engine needs is
//! behind the [`ToolchainExecutor`] trait so tests (and alternative
//! toolchains) can substitute their own implementation.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::{
    error::{EngineError, Result},
    syntax::{Diagnostic, Pos, Severity, SourceRange},
};

/// Name of the toolchain binary to discover on `PATH`.
pub const EXEC_NAME: &str = "terraform";

/// Options applied to every executor the engine constructs.
#[derive(Clone, Debug)]
pub struct ExecutorOpts {
    /// Explicit binary path. When unset, discovery walks `PATH`.
    pub exec_path: Option<PathBuf>,
    /// Timeout applied to each individual subcommand.
    pub timeout: Duration,
    /// When set, the toolchain's own execution log is directed here.
    pub log_path: Option<PathBuf>,
}

impl Default for ExecutorOpts {
    fn default() -> Self {
        Self {
            exec_path: None,
            timeout: Duration::from_secs(30),
            log_path: None,
        }
    }
}

/// Toolchain and provider versions as reported by `version -json`.
#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub version: Version,
    pub provider_versions: HashMap<String, Version>,
}

/// Opaque provider-schema dump, shared as-is with downstream consumers.
#[derive(Clone, Debug)]
pub struct ProviderSchemas(pub Arc<serde_json::Value>);

/// One finding from `validate -json`, tied to a file when the toolchain
/// reported a range.
#[derive(Clone, Debug)]
pub struct ValidateDiagnostic {
    pub filename: Option<String>,
    pub diagnostic: Diagnostic,
}

/// Capability set of the external toolchain.
#[async_trait]
pub trait ToolchainExecutor: Send + Sync {
    /// Toolchain version plus the provider versions selected for the
    /// working directory.
    async fn version(&self) -> Result<VersionInfo>;

    /// Dump of all provider schemas for the working directory.
    async fn provider_schemas(&self) -> Result<ProviderSchemas>;

    /// Initialize the working directory (install modules and providers).
    async fn init(&self) -> Result<()>;

    /// Validate the working directory, returning toolchain diagnostics.
    async fn validate(&self) -> Result<Vec<ValidateDiagnostic>>;

    /// Format the given source bytes.
    async fn format(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// The binary path this executor invokes.
    fn exec_path(&self) -> &Path;
}

/// Constructor for executors, injected so tests can substitute a mock.
pub type ExecutorFactory =
    Arc<dyn Fn(&Path, &Path, &ExecutorOpts) -> Arc<dyn ToolchainExecutor> + Send + Sync>;

/// Locator for the toolchain binary, injected alongside the factory.
pub type DiscoveryFn = Arc<dyn Fn() -> Result<PathBuf> + Send + Sync>;

/// The default factory, producing process-backed [`TerraformCli`] executors.
pub fn default_executor_factory() -> ExecutorFactory {
    Arc::new(|workdir: &Path, exec_path: &Path, opts: &ExecutorOpts| {
        Arc::new(TerraformCli::new(workdir, exec_path, opts.clone())) as Arc<dyn ToolchainExecutor>
    })
}

/// Find the toolchain binary on `PATH`.
pub fn discover() -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exec_file_name());
        if is_executable::is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(EngineError::ToolchainUnavailable(format!(
        "{EXEC_NAME} not found on PATH"
    )))
}

fn exec_file_name() -> String {
    if cfg!(windows) {
        format!("{EXEC_NAME}.exe")
    } else {
        EXEC_NAME.to_string()
    }
}

/// Process-backed executor invoking the `terraform` binary.
pub struct TerraformCli {
    workdir: PathBuf,
    exec_path: PathBuf,
    opts: ExecutorOpts,
}

impl TerraformCli {
    pub fn new(workdir: &Path, exec_path: &Path, opts: ExecutorOpts) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            exec_path: exec_path.to_path_buf(),
            opts,
        }
    }

    fn command(&self, args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.exec_path);
        cmd.args(args);
        cmd.current_dir(&self.workdir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(log_path) = &self.opts.log_path {
            cmd.env("TF_LOG", "TRACE");
            cmd.env("TF_LOG_PATH", log_path);
        }
        cmd
    }

    /// Run a subcommand to completion under the configured timeout,
    /// returning stdout.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = tokio::time::timeout(self.opts.timeout, self.command(args).output())
            .await
            .map_err(|_| {
                EngineError::Toolchain(format!(
                    "{} {} timed out after {:?}",
                    EXEC_NAME,
                    args.join(" "),
                    self.opts.timeout
                ))
            })?
            .map_err(|err| {
                EngineError::ToolchainUnavailable(format!(
                    "failed to run {}: {err}",
                    self.exec_path.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Toolchain(format!(
                "{} {} exited with {}: {}",
                EXEC_NAME,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[derive(Deserialize)]
struct RawVersionOutput {
    terraform_version: String,
    #[serde(default)]
    provider_selections: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawValidateOutput {
    #[serde(default)]
    diagnostics: Vec<RawValidateDiagnostic>,
}

#[derive(Deserialize)]
struct RawValidateDiagnostic {
    severity: String,
    summary: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    range: Option<RawRange>,
}

#[derive(Deserialize)]
struct RawRange {
    filename: String,
    start: RawPos,
    end: RawPos,
}

#[derive(Deserialize)]
struct RawPos {
    line: u32,
    column: u32,
    byte: usize,
}

impl From<RawPos> for Pos {
    fn from(raw: RawPos) -> Self {
        Pos {
            line: raw.line,
            column: raw.column,
            byte: raw.byte,
        }
    }
}

fn parse_version_output(stdout: &[u8]) -> Result<VersionInfo> {
    let raw: RawVersionOutput = serde_json::from_slice(stdout)
        .map_err(|err| EngineError::Toolchain(format!("malformed version output: {err}")))?;
    let version = Version::parse(&raw.terraform_version).map_err(|err| {
        EngineError::Toolchain(format!(
            "invalid toolchain version {:?}: {err}",
            raw.terraform_version
        ))
    })?;

    let mut provider_versions = HashMap::with_capacity(raw.provider_selections.len());
    for (name, version_str) in raw.provider_selections {
        let parsed = Version::parse(&version_str).map_err(|err| {
            EngineError::Toolchain(format!(
                "invalid provider version {version_str:?} for {name:?}: {err}"
            ))
        })?;
        provider_versions.insert(name, parsed);
    }

    Ok(VersionInfo {
        version,
        provider_versions,
    })
}

fn parse_validate_output(stdout: &[u8]) -> Result<Vec<ValidateDiagnostic>> {
    let raw: RawValidateOutput = serde_json::from_slice(stdout)
        .map_err(|err| EngineError::Toolchain(format!("malformed validate output: {err}")))?;

    Ok(raw
        .diagnostics
        .into_iter()
        .map(|d| {
            let severity = if d.severity == "warning" {
                Severity::Warning
            } else {
                Severity::Error
            };
            let (filename, range) = match d.range {
                Some(r) => (
                    Some(r.filename),
                    Some(SourceRange {
                        start: r.start.into(),
                        end: r.end.into(),
                    }),
                ),
                None => (None, None),
            };
            ValidateDiagnostic {
                filename,
                diagnostic: Diagnostic {
                    severity,
                    summary: d.summary,
                    detail: d.detail,
                    range,
                },
            }
        })
        .collect())
}

#[async_trait]
impl ToolchainExecutor for TerraformCli {
    #[instrument(name = "TerraformCli::version", skip_all, fields(workdir = %self.workdir.display()))]
    async fn version(&self) -> Result<VersionInfo> {
        let stdout = self.run(&["version", "-json"]).await?;
        let info = parse_version_output(&stdout)?;
        debug!(version = %info.version, providers = info.provider_versions.len(), "toolchain version");
        Ok(info)
    }

    #[instrument(name = "TerraformCli::provider_schemas", skip_all, fields(workdir = %self.workdir.display()))]
    async fn provider_schemas(&self) -> Result<ProviderSchemas> {
        let stdout = self.run(&["providers", "schema", "-json"]).await?;
        let value: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|err| EngineError::Toolchain(format!("malformed schema output: {err}")))?;
        Ok(ProviderSchemas(Arc::new(value)))
    }

    #[instrument(name = "TerraformCli::init", skip_all, fields(workdir = %self.workdir.display()))]
    async fn init(&self) -> Result<()> {
        self.run(&["init", "-input=false", "-no-color"]).await?;
        Ok(())
    }

    #[instrument(name = "TerraformCli::validate", skip_all, fields(workdir = %self.workdir.display()))]
    async fn validate(&self) -> Result<Vec<ValidateDiagnostic>> {
        // validate exits non-zero when findings exist, so run directly and
        // decode stdout regardless of status
        let output = tokio::time::timeout(
            self.opts.timeout,
            self.command(&["validate", "-json", "-no-color"]).output(),
        )
        .await
        .map_err(|_| {
            EngineError::Toolchain(format!(
                "{EXEC_NAME} validate timed out after {:?}",
                self.opts.timeout
            ))
        })?
        .map_err(|err| {
            EngineError::ToolchainUnavailable(format!(
                "failed to run {}: {err}",
                self.exec_path.display()
            ))
        })?;

        parse_validate_output(&output.stdout)
    }

    #[instrument(name = "TerraformCli::format", skip_all)]
    async fn format(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut cmd = self.command(&["fmt", "-"]);
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(|err| {
            EngineError::ToolchainUnavailable(format!(
                "failed to run {}: {err}",
                self.exec_path.display()
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(src)
                .await
                .map_err(|err| EngineError::Toolchain(format!("failed to write stdin: {err}")))?;
        }

        let output = tokio::time::timeout(self.opts.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                EngineError::Toolchain(format!(
                    "{EXEC_NAME} fmt timed out after {:?}",
                    self.opts.timeout
                ))
            })?
            .map_err(|err| EngineError::Toolchain(format!("failed to collect output: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Toolchain(format!(
                "{EXEC_NAME} fmt exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    fn exec_path(&self) -> &Path {
        &self.exec_path
    }
}

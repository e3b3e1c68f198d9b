//! LXC backend driving the `lxc-*` command-line tools.
//!
//! Configuration directives set before creation are buffered and written to
//! `<lxc_path>/<name>/config` once `lxc-create` has produced it, base file
//! items first so programmatic directives win.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lxtask_common::constants::DEFAULT_LXC_PATH;
use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::spec::{LogLevel, TemplateOptions, Verbosity};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ContainerRuntime, NativeContainer, parse_config};

/// Runtime backed by the LXC userspace tools found on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LxcRuntime;

impl LxcRuntime {
    /// Creates the runtime.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns whether the LXC tools are installed.
    #[must_use]
    pub fn is_installed() -> bool {
        which::which("lxc-start").is_ok()
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn version(&self) -> Option<String> {
        if !Self::is_installed() {
            return None;
        }
        let mut cmd = Command::new("lxc-info");
        let _ = cmd.arg("--version");
        match run(cmd, "lxc-info").await {
            Ok(out) if !out.trim().is_empty() => Some(out.trim().to_owned()),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "lxc version lookup failed");
                None
            }
        }
    }

    async fn default_lxc_path(&self) -> PathBuf {
        let mut cmd = Command::new("lxc-config");
        let _ = cmd.arg("lxc.lxcpath");
        match run(cmd, "lxc-config").await {
            Ok(out) if !out.trim().is_empty() => PathBuf::from(out.trim()),
            _ => PathBuf::from(DEFAULT_LXC_PATH),
        }
    }

    fn container(&self, name: &str, lxc_path: &Path) -> Result<Arc<dyn NativeContainer>> {
        if name.is_empty() || name.contains('/') {
            return Err(LxtaskError::validation(format!(
                "invalid container name {name:?}"
            )));
        }
        Ok(Arc::new(LxcContainer::new(name, lxc_path)))
    }
}

#[derive(Debug)]
struct Settings {
    created: bool,
    base: Vec<(String, String)>,
    pending: Vec<(String, String)>,
    verbosity: Verbosity,
    log_level: LogLevel,
    log_file: Option<PathBuf>,
}

/// A container managed through the LXC tools.
#[derive(Debug)]
pub struct LxcContainer {
    name: String,
    lxc_path: PathBuf,
    settings: Mutex<Settings>,
}

impl LxcContainer {
    fn new(name: &str, lxc_path: &Path) -> Self {
        let created = lxc_path.join(name).join("config").is_file();
        Self {
            name: name.to_owned(),
            lxc_path: lxc_path.to_path_buf(),
            settings: Mutex::new(Settings {
                created,
                base: Vec::new(),
                pending: Vec::new(),
                verbosity: Verbosity::default(),
                log_level: LogLevel::default(),
                log_file: None,
            }),
        }
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_path(&self) -> PathBuf {
        self.lxc_path.join(&self.name).join("config")
    }

    /// Builds an `lxc-*` command targeting this container.
    fn command(&self, tool: &str) -> Command {
        let mut cmd = Command::new(tool);
        let _ = cmd
            .arg("-n")
            .arg(&self.name)
            .arg("-P")
            .arg(&self.lxc_path);
        cmd
    }

    /// Adds log file, log priority and quiet flags to a start command.
    fn log_args(&self, cmd: &mut Command) {
        let settings = self.settings();
        if let Some(file) = &settings.log_file {
            let _ = cmd.arg("-o").arg(file);
        }
        let _ = cmd.arg("-l").arg(settings.log_level.as_lxc_priority());
        if settings.verbosity == Verbosity::Quiet {
            let _ = cmd.arg("-q");
        }
    }

    async fn append_config(&self, items: &[(String, String)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let path = self.config_path();
        let io_err = |source| LxtaskError::Io {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        let body: String = items.iter().map(|(k, v)| format!("{k} = {v}\n")).collect();
        file.write_all(body.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }
}

#[async_trait]
impl NativeContainer for LxcContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_verbosity(&self, verbosity: Verbosity) {
        self.settings().verbosity = verbosity;
    }

    fn set_log_level(&self, level: LogLevel) -> Result<()> {
        self.settings().log_level = level;
        Ok(())
    }

    fn set_log_file(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(LxtaskError::validation("log file path must not be empty"));
        }
        self.settings().log_file = Some(path.to_path_buf());
        Ok(())
    }

    async fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        let item = (key.to_owned(), value.to_owned());
        {
            let mut settings = self.settings();
            if !settings.created {
                settings.pending.push(item);
                return Ok(());
            }
        }
        self.append_config(&[item]).await
    }

    async fn load_config_file(&self, path: &Path) -> Result<()> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| LxtaskError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let items = parse_config(&text)?;
        tracing::debug!(path = %path.display(), items = items.len(), "base config loaded");
        {
            let mut settings = self.settings();
            if !settings.created {
                settings.base.extend(items);
                return Ok(());
            }
        }
        self.append_config(&items).await
    }

    async fn create(&self, options: &TemplateOptions) -> Result<()> {
        let mut cmd = self.command("lxc-create");
        let _ = cmd.args(template_args(options));
        tracing::info!(container = %self.name, template = %options.template, "creating container");
        let _ = run(cmd, "lxc-create").await?;

        let items = {
            let mut settings = self.settings();
            settings.created = true;
            let mut items = std::mem::take(&mut settings.base);
            items.append(&mut settings.pending);
            items
        };
        self.append_config(&items).await
    }

    async fn start_execute(&self, command: &[String]) -> Result<()> {
        let mut cmd = if command.is_empty() {
            self.command("lxc-start")
        } else {
            self.command("lxc-execute")
        };
        let _ = cmd.arg("-d");
        self.log_args(&mut cmd);
        if !command.is_empty() {
            let _ = cmd.arg("--").args(command);
        }
        tracing::info!(container = %self.name, ?command, "starting container");
        let _ = run(cmd, "lxc-start").await?;
        Ok(())
    }

    async fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()> {
        let mut cmd = self.command("lxc-cgroup");
        let _ = cmd.args([key, value]);
        let _ = run(cmd, "lxc-cgroup").await?;
        Ok(())
    }

    async fn cgroup_item(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = self.command("lxc-cgroup");
        let _ = cmd.arg(key);
        let out = run(cmd, "lxc-cgroup").await?;
        Ok(out.lines().map(str::to_owned).collect())
    }

    async fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.set_cgroup_item("memory.limit_in_bytes", &bytes.to_string())
            .await
    }

    async fn init_pid(&self) -> Result<i32> {
        let mut cmd = self.command("lxc-info");
        let _ = cmd.args(["-p", "-H"]);
        let out = run(cmd, "lxc-info")
            .await
            .map_err(|e| LxtaskError::Observation {
                pid: -1,
                message: e.to_string(),
            })?;
        out.trim()
            .parse()
            .map_err(|_| LxtaskError::Observation {
                pid: -1,
                message: format!("container {} has no init process", self.name),
            })
    }

    async fn running(&self) -> bool {
        let mut cmd = self.command("lxc-info");
        let _ = cmd.args(["-s", "-H"]);
        matches!(run(cmd, "lxc-info").await, Ok(out) if out.trim() == "RUNNING")
    }

    async fn stop(&self) -> Result<()> {
        let mut cmd = self.command("lxc-stop");
        let _ = cmd.arg("-k");
        tracing::info!(container = %self.name, "killing container");
        let _ = run(cmd, "lxc-stop").await?;
        Ok(())
    }

    async fn defined(&self) -> bool {
        tokio::fs::try_exists(self.config_path())
            .await
            .unwrap_or(false)
    }

    async fn destroy(&self) -> Result<()> {
        let cmd = self.command("lxc-destroy");
        tracing::info!(container = %self.name, "destroying container");
        let _ = run(cmd, "lxc-destroy").await?;
        self.settings().created = false;
        Ok(())
    }
}

/// Maps template options onto `lxc-create` arguments.
///
/// The `download` template takes its full image selection as named
/// options; other templates only understand release, arch and cache
/// flushing. Extra arguments always come last.
fn template_args(options: &TemplateOptions) -> Vec<String> {
    let template = if options.template.is_empty() {
        "none"
    } else {
        options.template.as_str()
    };
    let mut args = vec!["-t".to_owned(), template.to_owned()];

    let mut extra = Vec::new();
    if template == "download" {
        let named = [
            ("--dist", &options.distro),
            ("--release", &options.release),
            ("--arch", &options.arch),
            ("--variant", &options.variant),
            ("--server", &options.server),
            ("--keyid", &options.key_id),
            ("--keyserver", &options.key_server),
        ];
        for (flag, value) in named {
            if !value.is_empty() {
                extra.push(flag.to_owned());
                extra.push(value.clone());
            }
        }
        if options.disable_gpg_validation {
            extra.push("--no-validate".to_owned());
        }
        if options.flush_cache {
            extra.push("--flush-cache".to_owned());
        }
        if options.force_cache {
            extra.push("--force-cache".to_owned());
        }
    } else {
        for (flag, value) in [("--release", &options.release), ("--arch", &options.arch)] {
            if !value.is_empty() {
                extra.push(flag.to_owned());
                extra.push(value.clone());
            }
        }
        if options.flush_cache {
            extra.push("--flush-cache".to_owned());
        }
    }
    extra.extend(options.extra_args.iter().cloned());

    if !extra.is_empty() {
        args.push("--".to_owned());
        args.extend(extra);
    }
    args
}

/// Runs a tool to completion, returning its stdout.
async fn run(mut cmd: Command, operation: &'static str) -> Result<String> {
    let output = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| LxtaskError::Io {
            path: PathBuf::from(operation),
            source,
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(LxtaskError::Runtime {
            operation,
            message: format!("{} ({})", stderr.trim(), output.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_template_creates_without_rootfs() {
        assert_eq!(template_args(&TemplateOptions::default()), vec!["-t", "none"]);
    }

    #[test]
    fn download_template_passes_image_selection() {
        let options = TemplateOptions {
            template: "download".into(),
            distro: "alpine".into(),
            release: "3.19".into(),
            arch: "amd64".into(),
            disable_gpg_validation: true,
            extra_args: vec!["--no-cache".into()],
            ..TemplateOptions::default()
        };
        assert_eq!(
            template_args(&options),
            vec![
                "-t",
                "download",
                "--",
                "--dist",
                "alpine",
                "--release",
                "3.19",
                "--arch",
                "amd64",
                "--no-validate",
                "--no-cache",
            ]
        );
    }

    #[test]
    fn other_templates_get_release_arch_and_extra_args() {
        let options = TemplateOptions {
            template: "debian".into(),
            distro: "ignored".into(),
            release: "bookworm".into(),
            variant: "ignored".into(),
            flush_cache: true,
            extra_args: vec!["--x".into()],
            ..TemplateOptions::default()
        };
        assert_eq!(
            template_args(&options),
            vec!["-t", "debian", "--", "--release", "bookworm", "--flush-cache", "--x"]
        );
    }

    #[tokio::test]
    async fn directives_are_buffered_until_creation() {
        let dir = tempfile::tempdir().unwrap();
        let c = LxcContainer::new("web-1", dir.path());
        c.set_config_item("lxc.environment", "A=1").await.unwrap();

        let base = dir.path().join("base.conf");
        std::fs::write(&base, "lxc.environment = A=0\n").unwrap();
        c.load_config_file(&base).await.unwrap();
        assert!(!c.defined().await);

        let settings = c.settings();
        assert!(!settings.created);
        assert_eq!(settings.pending.len(), 1);
        assert_eq!(settings.base, vec![("lxc.environment".into(), "A=0".into())]);
    }

    #[tokio::test]
    async fn existing_container_appends_directly() {
        let dir = tempfile::tempdir().unwrap();
        let cdir = dir.path().join("web-1");
        std::fs::create_dir_all(&cdir).unwrap();
        std::fs::write(cdir.join("config"), "lxc.uts.name = web-1\n").unwrap();

        let c = LxcContainer::new("web-1", dir.path());
        assert!(c.defined().await);
        c.set_config_item("lxc.net.0.type", "none").await.unwrap();

        let config = std::fs::read_to_string(cdir.join("config")).unwrap();
        assert_eq!(config, "lxc.uts.name = web-1\nlxc.net.0.type = none\n");
    }

    #[test]
    fn names_with_slashes_are_rejected() {
        assert!(LxcRuntime::new().container("a/b", Path::new("/tmp")).is_err());
    }
}

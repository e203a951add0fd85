//! Multipass hypervisor CLI wrapper
//!
//! Handles VM launch, remote command execution, address lookup, and teardown.

use crate::exec::{CommandRunner, stdout_string};
use crate::node::NodeSpec;
use crate::retry::{PollOutcome, RetryPolicy};
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

/// Where the snap package installs the CLI when it is not on `PATH`
pub const FALLBACK_PATH: &str = "/snap/bin/multipass";

pub struct Multipass<'r, R: CommandRunner> {
    runner: &'r R,
    program: String,
}

/// Fields of `multipass info` this crate cares about
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub state: Option<String>,
    pub ipv4: Option<String>,
}

/// Find the multipass binary on `PATH`, then at the snap location
pub fn locate() -> Result<PathBuf> {
    locate_with(|name| which::which(name).ok(), Path::new(FALLBACK_PATH))
}

fn locate_with<F>(lookup: F, fallback: &Path) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    if let Some(path) = lookup("multipass") {
        return Ok(path);
    }
    if fallback.is_file() {
        return Ok(fallback.to_path_buf());
    }
    anyhow::bail!(
        "multipass not found in PATH or at {}.\n\
         Install it first:\n  sudo snap install multipass",
        fallback.display()
    )
}

impl<'r, R: CommandRunner> Multipass<'r, R> {
    pub fn new(runner: &'r R, program: impl AsRef<Path>) -> Self {
        Self {
            runner,
            program: program.as_ref().display().to_string(),
        }
    }

    /// Create a VM; blocks until the hypervisor reports it launched
    pub fn launch(&self, spec: &NodeSpec, timeout: Duration, image: Option<&str>) -> Result<()> {
        let cpus = spec.resources.cpus.to_string();
        let timeout = timeout.as_secs().to_string();
        let mut args = vec!["launch"];
        if let Some(image) = image {
            args.push(image);
        }
        args.extend([
            "--name",
            spec.name.as_str(),
            "--cpus",
            cpus.as_str(),
            "--memory",
            spec.resources.memory.as_str(),
            "--disk",
            spec.resources.disk.as_str(),
            "--timeout",
            timeout.as_str(),
        ]);

        self.runner
            .run_checked(&self.program, &args)
            .with_context(|| format!("Failed to launch VM {}", spec.name))?;
        Ok(())
    }

    /// Run an argument vector inside the VM
    pub fn exec(&self, name: &str, argv: &[&str]) -> Result<Output> {
        let args = exec_args(name, argv);
        self.runner.run(&self.program, &args)
    }

    /// Run inside the VM, failing unless the command exits zero
    pub fn exec_checked(&self, name: &str, argv: &[&str]) -> Result<Output> {
        let args = exec_args(name, argv);
        self.runner
            .run_checked(&self.program, &args)
            .with_context(|| format!("Command failed on {}", name))
    }

    /// Run inside the VM with `stdin` piped through
    pub fn exec_with_stdin(&self, name: &str, argv: &[&str], stdin: &[u8]) -> Result<Output> {
        let args = exec_args(name, argv);
        self.runner
            .run_with_stdin_checked(&self.program, &args, stdin)
            .with_context(|| format!("Command failed on {}", name))
    }

    /// Write a root-owned file inside the VM from local bytes
    pub fn write_file(&self, name: &str, path: &str, content: &[u8]) -> Result<()> {
        if let Some(dir) = Path::new(path).parent().and_then(|p| p.to_str()) {
            if !dir.is_empty() {
                self.exec_checked(name, &["sudo", "mkdir", "-p", dir])?;
            }
        }
        self.exec_with_stdin(name, &["sudo", "tee", path], content)
            .with_context(|| format!("Failed to write {} on {}", path, name))?;
        Ok(())
    }

    /// Read a root-owned file from inside the VM
    pub fn read_file(&self, name: &str, path: &str) -> Result<String> {
        let output = self
            .exec_checked(name, &["sudo", "cat", path])
            .with_context(|| format!("Failed to read {} from {}", path, name))?;
        String::from_utf8(output.stdout)
            .with_context(|| format!("{} on {} is not valid UTF-8", path, name))
    }

    /// Poll cloud-init until first-boot initialization reports done
    pub fn await_first_boot(&self, name: &str, policy: &RetryPolicy) -> PollOutcome {
        self.await_first_boot_with_sleep(name, policy, std::thread::sleep)
    }

    pub fn await_first_boot_with_sleep<S>(&self, name: &str, policy: &RetryPolicy, sleep: S) -> PollOutcome
    where
        S: FnMut(Duration),
    {
        policy.poll_with_sleep(
            "first boot",
            || {
                let output = self.exec(name, &["cloud-init", "status"])?;
                Ok(stdout_string(&output.stdout).contains("status: done"))
            },
            sleep,
        )
    }

    pub fn info(&self, name: &str) -> Result<VmInfo> {
        let output = self
            .runner
            .run_checked(&self.program, &["info", name])
            .with_context(|| format!("Failed to query VM {}", name))?;
        Ok(parse_info(&String::from_utf8_lossy(&output.stdout)))
    }

    /// First IPv4 address the hypervisor reports for the VM
    pub fn resolve_address(&self, name: &str) -> Result<String> {
        self.info(name)?
            .ipv4
            .with_context(|| format!("VM {} has no IPv4 address yet", name))
    }

    /// Best-effort delete; never fails the caller
    pub fn destroy(&self, name: &str) {
        match self.runner.run(&self.program, &["delete", name]) {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::debug!(
                vm = name,
                stderr = %stdout_string(&output.stderr),
                "delete failed, ignoring"
            ),
            Err(e) => tracing::debug!(vm = name, error = %e, "delete failed, ignoring"),
        }
    }

    /// Best-effort purge of every deleted VM; never fails the caller
    pub fn purge_all(&self) {
        if let Err(e) = self.runner.run(&self.program, &["purge"]) {
            tracing::debug!(error = %e, "purge failed, ignoring");
        }
    }
}

fn exec_args<'a>(name: &'a str, argv: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec!["exec", name, "--"];
    args.extend_from_slice(argv);
    args
}

/// Pull `State:` and the first `IPv4:` value out of `multipass info` text
pub fn parse_info(text: &str) -> VmInfo {
    let mut info = VmInfo::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.split_whitespace().next().map(str::to_string);
        match key.trim() {
            "State" if info.state.is_none() => info.state = value,
            "IPv4" if info.ipv4.is_none() => {
                info.ipv4 = value.filter(|v| v.parse::<Ipv4Addr>().is_ok())
            }
            _ => {}
        }
    }
    info
}

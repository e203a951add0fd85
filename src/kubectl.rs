//! kubectl wrapper bound to one kubeconfig file

use crate::exec::{CommandRunner, stdout_string};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct Kubectl<'r, R: CommandRunner> {
    runner: &'r R,
    program: String,
    kubeconfig: PathBuf,
}

impl<'r, R: CommandRunner> Kubectl<'r, R> {
    pub fn new(runner: &'r R, kubeconfig: impl AsRef<Path>) -> Self {
        Self {
            runner,
            program: "kubectl".to_string(),
            kubeconfig: kubeconfig.as_ref().to_path_buf(),
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Result<Vec<&'a str>> {
        let path = self
            .kubeconfig
            .to_str()
            .context("kubeconfig path is not valid UTF-8")?;
        let mut args = vec!["--kubeconfig", path];
        args.extend_from_slice(rest);
        Ok(args)
    }

    /// Run a `kubectl config ...` subcommand, failing on non-zero exit
    pub fn config(&self, rest: &[&str]) -> Result<String> {
        let mut sub = vec!["config"];
        sub.extend_from_slice(rest);
        let args = self.args(&sub)?;
        let output = self.runner.run_checked(&self.program, &args)?;
        Ok(stdout_string(&output.stdout))
    }

    /// Like `config`, but a failure is only logged
    pub fn config_best_effort(&self, rest: &[&str]) {
        if let Err(e) = self.config(rest) {
            tracing::debug!(error = %e, "ignoring kubectl config failure");
        }
    }

    /// The active context, or `None` when the file has none set
    pub fn current_context(&self) -> Result<Option<String>> {
        let args = self.args(&["config", "current-context"])?;
        let output = self.runner.run(&self.program, &args)?;
        let context = stdout_string(&output.stdout);
        if output.status.success() && !context.is_empty() {
            Ok(Some(context))
        } else {
            Ok(None)
        }
    }

    /// `kubectl get nodes -o wide`
    pub fn get_nodes(&self) -> Result<String> {
        let args = self.args(&["get", "nodes", "-o", "wide"])?;
        let output = self
            .runner
            .run_checked(&self.program, &args)
            .context("Failed to list cluster nodes")?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Count nodes whose STATUS column starts with `Ready`
pub fn count_ready_nodes(get_nodes_output: &str) -> usize {
    get_nodes_output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|status| status.split(',').next() == Some("Ready"))
        .count()
}

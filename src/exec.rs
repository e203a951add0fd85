use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};

/// Runs external programs on the orchestrating host.
///
/// Every tool wrapper in this crate (hypervisor, kubectl, host checks) goes
/// through this trait so that invocations are argument vectors, never shell text.
pub trait CommandRunner {
    /// Run a program to completion, capturing stdout and stderr
    fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run a program, feeding `stdin` to it, capturing stdout and stderr
    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output>;

    /// Run a program and fail unless it exits zero
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<Output> {
        let output = self.run(program, args)?;
        ensure_success(program, args, &output)?;
        Ok(output)
    }

    /// Like `run_with_stdin`, but fail unless it exits zero
    fn run_with_stdin_checked(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output> {
        let output = self.run_with_stdin(program, args, stdin)?;
        ensure_success(program, args, &output)?;
        Ok(output)
    }
}

fn ensure_success(program: &str, args: &[&str], output: &Output) -> Result<()> {
    if !output.status.success() {
        let stderr = stdout_string(&output.stderr);
        anyhow::bail!(
            "'{} {}' failed with exit code {}{}",
            program,
            redact(args).join(" "),
            output.status.code().unwrap_or(1),
            if stderr.is_empty() {
                String::new()
            } else {
                format!(": {}", stderr)
            }
        );
    }
    Ok(())
}

/// Convert captured output to a trimmed string
pub fn stdout_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Replace secret-bearing arguments before they reach logs or error messages
pub fn redact(args: &[&str]) -> Vec<String> {
    const SECRET_FLAGS: [&str; 2] = ["--token=", "token="];
    args.iter()
        .map(|arg| {
            match SECRET_FLAGS.iter().find(|flag| arg.starts_with(*flag)) {
                Some(flag) => format!("{}<redacted>", flag),
                None => arg.to_string(),
            }
        })
        .collect()
}

/// Executes commands as child processes of this one
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        tracing::debug!(program, args = ?redact(args), "running command");
        Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute command: {}", program))
    }

    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &[u8]) -> Result<Output> {
        tracing::debug!(
            program,
            args = ?redact(args),
            stdin_bytes = stdin.len(),
            "running command with stdin"
        );
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", program))?;

        // Stdin is fed from its own thread; `tee` echoes its input and would
        // block on a full stdout pipe otherwise.
        let pipe = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            let writer = pipe.map(|mut pipe| {
                scope.spawn(move || {
                    pipe.write_all(stdin)?;
                    pipe.flush()
                })
            });
            let output = child.wait_with_output();
            let written = match writer {
                Some(handle) => handle.join().unwrap_or_else(|_| {
                    Err(std::io::Error::other("stdin writer panicked"))
                }),
                None => Ok(()),
            };
            (output, written)
        });

        let output = output.with_context(|| format!("Failed to wait for command: {}", program))?;
        match written {
            Ok(()) => {}
            // Exiting before reading all input surfaces as a non-zero status instead
            Err(e) if !output.status.success() => {
                tracing::debug!(program, error = %e, "stdin not fully consumed")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to write stdin of {}", program));
            }
        }
        Ok(output)
    }
}

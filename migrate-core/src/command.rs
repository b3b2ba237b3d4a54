//! Command-runner and bulk-transfer boundary.
//!
//! Every external tool invocation goes through a [`CommandRunner`], either on
//! this machine or on a remote host over a multiplexed ssh session. Bulk tree
//! transfer is rsync over the same session.

use anyhow::Context;
use log::{debug, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Turn a non-zero exit into [`MigrateError::Command`].
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(MigrateError::Command {
                command: command.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Executes programs on one side of a migration. A non-zero exit status is
/// reported in [`CommandOutput`], not as an error; only failing to launch is.
pub trait CommandRunner: Send + Sync {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Like [`exec`](Self::exec) with `input` fed to the program's stdin.
    fn exec_with_input(&self, program: &str, args: &[String], input: &[u8]) -> Result<CommandOutput>;

    fn describe(&self) -> String;

    fn is_remote(&self) -> bool {
        false
    }

    /// Release any transport resources. Safe to call more than once.
    fn teardown(&self) {}
}

fn collect(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        // Killed by a signal: no exit code, treat like a shell would.
        status: output.status.code().unwrap_or(128),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

fn run_with_input(mut cmd: Command, input: &[u8], what: &str) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {what}"))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input)
            .with_context(|| format!("Failed to write stdin of {what}"))?;
    }
    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for {what}"))?;
    Ok(collect(output))
}

#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("local: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {program}"))?;
        Ok(collect(output))
    }

    fn exec_with_input(&self, program: &str, args: &[String], input: &[u8]) -> Result<CommandOutput> {
        debug!("local (stdin): {} {}", program, args.join(" "));
        let mut cmd = Command::new(program);
        cmd.args(args);
        run_with_input(cmd, input, program)
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }
}

/// Single-quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Split a passthrough option string such as `-p 2222 -i key` on whitespace.
pub fn split_opts(opts: &str) -> Vec<String> {
    opts.split_whitespace().map(str::to_string).collect()
}

/// Remote execution over ssh. The first command opens a control master that
/// later commands and rsync reuse; [`teardown`](CommandRunner::teardown)
/// closes it.
#[derive(Debug, Clone)]
pub struct SshRunner {
    pub host: String,
    pub ssh_opts: Vec<String>,
    pub control_path: PathBuf,
}

impl SshRunner {
    pub fn new(host: &str, ssh_opts: Vec<String>, control_dir: &Path) -> Self {
        Self {
            host: host.to_string(),
            ssh_opts,
            control_path: control_dir.join(format!("ssh-{}.sock", sanitize_host(host))),
        }
    }

    /// Arguments placed before the host on every ssh invocation.
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=300".to_string(),
        ];
        args.extend(self.ssh_opts.iter().cloned());
        args
    }

    /// The `-e` value rsync needs to ride the same connection.
    pub fn rsync_shell(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.base_args().iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }

    fn remote_command(program: &str, args: &[String]) -> String {
        std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn ssh(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args()).arg(&self.host).arg(remote);
        cmd
    }
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

impl CommandRunner for SshRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let remote = Self::remote_command(program, args);
        debug!("{}: {}", self.host, remote);
        let output = self
            .ssh(&remote)
            .output()
            .with_context(|| format!("Failed to execute ssh to {}", self.host))?;
        let output = collect(output);
        if output.status == 255 {
            warn!("ssh to {} failed: {}", self.host, output.stderr.trim());
        }
        Ok(output)
    }

    fn exec_with_input(&self, program: &str, args: &[String], input: &[u8]) -> Result<CommandOutput> {
        let remote = Self::remote_command(program, args);
        debug!("{} (stdin): {}", self.host, remote);
        run_with_input(self.ssh(&remote), input, "ssh")
    }

    fn describe(&self) -> String {
        self.host.clone()
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn teardown(&self) {
        if !self.control_path.exists() {
            return;
        }
        let result = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(&self.host)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => debug!("Closed ssh control master for {}", self.host),
            Ok(status) => debug!("ssh -O exit for {} returned {}", self.host, status),
            Err(e) => warn!("Failed to close ssh control master for {}: {}", self.host, e),
        }
    }
}

/// Drop-ins that belong to the destination environment and are never
/// overwritten by a push.
pub const PROTECTED_DROP_INS: [&str; 4] =
    ["object-cache.php", "advanced-cache.php", "db.php", "sunrise.php"];

#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

/// Bulk tree transfer with rsync, optionally over an ssh session.
#[derive(Debug, Clone, Default)]
pub struct Transport {
    /// `-e` value when the destination is remote.
    pub remote_shell: Option<String>,
    pub host: Option<String>,
    pub extra_opts: Vec<String>,
    pub dry_run: bool,
}

impl Transport {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn over_ssh(runner: &SshRunner) -> Self {
        Self {
            remote_shell: Some(runner.rsync_shell()),
            host: Some(runner.host.clone()),
            ..Self::default()
        }
    }

    pub fn with_opts(mut self, extra_opts: Vec<String>) -> Self {
        self.extra_opts = extra_opts;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn target(&self, path: &Path, trailing_slash: bool) -> String {
        let slash = if trailing_slash { "/" } else { "" };
        match &self.host {
            Some(host) => format!("{}:{}{}", host, path.display(), slash),
            None => format!("{}{}", path.display(), slash),
        }
    }

    /// Argument list for one rsync invocation. Directory sources sync their
    /// contents (trailing slash); files are copied as-is.
    pub fn rsync_args(&self, source: &Path, target: &Path, excludes: &[&str], delete: bool) -> Vec<String> {
        let mut args = vec!["-a".to_string(), "--stats".to_string()];
        if delete {
            args.push("--delete".to_string());
        }
        if self.dry_run {
            args.push("-n".to_string());
        }
        if let Some(shell) = &self.remote_shell {
            args.push("-e".to_string());
            args.push(shell.clone());
        }
        for pattern in excludes {
            args.push("--exclude".to_string());
            args.push((*pattern).to_string());
        }
        args.extend(self.extra_opts.iter().cloned());
        let is_dir = source.is_dir();
        args.push(if is_dir {
            format!("{}/", source.display())
        } else {
            source.display().to_string()
        });
        args.push(self.target(target, is_dir));
        args
    }
}

/// Moves a file or a directory's contents to the other side of a push.
///
/// `excludes` are never copied and, with `delete`, never removed from the
/// target either.
pub trait Transfer {
    fn push(&self, source: &Path, target: &Path, excludes: &[&str], delete: bool) -> Result<TransferStats>;
}

impl Transfer for Transport {
    fn push(&self, source: &Path, target: &Path, excludes: &[&str], delete: bool) -> Result<TransferStats> {
        info!(
            "Transferring {} to {}{}",
            source.display(),
            self.target(target, false),
            if self.dry_run { " (dry run)" } else { "" }
        );
        let args = self.rsync_args(source, target, excludes, delete);
        debug!("rsync {}", args.join(" "));
        let output = Command::new("rsync")
            .args(&args)
            .output()
            .with_context(|| "Failed to execute rsync command")?;

        debug!("Rsync stdout: {}", String::from_utf8_lossy(&output.stdout));
        rsync_outcome(
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
            self.dry_run,
        )
    }
}

/// Map an rsync exit status onto the transfer result.
fn rsync_outcome(code: Option<i32>, stderr: &str, dry_run: bool) -> Result<TransferStats> {
    let mut stats = TransferStats {
        dry_run,
        warnings: Vec::new(),
    };
    match code {
        Some(0) => {
            info!("Rsync transfer completed successfully");
            Ok(stats)
        }
        // 23/24: partial transfer or vanished source files
        Some(code @ (23 | 24)) => {
            warn!("Rsync transfer completed with exit code {}: {}", code, stderr);
            stats.warnings.push(format!("rsync exit code {code}: {}", stderr.trim()));
            Ok(stats)
        }
        Some(code) => Err(MigrateError::Transfer(format!(
            "rsync exit code {}: {}",
            code,
            stderr.trim()
        ))),
        None => Err(MigrateError::Transfer(
            "rsync was terminated by signal".to_string(),
        )),
    }
}

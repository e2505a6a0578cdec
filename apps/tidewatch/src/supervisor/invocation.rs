use std::fmt;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::{LaunchMode, SupervisorConfig};

/// The runtime command line, companion manifest first so it owns the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInvocation {
    program: String,
    args: Vec<String>,
}

impl RuntimeInvocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn build(config: &SupervisorConfig, companion_path: &Path) -> Self {
        let mut args = config.runtime_args.clone();
        args.push("dev".into());
        args.push("-c".into());
        args.push(companion_path.display().to_string());
        if config.mode == LaunchMode::Primary {
            args.push("-c".into());
            args.push(config.manifest_path.display().to_string());
        }
        args.extend([
            "--persist-to".to_owned(),
            config.persist_to.display().to_string(),
            "--port".to_owned(),
            config.runtime_port.to_string(),
            "--ip".to_owned(),
            "127.0.0.1".to_owned(),
        ]);
        args.extend(config.passthrough.iter().cloned());
        Self::new(config.runtime_program.clone(), args)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub(super) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: terminal interrupts reach tidewatch only, and
        // stop signals can address the runtime together with its workers.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

impl fmt::Display for RuntimeInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

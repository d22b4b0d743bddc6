use std::path::Path;

use tokio::process::Command;

use crate::config::SshProxyConfig;

/// Login node the scheduler commands are sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub port: u16,
    /// `user@host`
    pub destination: String,
}

impl From<&SshProxyConfig> for SshConfig {
    fn from(config: &SshProxyConfig) -> Self {
        Self {
            port: config.port,
            destination: format!("{}@{}", config.username, config.host),
        }
    }
}

impl SshConfig {
    fn ssh(&self) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(["-o", "BatchMode=yes", "-p"])
            .arg(self.port.to_string())
            .arg(&self.destination);
        command
    }
}

/// How a submit command is handed the job script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptInput {
    Argument,
    Stdin,
}

/// Runs scheduler commands on this host, or on the login node when a proxy is configured.
pub trait MaybeSsh {
    fn command(&self, program: &str) -> Command;

    /// `program` started from `workdir` and given `script`. Over ssh the remote shell parses
    /// the line, so both paths are quoted.
    fn in_workdir(
        &self,
        program: &str,
        workdir: &Path,
        script: &Path,
        input: ScriptInput,
    ) -> std::io::Result<Command>;
}

impl<Ctx> MaybeSsh for Ctx
where
    Ctx: AsRef<Option<SshConfig>>,
{
    fn command(&self, program: &str) -> Command {
        match self.as_ref() {
            Some(ssh) => {
                let mut command = ssh.ssh();
                command.arg(program);
                command
            }
            None => Command::new(program),
        }
    }

    fn in_workdir(
        &self,
        program: &str,
        workdir: &Path,
        script: &Path,
        input: ScriptInput,
    ) -> std::io::Result<Command> {
        let Some(ssh) = self.as_ref() else {
            let mut command = Command::new(program);
            command.current_dir(workdir);
            match input {
                ScriptInput::Argument => command.arg(script),
                ScriptInput::Stdin => command.stdin(std::fs::File::open(script)?),
            };
            return Ok(command);
        };

        let redirect = match input {
            ScriptInput::Argument => "",
            ScriptInput::Stdin => "< ",
        };
        let mut command = ssh.ssh();
        command.arg(format!(
            "cd {} && {program} {redirect}{}",
            shell_quote(workdir),
            shell_quote(script)
        ));
        Ok(command)
    }
}

/// Single-quotes a path for a POSIX shell.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

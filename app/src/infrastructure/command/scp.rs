use std::path::Path;

use tokio::process::Command;

use super::ssh_proxy::SshConfig;

/// Copies files to the login node behind the ssh proxy.
pub trait Scp {
    /// `scp` uploading `local` to `remote`, keeping modes. `None` when there is no proxy and
    /// the file can be written in place.
    fn upload(&self, local: &Path, remote: &Path) -> Option<Command>;
}

impl<Ctx> Scp for Ctx
where
    Ctx: AsRef<Option<SshConfig>>,
{
    fn upload(&self, local: &Path, remote: &Path) -> Option<Command> {
        let ssh = self.as_ref().as_ref()?;
        let mut command = Command::new("scp");
        command
            .args(["-q", "-p", "-o", "BatchMode=yes", "-P"])
            .arg(ssh.port.to_string())
            .arg(local)
            .arg(format!("{}:{}", ssh.destination, remote.to_string_lossy()));
        Some(command)
    }
}

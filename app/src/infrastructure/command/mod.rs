mod scp;
mod ssh_proxy;

#[rustfmt::skip]
pub use self::{
    scp::Scp,
    ssh_proxy::{MaybeSsh, ScriptInput, SshConfig},
};

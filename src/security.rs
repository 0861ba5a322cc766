#![forbid(unsafe_code)]

//! Process-level guard for the videohub server.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to continue when the process runs as root. Uploaded files are
/// written under the storage root with the server's identity, so running
/// privileged would leave root-owned media behind.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}

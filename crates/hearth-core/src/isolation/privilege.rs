//! Dropping from root to the sandbox user
//!
//! Order matters: supplementary groups, then gid, then uid. Once the uid is
//! gone the process can no longer change its groups, so reversing the order
//! would leave it holding root's group memberships.

use crate::{HearthError, Result};
use nix::unistd::{Gid, Uid, User};
use std::ffi::CString;

/// The credential syscalls a privilege drop goes through.
pub trait Credentials {
    /// Groups `uid` belongs to, including `gid`.
    fn supplementary_groups(&self, uid: u32, gid: u32) -> Result<Vec<u32>>;
    fn set_groups(&self, groups: &[u32]) -> Result<()>;
    fn set_gid(&self, gid: u32) -> Result<()>;
    fn set_uid(&self, uid: u32) -> Result<()>;
}

/// Credentials of the calling process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCredentials;

impl Credentials for SystemCredentials {
    fn supplementary_groups(&self, uid: u32, gid: u32) -> Result<Vec<u32>> {
        let Some(user) = User::from_uid(Uid::from_raw(uid))? else {
            tracing::debug!(uid, "no passwd entry, using primary group only");
            return Ok(vec![gid]);
        };
        let name = CString::new(user.name.as_str())
            .map_err(|e| HearthError::Privilege(format!("invalid user name: {e}")))?;
        let groups = nix::unistd::getgrouplist(&name, Gid::from_raw(gid)).map_err(|e| {
            HearthError::Privilege(format!("failed to list groups of {}: {e}", user.name))
        })?;
        Ok(groups.into_iter().map(Gid::as_raw).collect())
    }

    fn set_groups(&self, groups: &[u32]) -> Result<()> {
        let gids: Vec<Gid> = groups.iter().copied().map(Gid::from_raw).collect();
        nix::unistd::setgroups(&gids)
            .map_err(|e| HearthError::Privilege(format!("setgroups({groups:?}) failed: {e}")))
    }

    fn set_gid(&self, gid: u32) -> Result<()> {
        nix::unistd::setgid(Gid::from_raw(gid))
            .map_err(|e| HearthError::Privilege(format!("setgid({gid}) failed: {e}")))
    }

    fn set_uid(&self, uid: u32) -> Result<()> {
        nix::unistd::setuid(Uid::from_raw(uid))
            .map_err(|e| HearthError::Privilege(format!("setuid({uid}) failed: {e}")))
    }
}

/// Groups `uid` will hold inside the sandbox, looked up in the host's user
/// database. A failed lookup leaves only the primary group.
pub fn host_groups(credentials: &dyn Credentials, uid: u32, gid: u32) -> Vec<u32> {
    match credentials.supplementary_groups(uid, gid) {
        Ok(groups) if groups.contains(&gid) => groups,
        Ok(mut groups) => {
            groups.insert(0, gid);
            groups
        }
        Err(e) => {
            tracing::warn!(uid, gid, "group lookup failed, using primary group only: {e}");
            vec![gid]
        }
    }
}

/// Become `uid:gid` holding exactly `groups`.
pub fn drop_privileges(
    credentials: &dyn Credentials,
    uid: u32,
    gid: u32,
    groups: &[u32],
) -> Result<()> {
    credentials.set_groups(groups)?;
    credentials.set_gid(gid)?;
    credentials.set_uid(uid)?;
    tracing::info!(uid, gid, groups = groups.len(), "privileges dropped");
    Ok(())
}

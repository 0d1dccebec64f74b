use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, DaemonResult};
use crate::sys::unix;

/// User and group identities assumed by the daemon after it is reborn.
///
/// # Zero means unchanged
///
/// An id of `0` is never applied: the daemon keeps whatever uid/gid it
/// inherited. There is no way to request an explicit switch *to* root or
/// group 0 through this type; a daemon started as root stays root unless a
/// nonzero id is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// User id to switch to; `0` leaves it unchanged.
    pub uid: u32,
    /// Group id to switch to; `0` leaves it unchanged.
    pub gid: u32,
}

impl Credential {
    /// Builds a credential from raw ids.
    pub const fn new(uid: u32, gid: u32) -> Self {
        Credential { uid, gid }
    }

    /// Resolves user and group names through the system databases.
    ///
    /// A missing name resolves to `0`, i.e. "leave unchanged".
    pub fn from_names(user: Option<&str>, group: Option<&str>) -> DaemonResult<Self> {
        let uid = match user {
            Some(name) => unix::user_id(name)?
                .ok_or_else(|| DaemonError::PrivilegeError(format!("User '{}' not found", name)))?,
            None => 0,
        };
        let gid = match group {
            Some(name) => unix::group_id(name)?
                .ok_or_else(|| DaemonError::PrivilegeError(format!("Group '{}' not found", name)))?,
            None => 0,
        };
        Ok(Credential { uid, gid })
    }

    /// Switches group first, then user: once the uid is dropped the process
    /// may no longer be allowed to change its gid.
    pub(crate) fn apply(self) -> DaemonResult<()> {
        if self.gid > 0 {
            unix::setgid(self.gid).map_err(|err| {
                DaemonError::PrivilegeError(format!("Failed to setgid({}): {}", self.gid, err))
            })?;
        }
        if self.uid > 0 {
            unix::setuid(self.uid).map_err(|err| {
                DaemonError::PrivilegeError(format!("Failed to setuid({}): {}", self.uid, err))
            })?;
        }
        Ok(())
    }
}

use std::{io, path::Path};

use nix::unistd::{fchownat, FchownatFlags, Gid, Group, Uid, User};
use tracing::instrument;
use walkdir::WalkDir;

/// The user (and optionally group) exec dirs are handed over to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: Uid,
    pub gid: Option<Gid>,
}

impl Owner {
    /// Looks up a user name, and optionally a group name, in the system
    /// databases.
    pub fn lookup(user: &str, group: Option<&str>) -> io::Result<Self> {
        let uid = User::from_name(user)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no user {user}")))?
            .uid;

        let gid = match group {
            None => None,
            Some(group) => Some(
                Group::from_name(group)?
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, format!("no group {group}"))
                    })?
                    .gid,
            ),
        };

        Ok(Self { uid, gid })
    }
}

/// Changes the owner of `root` and everything below it. Symlinks are
/// changed themselves, never followed.
#[instrument(err)]
pub fn set_all_owner(root: &Path, owner: Owner) -> io::Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        fchownat(
            None,
            entry.path(),
            Some(owner.uid),
            owner.gid,
            FchownatFlags::NoFollowSymlink,
        )?;
    }
    Ok(())
}

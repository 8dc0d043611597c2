//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailcol.
//
// Mailcol is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcol is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcol. If not, see <http://www.gnu.org/licenses/>.

//! The mailbox catalog.
//!
//! `mailbox_by_path` maps each path to the mailbox currently holding it, and
//! `mailbox` holds the metadata of each mailbox by ID. The path mapping is
//! claimed with a conditional insert, which is the only place in the store
//! where exactly one of several concurrent writers is guaranteed to win.
//! Metadata is only written once the path has been claimed.

use log::{error, warn};
use rand::Rng;
use rusqlite::OptionalExtension as _;

use super::{connection::Connection, types::*};
use crate::{store::model::*, support::error::Error};

/// The longest path component, in bytes, that the storage engine accepts.
pub const MAX_PATH_COMPONENT_LEN: usize = 65_535;

impl FromRow for Mailbox {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get("mailbox_id")?),
            path: MailboxPath {
                namespace: row.get("namespace")?,
                owner: row.get("owner")?,
                name: row.get("name")?,
            },
            uid_validity: Some(row.get("uid_validity")?),
            acl: row.get::<_, Cbor<MailboxAcl>>("acl")?.0,
        })
    }
}

impl Connection {
    /// Looks up the mailbox currently at `path`.
    pub fn find_mailbox_by_path(
        &self,
        path: &MailboxPath,
    ) -> Result<Mailbox, Error> {
        check_path(path)?;

        let id = self
            .cxn
            .prepare_cached(
                "SELECT `mailbox_id` FROM `mailbox_by_path` \
                 WHERE `namespace` = ? AND `owner` = ? AND `name` = ?",
            )?
            .query_row(
                (&path.namespace, &path.owner, &path.name),
                from_single::<MailboxId>,
            )
            .optional()?
            .ok_or(Error::NxMailbox)?;

        self.find_mailbox_by_id(id).map_err(|e| {
            if matches!(e, Error::NxMailbox) {
                warn!(
                    "{} Path {} refers to mailbox {} which has no metadata",
                    self.log_prefix, path, id,
                );
            }
            e
        })
    }

    /// Looks up the mailbox with the given ID.
    pub fn find_mailbox_by_id(&self, id: MailboxId) -> Result<Mailbox, Error> {
        self.cxn
            .prepare_cached("SELECT * FROM `mailbox` WHERE `mailbox_id` = ?")?
            .query_row((id,), from_row)
            .optional()?
            .ok_or(Error::NxMailbox)
    }

    /// Lists the mailboxes in the given namespace and owner whose names start
    /// with `prefix`, ordered by name.
    pub fn list_mailboxes_by_prefix(
        &self,
        namespace: &str,
        owner: &str,
        prefix: &str,
    ) -> Result<Vec<Mailbox>, Error> {
        let ids = self
            .cxn
            .prepare_cached(
                "SELECT `mailbox_id` FROM `mailbox_by_path` \
                 WHERE `namespace` = ?1 AND `owner` = ?2 \
                 AND substr(`name`, 1, length(?3)) = ?3 \
                 ORDER BY `name`",
            )?
            .query_map((namespace, owner, prefix), from_single::<MailboxId>)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut ret = Vec::with_capacity(ids.len());
        for id in ids {
            match self.find_mailbox_by_id(id) {
                Ok(mailbox) => ret.push(mailbox),
                // The path was claimed but the metadata is not there (yet)
                Err(Error::NxMailbox) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ret)
    }

    /// Saves `mailbox`, returning it as stored.
    ///
    /// If `mailbox.id` is `None`, a new mailbox is created with a fresh ID and
    /// (unless one is given) a random UID validity. This fails with
    /// `MailboxExists` if the path is already taken.
    ///
    /// Otherwise, the existing mailbox is updated. If its path changed, the
    /// old path is released and then the new path is claimed. Those are two
    /// separate writes: if claiming the new path fails, an attempt is made to
    /// reclaim the old one, and if that fails too the mailbox is only
    /// reachable by ID until it is saved again.
    pub fn save_mailbox(&self, mailbox: &Mailbox) -> Result<Mailbox, Error> {
        check_path(&mailbox.path)?;

        let Some(id) = mailbox.id else {
            return self.create_mailbox(mailbox);
        };

        let existing = self.find_mailbox_by_id(id)?;
        let saved = Mailbox {
            id: Some(id),
            path: mailbox.path.clone(),
            uid_validity: mailbox.uid_validity.or(existing.uid_validity),
            acl: mailbox.acl.clone(),
        };

        if existing.path != saved.path {
            self.release_path(&existing.path, id)?;
            if !self.claim_path(&saved.path, id)? {
                if !self.claim_path(&existing.path, id)? {
                    error!(
                        "{} Mailbox {} lost its path {} during a failed \
                         rename to {}",
                        self.log_prefix, id, existing.path, saved.path,
                    );
                }
                return Err(Error::MailboxExists);
            }
        }

        self.write_mailbox_metadata(&saved)?;
        Ok(saved)
    }

    /// Deletes `mailbox` along with everything stored in it.
    ///
    /// Only the ID of `mailbox` matters. Whatever path currently refers to
    /// that ID is released, even if `mailbox` was loaded before a rename.
    pub fn delete_mailbox(&self, mailbox: &Mailbox) -> Result<(), Error> {
        let id = mailbox.id.ok_or(Error::NxMailbox)?;

        self.cxn
            .prepare_cached(
                "DELETE FROM `mailbox_by_path` WHERE `mailbox_id` = ?",
            )?
            .execute((id,))?;
        self.cxn
            .prepare_cached("DELETE FROM `mailbox` WHERE `mailbox_id` = ?")?
            .execute((id,))?;
        self.delete_mailbox_messages(id)?;
        self.delete_indexes(id)?;
        self.delete_counters(id)?;
        Ok(())
    }

    fn create_mailbox(&self, mailbox: &Mailbox) -> Result<Mailbox, Error> {
        let id = MailboxId::generate();
        let saved = Mailbox {
            id: Some(id),
            path: mailbox.path.clone(),
            uid_validity: Some(mailbox.uid_validity.unwrap_or_else(|| {
                rand::thread_rng().gen_range(1, i32::MAX as u32)
            })),
            acl: mailbox.acl.clone(),
        };

        if !self.claim_path(&saved.path, id)? {
            return Err(Error::MailboxExists);
        }

        self.write_mailbox_metadata(&saved)?;
        Ok(saved)
    }

    /// Conditionally maps `path` to `id`. Returns whether this call won.
    fn claim_path(&self, path: &MailboxPath, id: MailboxId) -> Result<bool, Error> {
        let inserted = self
            .cxn
            .prepare_cached(
                "INSERT OR IGNORE INTO `mailbox_by_path` \
                 (`namespace`, `owner`, `name`, `mailbox_id`) \
                 VALUES (?, ?, ?, ?)",
            )?
            .execute((&path.namespace, &path.owner, &path.name, id))?;
        Ok(1 == inserted)
    }

    /// Removes the mapping of `path` if it refers to `id`.
    fn release_path(&self, path: &MailboxPath, id: MailboxId) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "DELETE FROM `mailbox_by_path` \
                 WHERE `namespace` = ? AND `owner` = ? AND `name` = ? \
                 AND `mailbox_id` = ?",
            )?
            .execute((&path.namespace, &path.owner, &path.name, id))?;
        Ok(())
    }

    fn write_mailbox_metadata(&self, mailbox: &Mailbox) -> Result<(), Error> {
        self.cxn
            .prepare_cached(
                "INSERT OR REPLACE INTO `mailbox` (\
                   `mailbox_id`, `namespace`, `owner`, `name`, \
                   `uid_validity`, `acl`\
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )?
            .execute((
                mailbox.id,
                &mailbox.path.namespace,
                &mailbox.path.owner,
                &mailbox.path.name,
                mailbox.uid_validity.unwrap_or(0),
                Cbor(&mailbox.acl),
            ))?;
        Ok(())
    }
}

fn check_path(path: &MailboxPath) -> Result<(), Error> {
    if [&path.namespace, &path.owner, &path.name]
        .iter()
        .any(|component| component.len() > MAX_PATH_COMPONENT_LEN)
    {
        Err(Error::NameTooLong)
    } else {
        Ok(())
    }
}

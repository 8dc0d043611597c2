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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such message")]
    NxMessage,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Mailbox name too long")]
    NameTooLong,
    #[error("Unsafe flag name")]
    UnsafeName,
    #[error("Storage unavailable")]
    StorageUnavailable,
    #[error("Identifier allocation gave up after {0} attempts")]
    AllocationExhausted(u32),
    #[error("Mailbox full")]
    MailboxFull,
    #[error("Blob {0} is missing chunk {1}")]
    MissingChunk(String, u32),
    #[error("Corrupt record: {0}")]
    CorruptRecord(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(rusqlite::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode::{DatabaseBusy, DatabaseLocked};

        match e {
            rusqlite::Error::SqliteFailure(ref f, _)
                if matches!(f.code, DatabaseBusy | DatabaseLocked) =>
            {
                Error::StorageUnavailable
            },
            e => Error::Sqlite(e),
        }
    }
}

impl Error {
    /// Whether the operation that produced this error may succeed if simply
    /// tried again.
    pub fn is_transient(&self) -> bool {
        matches!(*self, Error::StorageUnavailable)
    }
}

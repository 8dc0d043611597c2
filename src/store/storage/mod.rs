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

//! The storage layer of the mailbox store.
//!
//! The storage layer is stateless aside from the SQLite connection itself.
//! Each table is written with single statements, every one of which is atomic
//! on its own; no transaction spans more than one logical row, except where
//! noted. This mirrors the guarantees of a column store, where the only
//! atomicity primitive is a conditional write on a single row:
//!
//! - The path uniqueness of mailboxes is the only "exactly one writer wins"
//!   write (`INSERT OR IGNORE` checked through the change count).
//! - UID and modseq counters are advanced by conditional updates predicated on
//!   the previously read value, retried a bounded number of times.
//! - Everything else is last-writer-wins or additive.
//!
//! Any number of connections, in any number of threads or processes, may be
//! open on the same database at once.

mod allocation;
mod blob;
mod catalog;
mod connection;
mod indexes;
mod mailbox_messages;
mod messages_v1;
mod messages_v2;
mod types;

pub use blob::{BlobReader, ChunkStream};
pub use connection::Connection;

#[cfg(test)]
pub(crate) use connection::test_support;

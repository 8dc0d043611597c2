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

//! The mailbox store.
//!
//! The store is split into two layers in the same way as the rest of the
//! system:
//!
//! - `storage` is stateless aside from its SQLite connection. It provides the
//!   tables and the single-statement operations on them: the chunked blob
//!   store, both generations of message records, the mailbox catalog, the
//!   counters behind UID and modseq allocation, and the derived indexes.
//!
//! - `state` owns things with a lifetime: the migration worker group and its
//!   tracker, and the `Engine` which ties them to a database.

pub mod model;
pub mod state;
pub mod storage;

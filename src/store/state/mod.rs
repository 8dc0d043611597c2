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

//! Long-lived state on top of the storage layer.
//!
//! The main type is `Engine`, which owns the migration worker group and its
//! tracker for as long as a database is open, and hands out `Session`s, one
//! per caller thread, through which everything else is done.

mod bridge;
mod engine;
mod tracker;

pub use bridge::{FullMigrationReport, MigrationBridge};
pub use engine::{Engine, Session};
pub use tracker::{MigrationState, MigrationTracker};

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

use std::sync::Mutex;

/// A snapshot of the migration counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationState {
    pub num_success: u64,
    pub num_error: u64,
}

/// Counts the outcomes of migration attempts.
///
/// Both counters live behind one lock so that every snapshot is consistent
/// with some serial order of the reports.
#[derive(Debug, Default)]
pub struct MigrationTracker {
    state: Mutex<MigrationState>,
}

impl MigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one successful migration and returns the resulting state.
    pub fn report_success(&self) -> MigrationState {
        let mut state = self.state.lock().unwrap();
        state.num_success += 1;
        *state
    }

    /// Records one failed migration and returns the resulting state.
    pub fn report_error(&self) -> MigrationState {
        let mut state = self.state.lock().unwrap();
        state.num_error += 1;
        *state
    }

    pub fn state(&self) -> MigrationState {
        *self.state.lock().unwrap()
    }
}

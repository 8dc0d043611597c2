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

use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Tracks text that should be included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone, Debug)]
pub struct LogPrefix {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    database: String,
    worker: Option<String>,
}

impl LogPrefix {
    /// Creates the prefix for everything done against the database at
    /// `path`.
    pub fn for_database(path: &Path) -> Self {
        let database = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                database: sanitise(database),
                worker: None,
            }),
        }
    }

    /// Derives the prefix for a background worker on the same database.
    pub fn for_worker(&self, worker: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                database: self.inner.database.clone(),
                worker: Some(sanitise(worker)),
            }),
        }
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mailcol[{}", self.inner.database)?;
        if let Some(ref worker) = self.inner.worker {
            write!(f, " {worker}")?;
        }
        write!(f, "]")
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

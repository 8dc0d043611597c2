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

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The configuration of a Mailcol store.
///
/// This is stored in a TOML file which is passed to the command-line tools;
/// every section may be omitted, in which case the defaults below apply.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Options relating to the chunked blob store.
    #[serde(default)]
    pub blob: BlobConfig,

    /// Options relating to UID and modseq allocation.
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Options relating to migration of V1 messages into V2.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        Ok(toml::from_slice(&data)?)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BlobConfig {
    /// The maximum size, in bytes, of a single stored chunk.
    ///
    /// This only affects blobs written from now on; existing blobs keep
    /// whatever chunking they were written with until their content is saved
    /// again.
    pub chunk_size: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self { chunk_size: 1024 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// The number of times a conditional update of a UID or modseq counter is
    /// attempted before giving up with `AllocationExhausted`.
    pub max_attempts: u32,

    /// How long, in milliseconds, a connection waits on a locked database
    /// before failing with `StorageUnavailable`.
    pub busy_timeout_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            busy_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// If true, V1 messages found by a read are queued for rewriting into V2.
    pub on_the_fly: bool,

    /// The maximum number of pending migration entries. Entries offered while
    /// the queue is full are dropped.
    pub queue_capacity: usize,

    /// The number of migration worker threads. 0 means one per CPU.
    pub workers: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            on_the_fly: true,
            queue_capacity: 10_000,
            workers: 0,
        }
    }
}

impl MigrationConfig {
    pub fn effective_workers(&self) -> usize {
        if 0 == self.workers {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

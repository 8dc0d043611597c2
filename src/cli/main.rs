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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use crate::store::{state::Engine, storage::Connection};
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::StoreConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    Migrate(MigrateSubcommand),
    /// Show the schema version and the number of stored message records of
    /// each generation.
    Status(CommonOptions),
}

#[derive(StructOpt)]
struct CommonOptions {
    /// The database file.
    #[structopt(long, parse(from_os_str))]
    db: PathBuf,

    /// A TOML file of store options. All options have defaults, so this may
    /// be omitted.
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// A log4rs configuration file. Without one, log to standard error.
    #[structopt(long, parse(from_os_str))]
    log_config: Option<PathBuf>,
}

/// Rewrite every legacy (V1) message record into the current format.
///
/// Each round offers every remaining V1 record to the migration workers and
/// waits for them to finish. Records that did not fit in the migration queue
/// are picked up by the next round. Once no V1 records remain, the schema
/// version is raised to 2 and V1 is no longer consulted by reads.
///
/// The database may be in use by other processes while this runs.
#[derive(StructOpt)]
struct MigrateSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// Give up after this many rounds.
    #[structopt(long, default_value = "10")]
    max_rounds: u32,

    /// How long, in seconds, to wait for the workers in each round.
    #[structopt(long, default_value = "3600")]
    round_timeout: u64,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Migrate(cmd) => migrate(cmd),
        Command::Status(common) => status(common),
    }
}

fn migrate(cmd: MigrateSubcommand) {
    let config = setup(&cmd.common);
    let engine =
        Engine::open(&cmd.common.db, config).unwrap_or_else(|e| die(e));

    let done = engine
        .migrate_fully(cmd.max_rounds, Duration::from_secs(cmd.round_timeout))
        .unwrap_or_else(|e| die(e));
    let state = engine.migration_state();
    engine.shutdown();

    println!("migrated: {}", state.num_success);
    println!("failed:   {}", state.num_error);

    if !done {
        eprintln!("V1 records remain; run this command again to retry them.");
        EX_TEMPFAIL.exit();
    }
}

fn status(common: CommonOptions) {
    let config = setup(&common);
    // A mistyped path must not leave an empty database behind.
    let cxn = Connection::open_existing(&common.db, Arc::new(config))
        .unwrap_or_else(|e| {
            eprintln!("Cannot open '{}': {}", common.db.display(), e);
            Sysexit::for_error(&e).exit()
        });
    let (version, v1, v2) = read_status(&cxn).unwrap_or_else(|e| die(e));

    println!("schema version: {}", version);
    println!("V1 records:     {}", v1);
    println!("V2 records:     {}", v2);
}

fn read_status(cxn: &Connection) -> Result<(u32, u64, u64), Error> {
    Ok((
        cxn.schema_version()?,
        cxn.count_messages_v1()?,
        cxn.count_messages_v2()?,
    ))
}

/// Initialises logging and loads the store configuration.
fn setup(common: &CommonOptions) -> StoreConfig {
    match common.log_config {
        Some(ref log_config) => {
            if let Err(e) = log4rs::init_file(
                log_config,
                log4rs::file::Deserializers::new(),
            ) {
                eprintln!(
                    "Error in log config at '{}': {}",
                    log_config.display(),
                    e
                );
                EX_CONFIG.exit();
            }
        },
        None => crate::init_simple_log(),
    }

    match common.config {
        None => StoreConfig::default(),
        Some(ref path) => load_config(path),
    }
}

fn load_config(path: &Path) -> StoreConfig {
    match StoreConfig::load(path) {
        Ok(config) => config,
        Err(Error::Io(e)) => {
            eprintln!("Error reading '{}': {}", path.display(), e);
            EX_CONFIG.exit()
        },
        Err(e) => {
            eprintln!("Error in config file at '{}': {}", path.display(), e);
            EX_CONFIG.exit()
        },
    }
}

fn die(e: Error) -> ! {
    eprintln!("{}", e);
    Sysexit::for_error(&e).exit()
}

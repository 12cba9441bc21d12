// Cumulus backup system.
// Copyright 2006-2009, 2012 The Cumulus Developers.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Command-line entry point for Cumulus backups.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, FromArgMatches, Parser};
use tracing_subscriber::EnvFilter;

use cumulus::rules::RuleType;
use cumulus::{run_snapshot, SnapshotOptions};

#[derive(Debug, Parser)]
#[command(
    name = "cumulus",
    about = "Produce a backup snapshot of the given paths",
    version
)]
struct Args {
    /// Path where the backup is to be written.
    #[arg(long, value_name = "PATH")]
    dest: Option<PathBuf>,

    /// Program to invoke for each backup file generated.
    #[arg(long = "upload-script", value_name = "COMMAND")]
    upload_script: Option<String>,

    /// Directory where local backup metadata is stored (defaults to the
    /// destination).
    #[arg(long, value_name = "PATH")]
    localdb: Option<PathBuf>,

    /// Path for temporarily staging backup files (defaults to $TMPDIR or
    /// /tmp).
    #[arg(long, value_name = "PATH")]
    tmpdir: Option<PathBuf>,

    /// Program through which to filter segment data.
    #[arg(long, value_name = "COMMAND", default_value = "bzip2 -c")]
    filter: String,

    /// String to append to segment file names.
    #[arg(long = "filter-extension", value_name = "EXT", default_value = ".bz2")]
    filter_extension: String,

    /// Program through which to filter the snapshot descriptor.
    #[arg(long = "signature-filter", value_name = "COMMAND")]
    signature_filter: Option<String>,

    /// Optional name for this snapshot series.
    #[arg(long, value_name = "NAME", default_value = "")]
    scheme: String,

    /// Include files matching PATTERN in the snapshot.
    #[arg(long, value_name = "PATTERN")]
    include: Vec<String>,

    /// Exclude files matching PATTERN from the snapshot.
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Parse files matching PATTERN for subtree-specific rules.
    #[arg(long = "dir-merge", value_name = "PATTERN")]
    dir_merge: Vec<String>,

    /// Do not reuse metadata from previous backups.
    #[arg(long = "full-metadata")]
    full_metadata: bool,

    /// Re-read all file data to verify the statcache.
    #[arg(long = "rebuild-statcache")]
    rebuild_statcache: bool,

    /// List files as they are backed up.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Paths to back up.
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let matches = match Args::command().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            // Help and version output are not usage errors.
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
            print!("{err}");
            return ExitCode::SUCCESS;
        }
    };
    let args = match Args::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if args.dest.is_some() == args.upload_script.is_some() {
        eprintln!(
            "cumulus: exactly one of --dest= and --upload-script= must be specified"
        );
        return ExitCode::FAILURE;
    }

    // Rules take effect in the order given on the command line, across all
    // three flags.
    let mut rules: Vec<(usize, RuleType, String)> = Vec::new();
    for (id, rule_type) in [
        ("include", RuleType::Include),
        ("exclude", RuleType::Exclude),
        ("dir_merge", RuleType::DirMerge),
    ] {
        if let Some(indices) = matches.indices_of(id) {
            let values = matches
                .get_many::<String>(id)
                .expect("indices imply values");
            for (index, value) in indices.zip(values) {
                rules.push((index, rule_type, value.clone()));
            }
        }
    }
    rules.sort_by_key(|(index, _, _)| *index);

    let options = SnapshotOptions {
        dest: args.dest,
        upload_script: args.upload_script,
        localdb: args.localdb,
        tmpdir: args.tmpdir,
        filter: if args.filter.is_empty() {
            None
        } else {
            Some(args.filter)
        },
        filter_extension: args.filter_extension,
        signature_filter: args.signature_filter,
        scheme: args.scheme,
        rules: rules
            .into_iter()
            .map(|(_, rule_type, pattern)| (rule_type, pattern))
            .collect(),
        full_metadata: args.full_metadata,
        rebuild_statcache: args.rebuild_statcache,
        verbose: args.verbose,
        paths: args.paths,
    };

    match run_snapshot(options) {
        Ok(descriptor) => {
            tracing::debug!("wrote descriptor {descriptor}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("cumulus: {err}");
            ExitCode::FAILURE
        }
    }
}

/*
 * Created on Mon Feb 05 2024
 *
 * This file is a part of Rillflow
 * Rillflow is a free and open-source fault-tolerant distributed dataflow
 * engine written by Andrea Valli ("the Author") with the vision to make
 * stream pipelines survive worker crashes without giving up exactly-once
 * results.
 *
 * Copyright (c) 2024, Andrea Valli <andrea@rillflow.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # The durable substrate
//!
//! Each worker owns one directory under the data root and nothing else:
//!
//! ```text
//! Data/
//!     Worker_0/
//!         data.csv             local partition, written once at setup
//!         progress.txt         committed read offset into data.csv
//!         inserted.csv         inbound change-keys awaiting delivery
//!         requests_log.csv     highest request id seen, per sender
//!         ck_batch.csv         the staged previous remote batch
//!         result.csv           partial results
//!         CK_counter.csv       request counter + batch-source flag
//!         CK_sent_received.csv change-key conservation counters
//!     Worker_1/
//!         ...
//! ```
//!
//! Everything is newline-terminated ASCII CSV. Rewrites go through a
//! sibling temp file and a rename so that a torn write can never leave a
//! half-old, half-new file behind; appends flush and sync before returning.

use crate::wire::WorkerId;
use std::fs::{self, File, OpenOptions};
use std::io::Result as IoResult;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

mod loader;
pub use loader::BatchLoader;
mod inserts;
pub use inserts::InsertManager;
mod results;
pub use results::{CounterStore, ResultStore};

pub const FILE_DATA: &str = "data.csv";
pub const FILE_PROGRESS: &str = "progress.txt";
pub const FILE_INSERTED: &str = "inserted.csv";
pub const FILE_REQUESTS: &str = "requests_log.csv";
pub const FILE_CK_BATCH: &str = "ck_batch.csv";
pub const FILE_RESULT: &str = "result.csv";
pub const FILE_CK_COUNTER: &str = "CK_counter.csv";
pub const FILE_CK_SENT_RECEIVED: &str = "CK_sent_received.csv";

/// A worker's exclusive durable directory
#[derive(Debug, Clone)]
pub struct WorkerHome {
    root: PathBuf,
}

impl WorkerHome {
    pub fn new(data_root: &Path, id: WorkerId) -> Self {
        Self {
            root: data_root.join(format!("Worker_{}", id)),
        }
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn data_file(&self) -> PathBuf {
        self.root.join(FILE_DATA)
    }
    pub fn progress_file(&self) -> PathBuf {
        self.root.join(FILE_PROGRESS)
    }
    pub fn insert_log(&self) -> PathBuf {
        self.root.join(FILE_INSERTED)
    }
    pub fn request_log(&self) -> PathBuf {
        self.root.join(FILE_REQUESTS)
    }
    pub fn ck_batch_file(&self) -> PathBuf {
        self.root.join(FILE_CK_BATCH)
    }
    pub fn result_file(&self) -> PathBuf {
        self.root.join(FILE_RESULT)
    }
    pub fn ck_counter_file(&self) -> PathBuf {
        self.root.join(FILE_CK_COUNTER)
    }
    pub fn ck_sent_received_file(&self) -> PathBuf {
        self.root.join(FILE_CK_SENT_RECEIVED)
    }
}

/// Create the `Data/Worker_<i>` tree, ignoring directories that exist
pub fn create_tree(data_root: &Path, workers: usize) -> IoResult<()> {
    fs::create_dir_all(data_root)?;
    for id in 0..workers {
        fs::create_dir_all(WorkerHome::new(data_root, id).root())?;
    }
    Ok(())
}

/// Remove the whole data root; a run starts from a clean tree
pub fn purge_tree(data_root: &Path) -> IoResult<()> {
    if data_root.exists() {
        fs::remove_dir_all(data_root)?;
    }
    Ok(())
}

/// Persist a worker's initial partition (`data.csv`), written once at setup
pub fn write_partition(home: &WorkerHome, contents: &str) -> IoResult<()> {
    atomic_rewrite(&home.data_file(), contents)
}

/// Atomically replace the contents of `path`: write a sibling temp file,
/// sync it, then rename it over the target
pub(crate) fn atomic_rewrite(path: &Path, contents: &str) -> IoResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(&file);
        writer.write_all(contents.as_bytes())?;
        writer.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Append to `path`, creating it if missing, flushing and syncing before
/// returning
pub(crate) fn fsynced_append(path: &Path, contents: &str) -> IoResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}

/// Read `path` into lines; a missing file is an empty file
pub(crate) fn read_lines(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(contents) => contents.lines().map(|l| l.to_owned()).collect(),
        Err(_) => Vec::new(),
    }
}

/// Parse one `a,b` line of 32-bit integers. Malformed lines yield `None`
/// and are skipped by callers (a partially written line is ignored).
pub(crate) fn parse_pair(line: &str) -> Option<(i32, i32)> {
    let (a, b) = line.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

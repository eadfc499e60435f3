/*
 * Created on Tue Feb 06 2024
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

//! # The local batch loader
//!
//! Reads the worker's partition (`data.csv`, one `worker,value` line per
//! record) in batches of up to N records, checkpointing the byte offset of
//! the first unread record in `progress.txt`. The offset is only advanced
//! in memory by [`BatchLoader::load_batch`]; nothing hits the disk until the
//! executor has safely handled the batch and calls
//! [`BatchLoader::save_progress`]. Re-reading from the last committed
//! offset after a crash therefore replays exactly the uncommitted batch:
//! at-least-once local delivery, made exactly-once by the executor's commit
//! ordering.

use super::WorkerHome;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

pub struct BatchLoader {
    data_path: PathBuf,
    progress_path: PathBuf,
    batch_size: usize,
    offset: u64,
}

impl BatchLoader {
    /// Open the loader, resuming from the committed offset if one exists
    pub fn open(home: &WorkerHome, batch_size: usize) -> Self {
        let progress_path = home.progress_file();
        let offset = std::fs::read_to_string(&progress_path)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Self {
            data_path: home.data_file(),
            progress_path,
            batch_size,
            offset,
        }
    }

    /// Read the next batch of up to N values. An empty batch means the end
    /// of the partition. A file that cannot be opened is logged and treated
    /// as drained; the next batch boundary will try again.
    pub fn load_batch(&mut self) -> Vec<i32> {
        let file = match File::open(&self.data_path) {
            Ok(f) => f,
            Err(e) => {
                log::error!("Failed to open {}: {}", self.data_path.display(), e);
                return Vec::new();
            }
        };
        let mut reader = BufReader::new(file);
        if let Err(e) = reader.seek(SeekFrom::Start(self.offset)) {
            log::error!("Failed to seek to {}: {}", self.offset, e);
            return Vec::new();
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut line = String::new();
        while batch.len() < self.batch_size {
            line.clear();
            let read = match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log::error!("Read error in {}: {}", self.data_path.display(), e);
                    break;
                }
            };
            // a line without a terminator is still being written; leave it
            // for the next batch
            if !line.ends_with('\n') {
                break;
            }
            self.offset += read as u64;
            match super::parse_pair(line.trim_end()) {
                Some((_, value)) => batch.push(value),
                None => log::warn!("Skipping malformed record line: {:?}", line.trim_end()),
            }
        }
        batch
    }

    /// Durably commit the current read position
    pub fn save_progress(&self) {
        if let Err(e) = super::atomic_rewrite(&self.progress_path, &format!("{}", self.offset)) {
            log::error!("Failed to persist read progress: {}", e);
        }
    }
}

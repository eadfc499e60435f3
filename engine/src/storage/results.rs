/*
 * Created on Mon Feb 12 2024
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

//! # Partial results and protocol counters
//!
//! Two small stores the executor commits at batch boundaries:
//!
//! - [`ResultStore`]: the partial result. For reduce-terminated schedules
//!   `result.csv` holds a single integer rewritten each batch; otherwise it
//!   is an append-only file of surviving records.
//! - [`CounterStore`]: `CK_counter.csv` (`changeKeyCtr,previousLocal`) and
//!   `CK_sent_received.csv` (`sent,received`). The request counter and the
//!   sent counter roll back to the last batch boundary on a crash, which is
//!   exactly what lets a replayed batch regenerate the same request ids and
//!   re-count its acknowledged handoffs once.

use super::WorkerHome;
use std::fmt::Write as _;
use std::path::PathBuf;

pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn open(home: &WorkerHome) -> Self {
        Self {
            path: home.result_file(),
        }
    }

    /// Append surviving records (pipelines without a final reduce)
    pub fn append_records(&self, records: &[i32]) {
        if records.is_empty() {
            return;
        }
        let mut contents = String::new();
        for r in records {
            let _ = writeln!(contents, "{}", r);
        }
        if let Err(e) = super::fsynced_append(&self.path, &contents) {
            log::error!("Failed to append partial results: {}", e);
        }
    }

    /// Rewrite the running reduce total
    pub fn write_reduce(&self, total: i32) {
        if let Err(e) = super::atomic_rewrite(&self.path, &format!("{}\n", total)) {
            log::error!("Failed to persist the reduce total: {}", e);
        }
    }

    /// Reload the running reduce total (0 when absent)
    pub fn load_reduce(&self) -> i32 {
        super::read_lines(&self.path)
            .first()
            .and_then(|line| line.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Reload all appended records
    pub fn load_records(&self) -> Vec<i32> {
        super::read_lines(&self.path)
            .iter()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }
}

pub struct CounterStore {
    ck_counter: PathBuf,
    sent_received: PathBuf,
}

impl CounterStore {
    pub fn open(home: &WorkerHome) -> Self {
        Self {
            ck_counter: home.ck_counter_file(),
            sent_received: home.ck_sent_received_file(),
        }
    }

    /// Persist the request counter and the source flag of the in-flight
    /// batch (1 = local, 0 = remote)
    pub fn save_ck(&self, change_key_ctr: u32, previous_local: bool) {
        let contents = format!("{},{}\n", change_key_ctr, previous_local as i32);
        if let Err(e) = super::atomic_rewrite(&self.ck_counter, &contents) {
            log::error!("Failed to persist the change-key counter: {}", e);
        }
    }

    /// Reload `(changeKeyCtr, previousLocal)`; a fresh worker starts at
    /// `(0, local)`
    pub fn load_ck(&self) -> (u32, bool) {
        super::read_lines(&self.ck_counter)
            .first()
            .and_then(|line| super::parse_pair(line))
            .map(|(ctr, local)| (ctr as u32, local != 0))
            .unwrap_or((0, true))
    }

    pub fn save_sent_received(&self, sent: u32, received: u32) {
        let contents = format!("{},{}\n", sent, received);
        if let Err(e) = super::atomic_rewrite(&self.sent_received, &contents) {
            log::error!("Failed to persist the conservation counters: {}", e);
        }
    }

    pub fn load_sent_received(&self) -> (u32, u32) {
        super::read_lines(&self.sent_received)
            .first()
            .and_then(|line| super::parse_pair(line))
            .map(|(sent, received)| (sent as u32, received as u32))
            .unwrap_or((0, 0))
    }
}

/*
 * Created on Thu Feb 08 2024
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

//! # The change-key insert manager
//!
//! Buffers change-key records received from peers until the executor is
//! ready to run them, durably and with sender-level idempotence. Three
//! files back it:
//!
//! - `inserted.csv`: the insert log, `step,value` appended in arrival order
//! - `requests_log.csv`: per sender, the highest request id accepted
//! - `ck_batch.csv`: the staged "previous batch"
//!
//! [`InsertManager::get_batch`] is idempotent until
//! [`InsertManager::persist_data`] acknowledges the batch: the peeled batch
//! is staged on disk first, so a crash between the two re-delivers exactly
//! the same records at the same schedule steps.

use super::WorkerHome;
use crate::wire::WorkerId;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;

pub struct InsertManager {
    insert_log: PathBuf,
    request_log: PathBuf,
    batch_file: PathBuf,
    batch_size: usize,
    /// buffered inserts keyed by the schedule step they resume at
    inserted: BTreeMap<usize, VecDeque<i32>>,
    /// the staged previous batch, re-delivered until acknowledged
    previous: BTreeMap<usize, Vec<i32>>,
    previous_size: usize,
    /// highest request id accepted, per sender
    last_seen: BTreeMap<WorkerId, u32>,
}

impl InsertManager {
    /// Open the manager, reloading the three backing files. Missing files
    /// mean a fresh worker; malformed lines are skipped.
    pub fn open(home: &WorkerHome, batch_size: usize) -> Self {
        let mut slf = Self {
            insert_log: home.insert_log(),
            request_log: home.request_log(),
            batch_file: home.ck_batch_file(),
            batch_size,
            inserted: BTreeMap::new(),
            previous: BTreeMap::new(),
            previous_size: 0,
            last_seen: BTreeMap::new(),
        };
        for line in super::read_lines(&slf.batch_file) {
            if let Some((step, value)) = super::parse_pair(&line) {
                slf.previous.entry(step as usize).or_default().push(value);
                slf.previous_size += 1;
            }
        }
        for line in super::read_lines(&slf.insert_log) {
            if let Some((step, value)) = super::parse_pair(&line) {
                slf.inserted.entry(step as usize).or_default().push_back(value);
            }
        }
        for line in super::read_lines(&slf.request_log) {
            if let Some((sender, req_id)) = super::parse_pair(&line) {
                slf.last_seen.insert(sender as usize, req_id as u32);
            }
        }
        slf
    }

    /// Accept a change-key insert from `sender` iff its request id is fresh.
    /// Returns whether the value was accepted; duplicates leave both the
    /// buffer and the durable state untouched.
    pub fn insert_value(
        &mut self,
        sender: WorkerId,
        req_id: u32,
        step: usize,
        value: i32,
    ) -> bool {
        if let Some(&seen) = self.last_seen.get(&sender) {
            if seen >= req_id {
                log::debug!(
                    "Ignoring duplicate insert from {} (req {}, value {})",
                    sender,
                    req_id,
                    value
                );
                return false;
            }
        }
        self.last_seen.insert(sender, req_id);
        self.inserted.entry(step).or_default().push_back(value);
        if let Err(e) = super::fsynced_append(&self.insert_log, &format!("{},{}\n", step, value)) {
            log::error!("Failed to append to the insert log: {}", e);
        }
        self.save_request_log();
        true
    }

    /// Hand out the next remote batch, keyed by schedule step. Yields the
    /// staged previous batch when one is on disk; otherwise peels up to N
    /// records off the head of the insert log, stages them and rewrites the
    /// log without them. An empty map means there is nothing buffered.
    pub fn get_batch(&mut self) -> BTreeMap<usize, Vec<i32>> {
        if self.previous_size > 0 {
            return self.previous.clone();
        }
        let mut batch: BTreeMap<usize, Vec<i32>> = BTreeMap::new();
        let mut taken = 0usize;
        let mut drained = Vec::new();
        for (&step, values) in self.inserted.iter_mut() {
            while taken < self.batch_size {
                match values.pop_front() {
                    Some(value) => {
                        batch.entry(step).or_default().push(value);
                        taken += 1;
                    }
                    None => break,
                }
            }
            if values.is_empty() {
                drained.push(step);
            }
            if taken == self.batch_size {
                break;
            }
        }
        for step in drained {
            self.inserted.remove(&step);
        }
        if taken == 0 {
            return BTreeMap::new();
        }
        self.previous = batch.clone();
        self.previous_size = taken;
        self.save_previous_batch();
        self.save_insert_log();
        batch
    }

    /// Acknowledge that the staged batch was fully consumed and committed
    pub fn persist_data(&mut self) {
        if self.previous_size == 0 {
            return;
        }
        self.previous.clear();
        self.previous_size = 0;
        if let Err(e) = super::atomic_rewrite(&self.batch_file, "") {
            log::error!("Failed to clear the staged batch: {}", e);
        }
    }

    /// True iff nothing is buffered in the insert log
    pub fn is_empty(&self) -> bool {
        self.inserted.values().all(|v| v.is_empty())
    }

    #[cfg(test)]
    pub fn last_seen(&self, sender: WorkerId) -> Option<u32> {
        self.last_seen.get(&sender).copied()
    }

    fn save_previous_batch(&self) {
        let mut contents = String::new();
        for (step, values) in &self.previous {
            for value in values {
                let _ = writeln!(contents, "{},{}", step, value);
            }
        }
        if let Err(e) = super::atomic_rewrite(&self.batch_file, &contents) {
            log::error!("Failed to stage the previous batch: {}", e);
        }
    }

    fn save_insert_log(&self) {
        let mut contents = String::new();
        for (step, values) in &self.inserted {
            for value in values {
                let _ = writeln!(contents, "{},{}", step, value);
            }
        }
        if let Err(e) = super::atomic_rewrite(&self.insert_log, &contents) {
            log::error!("Failed to rewrite the insert log: {}", e);
        }
    }

    fn save_request_log(&self) {
        let mut contents = String::new();
        for (sender, req_id) in &self.last_seen {
            let _ = writeln!(contents, "{},{}", sender, req_id);
        }
        if let Err(e) = super::atomic_rewrite(&self.request_log, &contents) {
            log::error!("Failed to rewrite the request log: {}", e);
        }
    }
}

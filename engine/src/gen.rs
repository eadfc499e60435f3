/*
 * Created on Fri Mar 15 2024
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

//! # The workload generator
//!
//! Fabricates the leader's inputs for a run: one integer partition per
//! worker and a random (but well-formed) schedule. Everything is drawn from
//! a seeded rng, so a run is reproducible from its configuration alone. An
//! explicit `[workload]` section in the config file bypasses the generator
//! entirely.

use crate::ops::{Op, Schedule, Step};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The leader's inputs: per-worker partitions plus the schedule every
/// worker runs
#[derive(Debug, Clone)]
pub struct Workload {
    pub partitions: Vec<Vec<i32>>,
    pub schedule: Schedule,
}

impl Workload {
    /// Structural sanity: one partition per worker and a valid schedule
    pub fn validate(&self, workers: usize) -> Result<(), String> {
        if self.partitions.len() != workers {
            return Err(format!(
                "{} partitions for {} workers",
                self.partitions.len(),
                workers
            ));
        }
        self.schedule.validate()
    }
    pub fn total_records(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }
    /// The full input multiset, for the reference computation
    pub fn all_values(&self) -> Vec<i32> {
        self.partitions.iter().flatten().copied().collect()
    }
}

/// Generator bounds; the defaults match the workloads the engine was
/// calibrated against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenParams {
    pub partition_min: usize,
    pub partition_max: usize,
    pub value_max: i32,
    pub schedule_min: usize,
    pub schedule_max: usize,
}

impl Default for GenParams {
    fn default() -> Self {
        Self {
            partition_min: 90,
            partition_max: 95,
            value_max: 100,
            schedule_min: 8,
            schedule_max: 20,
        }
    }
}

/// How many filters a schedule of this length may carry; unbounded
/// filtering empties every pipeline and makes runs degenerate
fn max_filters(schedule_len: usize) -> usize {
    if schedule_len <= 10 {
        2
    } else if schedule_len <= 15 {
        3
    } else if schedule_len <= 20 {
        4
    } else {
        5
    }
}

const OPERATIONS: [Op; 10] = [
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Gt,
    Op::Lt,
    Op::Ge,
    Op::Le,
    Op::ChangeKey,
    Op::Reduce,
];

/// Generate a reproducible workload for `workers` workers
pub fn generate(workers: usize, params: &GenParams, seed: u64) -> Workload {
    let mut rng = StdRng::seed_from_u64(seed);
    let partitions = (0..workers)
        .map(|_| {
            let len = rng.gen_range(params.partition_min..=params.partition_max);
            (0..len).map(|_| rng.gen_range(1..=params.value_max)).collect()
        })
        .collect();
    let schedule = generate_schedule(&mut rng, params);
    Workload {
        partitions,
        schedule,
    }
}

fn generate_schedule(rng: &mut StdRng, params: &GenParams) -> Schedule {
    let len = rng.gen_range(params.schedule_min..=params.schedule_max);
    let mut filter_budget = max_filters(len);
    let mut reduce_rejected = false;
    let mut steps = Vec::with_capacity(len);
    for idx in 0..len {
        let op = loop {
            let candidate = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
            if candidate == Op::Reduce && idx != len - 1 {
                reduce_rejected = true;
                continue;
            }
            if candidate.class() == crate::ops::OpClass::Filter && filter_budget == 0 {
                continue;
            }
            break candidate;
        };
        if op.class() == crate::ops::OpClass::Filter {
            filter_budget -= 1;
        }
        let param = match op {
            // lenient upper filters, strict lower ones: keeps a healthy
            // share of records flowing
            Op::Lt | Op::Le => rng.gen_range(60..=100),
            Op::Gt | Op::Ge => rng.gen_range(0..=40),
            Op::ChangeKey | Op::Reduce => 0,
            _ => rng.gen_range(1..=10),
        };
        steps.push(Step { op, param });
    }
    // a reduce the dice refused mid-schedule still ends the pipeline
    if reduce_rejected {
        let last = steps.len() - 1;
        steps[last] = Step {
            op: Op::Reduce,
            param: 0,
        };
    }
    Schedule::new(steps)
}

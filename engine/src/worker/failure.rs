/*
 * Created on Thu Feb 15 2024
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

//! Simulated crash injection. The executor samples the injector before
//! every per-record step (with extra weight before a reduce fold); a `true`
//! sends the worker into the `Failed` state. The sample counter spans
//! restarts, which is what lets a scripted plan target "the n-th step the
//! worker ever takes" no matter how many crashes happened before it.

use rand::rngs::StdRng;
use rand::Rng;

/// How crashes are decided
#[derive(Debug, Clone, PartialEq)]
pub enum FailurePlan {
    /// Never crash
    Disabled,
    /// Crash with this probability at every sampling point
    Random { probability: f64 },
    /// Crash exactly at these sampling points (0-based, lifetime-global)
    Scripted { crash_points: Vec<u64> },
}

#[derive(Debug)]
pub struct FailureSampler {
    plan: FailurePlan,
    samples: u64,
}

impl FailureSampler {
    pub fn new(plan: FailurePlan) -> Self {
        Self { plan, samples: 0 }
    }

    /// Sample one crash decision. `weight` scales the probability for
    /// heavier sampling points (reduce folds).
    pub fn should_fail(&mut self, rng: &mut StdRng, weight: f64) -> bool {
        let tick = self.samples;
        self.samples += 1;
        match &self.plan {
            FailurePlan::Disabled => false,
            FailurePlan::Random { probability } => {
                let p = (probability * weight).clamp(0.0, 1.0);
                p > 0.0 && rng.gen_bool(p)
            }
            FailurePlan::Scripted { crash_points } => crash_points.contains(&tick),
        }
    }
}

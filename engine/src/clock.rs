/*
 * Created on Mon Jan 29 2024
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

//! # Clock and self-scheduling
//!
//! Actors progress on two kinds of events: mailbox deliveries and tagged
//! self-scheduled timers. This module provides the minimal scheduling
//! surface an actor needs: `now`, arm/cancel a tagged timer, and an awaitable
//! that resolves when the earliest armed timer expires. Time goes through
//! tokio's clock, so tests on a paused runtime run entirely in virtual time.
//!
//! Execution delays are drawn from per-operator-class log-normal
//! distributions; the parameters are configuration, not contract.

use crate::ops::OpClass;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, LogNormal};
use std::time::Duration;
use tokio::time::Instant;

/// A point in simulated time
pub type SimInstant = Instant;

pub fn now() -> SimInstant {
    Instant::now()
}

/// A log-normal delay distribution (`mu`/`sigma` of the underlying normal,
/// in seconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayProfile {
    pub mu: f64,
    pub sigma: f64,
}

impl DelayProfile {
    pub const fn new(mu: f64, sigma: f64) -> Self {
        Self { mu, sigma }
    }
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        let secs = if self.sigma > 0.0 {
            match LogNormal::new(self.mu, self.sigma) {
                Ok(dist) => dist.sample(rng),
                Err(_) => self.mu.exp(),
            }
        } else {
            // degenerate distribution; keep the rng stream moving so a
            // sigma tweak does not reshuffle unrelated draws
            let _: f64 = rng.gen();
            self.mu.exp()
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// The per-event delay distributions of one simulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delays {
    pub map: DelayProfile,
    pub filter: DelayProfile,
    pub change_key: DelayProfile,
    pub reduce: DelayProfile,
    /// drain delay after a termination re-check order
    pub finish: DelayProfile,
    /// worker-side delay before echoing a ping
    pub ping_reply: DelayProfile,
    /// cold-start delay after a restart
    pub restart: DelayProfile,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            map: DelayProfile::new(0.0001, 0.0003),
            filter: DelayProfile::new(0.0001, 0.0003),
            change_key: DelayProfile::new(0.0005, 0.0005),
            reduce: DelayProfile::new(0.02, 0.01),
            finish: DelayProfile::new(0.02, 0.02),
            ping_reply: DelayProfile::new(0.0, 0.01),
            restart: DelayProfile::new(0.5, 0.02),
        }
    }
}

impl Delays {
    pub fn for_class(&self, class: OpClass) -> DelayProfile {
        match class {
            OpClass::Map => self.map,
            OpClass::Filter => self.filter,
            OpClass::ChangeKey => self.change_key,
            OpClass::Reduce => self.reduce,
        }
    }
}

/// A small set of tagged, cancellable one-shot timers. Arming an
/// already-armed tag replaces its deadline; at most one deadline per tag.
/// Actors poll [`expired`] inside their event loop.
#[derive(Debug)]
pub struct TimerWheel<T> {
    slots: Vec<(T, SimInstant)>,
}

impl<T: Copy + PartialEq> TimerWheel<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }
    pub fn arm(&mut self, tag: T, after: Duration) {
        self.arm_at(tag, now() + after);
    }
    pub fn arm_at(&mut self, tag: T, deadline: SimInstant) {
        self.cancel(tag);
        self.slots.push((tag, deadline));
    }
    pub fn cancel(&mut self, tag: T) {
        self.slots.retain(|(t, _)| *t != tag);
    }
    pub fn clear(&mut self) {
        self.slots.clear();
    }
    pub fn is_armed(&self, tag: T) -> bool {
        self.slots.iter().any(|(t, _)| *t == tag)
    }
    /// The earliest armed timer, if any
    pub fn next_deadline(&self) -> Option<(T, SimInstant)> {
        self.slots
            .iter()
            .min_by_key(|(_, deadline)| *deadline)
            .copied()
    }
}

/// Resolve with the tag of the earliest armed timer once it expires; pend
/// forever when the wheel is empty. The caller owns removal of the fired
/// tag (the select loop cancels it before dispatching).
pub async fn expired<T: Copy + PartialEq>(wheel: &TimerWheel<T>) -> T {
    match wheel.next_deadline() {
        Some((tag, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            tag
        }
        None => std::future::pending().await,
    }
}

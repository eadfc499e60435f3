/*
 * Created on Wed Jan 24 2024
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

//! # The operator kernel
//!
//! The schedule is a linear program of operators; this module is the single
//! place where operator semantics live. Both the worker executors and the
//! leader's reference computation go through [`apply_step`] (and
//! [`reference_pipeline`], which is built on the same arithmetic), so the
//! two can never disagree on what an operator means.
//!
//! All arithmetic is wrapping 32-bit. A division by zero drops the record:
//! the schedule generator never emits zero divisors, so hitting one means a
//! hand-written workload asked for it.

use crate::wire::WorkerId;

/// A pipeline operator. `Reduce` may only appear as the final step of a
/// schedule and `ChangeKey` carries no parameter; both invariants are
/// enforced by [`Schedule::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Le,
    Ge,
    ChangeKey,
    Reduce,
}

/// The broad operator class, used to pick execution-delay distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Map,
    Filter,
    ChangeKey,
    Reduce,
}

impl Op {
    pub fn parse(raw: &str) -> Option<Self> {
        let op = match raw {
            "add" => Self::Add,
            "sub" => Self::Sub,
            "mul" => Self::Mul,
            "div" => Self::Div,
            "lt" => Self::Lt,
            "gt" => Self::Gt,
            "le" => Self::Le,
            "ge" => Self::Ge,
            "changekey" => Self::ChangeKey,
            "reduce" => Self::Reduce,
            _ => return None,
        };
        Some(op)
    }
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Ge => "ge",
            Self::ChangeKey => "changekey",
            Self::Reduce => "reduce",
        }
    }
    pub const fn class(&self) -> OpClass {
        match self {
            Self::Add | Self::Sub | Self::Mul | Self::Div => OpClass::Map,
            Self::Lt | Self::Gt | Self::Le | Self::Ge => OpClass::Filter,
            Self::ChangeKey => OpClass::ChangeKey,
            Self::Reduce => OpClass::Reduce,
        }
    }
}

/// One schedule step: an operator and its parameter. The parameter is
/// meaningless for `changekey` and `reduce` (kept as 0 on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub op: Op,
    pub param: i32,
}

/// The full schedule, identical on every worker
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schedule {
    steps: Vec<Step>,
}

impl Schedule {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }
    pub fn len(&self) -> usize {
        self.steps.len()
    }
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
    pub fn step(&self, idx: usize) -> Step {
        self.steps[idx]
    }
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
    /// Does the pipeline end with a reduce?
    pub fn reduce_last(&self) -> bool {
        matches!(self.steps.last(), Some(Step { op: Op::Reduce, .. }))
    }
    /// Check the structural invariants: non-empty, `reduce` nowhere but the
    /// final step, no zero divisor parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("schedule is empty".to_owned());
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.op == Op::Reduce && idx != self.steps.len() - 1 {
                return Err(format!("reduce at step {idx} is not the final step"));
            }
            if step.op == Op::Div && step.param == 0 {
                return Err(format!("zero divisor at step {idx}"));
            }
        }
        Ok(())
    }
}

/// What the kernel decided for one record at one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The record survives with this value
    Keep(i32),
    /// The record is filtered out (or hit an arithmetic error)
    Drop,
    /// The record must be handed off to another worker
    Handoff { dest: WorkerId, value: i32 },
}

/// The change-key modulus: `ceil(1/p) * W`. Every worker computes the same
/// value from configuration, which is what makes re-execution after a crash
/// propose the same owners
pub fn change_key_modulus(probability: f64, workers: usize) -> i32 {
    ((1.0 / probability).ceil() as i32) * workers as i32
}

/// Deterministically propose a new owner for `value`, or `None` when the
/// proposal is out of range or points back at the proposer
pub fn change_key_owner(
    value: i32,
    me: WorkerId,
    workers: usize,
    modulus: i32,
) -> Option<WorkerId> {
    let owner = value.rem_euclid(modulus);
    if owner < 0 || owner >= workers as i32 || owner as usize == me {
        return None;
    }
    Some(owner as usize)
}

/// Apply one non-reduce step to one record. `Reduce` is a whole-batch fold
/// and is handled by the executor; it never reaches this function.
pub fn apply_step(
    step: Step,
    value: i32,
    me: WorkerId,
    workers: usize,
    ck_modulus: i32,
) -> StepOutcome {
    match step.op {
        Op::Add => StepOutcome::Keep(value.wrapping_add(step.param)),
        Op::Sub => StepOutcome::Keep(value.wrapping_sub(step.param)),
        Op::Mul => StepOutcome::Keep(value.wrapping_mul(step.param)),
        Op::Div => match value.checked_div(step.param) {
            Some(v) => StepOutcome::Keep(v),
            None => {
                log::warn!("Dropping record {}: division error", value);
                StepOutcome::Drop
            }
        },
        Op::Lt => keep_if(value < step.param, value),
        Op::Gt => keep_if(value > step.param, value),
        Op::Le => keep_if(value <= step.param, value),
        Op::Ge => keep_if(value >= step.param, value),
        Op::ChangeKey => match change_key_owner(value, me, workers, ck_modulus) {
            Some(dest) => StepOutcome::Handoff { dest, value },
            None => StepOutcome::Keep(value),
        },
        Op::Reduce => {
            debug_assert!(false, "reduce reached the per-record kernel");
            StepOutcome::Keep(value)
        }
    }
}

fn keep_if(cond: bool, value: i32) -> StepOutcome {
    if cond {
        StepOutcome::Keep(value)
    } else {
        StepOutcome::Drop
    }
}

/// Fold one batch for the final reduce step
pub fn reduce_batch(values: impl IntoIterator<Item = i32>) -> i32 {
    values.into_iter().fold(0i32, |acc, v| acc.wrapping_add(v))
}

/// Replay the schedule over the full input multiset, ignoring `changekey`
/// (it moves records between workers without touching their values). This
/// is the leader-side reference used to verdict a finished run.
pub fn reference_pipeline(input: &[i32], schedule: &Schedule) -> Vec<i32> {
    let mut data: Vec<i32> = input.to_vec();
    for step in schedule.steps() {
        match step.op {
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                data = data
                    .into_iter()
                    .filter_map(|v| match apply_step(*step, v, 0, 1, 1) {
                        StepOutcome::Keep(v) => Some(v),
                        _ => None,
                    })
                    .collect();
            }
            Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                data.retain(|v| {
                    matches!(apply_step(*step, *v, 0, 1, 1), StepOutcome::Keep(_))
                });
            }
            Op::ChangeKey => {}
            Op::Reduce => {
                let total = reduce_batch(data);
                return vec![total];
            }
        }
    }
    data
}

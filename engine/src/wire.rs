/*
 * Created on Thu Jan 25 2024
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

//! # Wire messages
//!
//! The typed envelopes exchanged between the leader and the workers, and
//! between workers. Frames travel over in-process mailbox links, so no byte
//! serialization is involved; what matters is the field semantics.

use crate::ops::Schedule;

/// A stable worker identity in `[0, W)`
pub type WorkerId = usize;

/// The identity of an actor on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    Leader,
    Worker(WorkerId),
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Worker(id) => write!(f, "worker {}", id),
        }
    }
}

/// A change-key insertion (or its acknowledgement when `ack` is set).
/// `req_id` is drawn from the sender's durable monotonic counter; together
/// with the sender identity it names the handoff for deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInsert {
    pub dest: WorkerId,
    pub req_id: u32,
    pub schedule_step: usize,
    pub value: i32,
    pub ack: bool,
}

/// The partial result a worker reports during termination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialResult {
    /// Running reduce total (reduce-terminated schedules)
    Reduce(i32),
    /// Surviving records (all other schedules)
    Records(Vec<i32>),
}

/// Every message that can cross an actor boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// leader -> worker: identity and initial partition
    Setup { assigned_id: WorkerId, data: Vec<i32> },
    /// leader -> worker: the operator pipeline
    Schedule { schedule: Schedule },
    /// leader -> worker: restart a (presumed) crashed worker, replaying the
    /// schedule its volatile memory lost
    Restart { worker: WorkerId, schedule: Schedule },
    /// leader -> worker: the run is over
    FinishSim,
    /// leader -> worker heartbeat probe; worker -> leader echo
    Ping { worker: WorkerId },
    /// worker -> leader: local data and buffered change-keys are drained;
    /// leader -> worker: re-check order during termination
    FinishLocalElaboration {
        worker: WorkerId,
        change_key_sent: u32,
        change_key_received: u32,
    },
    /// worker -> leader: fresh counters (and the partial result) after a
    /// re-check order
    CheckChangeKeyAck {
        worker: WorkerId,
        partial: PartialResult,
        change_key_sent: u32,
        change_key_received: u32,
    },
    /// worker <-> worker: change-key insertion and its acknowledgement
    DataInsert(DataInsert),
}

/// A frame stamped with its transport-level sender. Receivers use the stamp
/// to identify the peer (request deduplication, acknowledgement routing).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub frame: Frame,
}

/*
 * Created on Tue Jan 30 2024
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

//! # The mailbox mesh
//!
//! Every actor owns exactly one mailbox; the mesh is the bundle of sending
//! ends. Links are FIFO and reliable (message loss towards a crashed worker
//! happens at the receiver, which refuses everything but `Restart`). A
//! [`Post`] is an actor's sending handle: it stamps outgoing frames with the
//! actor's identity so receivers know the peer without any addressing in the
//! frame itself.

use crate::wire::{Envelope, Frame, NodeId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The receiving end owned by one actor
pub type Mailbox = mpsc::UnboundedReceiver<Envelope>;

/// The bundle of sending ends for one simulation
#[derive(Debug)]
pub struct Mesh {
    leader: mpsc::UnboundedSender<Envelope>,
    workers: Vec<mpsc::UnboundedSender<Envelope>>,
}

impl Mesh {
    /// Build the mesh for `workers` workers plus the leader. Returns the
    /// shared sending bundle, the leader's mailbox and one mailbox per
    /// worker (index = worker id).
    pub fn build(workers: usize) -> (Arc<Self>, Mailbox, Vec<Mailbox>) {
        let (leader_tx, leader_rx) = mpsc::unbounded_channel();
        let mut worker_txs = Vec::with_capacity(workers);
        let mut worker_rxs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            worker_txs.push(tx);
            worker_rxs.push(rx);
        }
        let mesh = Arc::new(Self {
            leader: leader_tx,
            workers: worker_txs,
        });
        (mesh, leader_rx, worker_rxs)
    }

    fn sender(&self, to: NodeId) -> Option<&mpsc::UnboundedSender<Envelope>> {
        match to {
            NodeId::Leader => Some(&self.leader),
            NodeId::Worker(id) => self.workers.get(id),
        }
    }
}

/// An actor's stamped sending handle
#[derive(Debug, Clone)]
pub struct Post {
    me: NodeId,
    mesh: Arc<Mesh>,
}

impl Post {
    pub fn new(me: NodeId, mesh: Arc<Mesh>) -> Self {
        Self { me, mesh }
    }
    /// Deliver `frame` to `to`. Delivery to a torn-down mailbox is a no-op:
    /// the run is over and the frame no longer matters.
    pub fn send(&self, to: NodeId, frame: Frame) {
        let Some(sender) = self.mesh.sender(to) else {
            log::error!("{}: no link to {}", self.me, to);
            return;
        };
        if sender
            .send(Envelope {
                from: self.me,
                frame,
            })
            .is_err()
        {
            log::debug!("{}: link to {} is closed", self.me, to);
        }
    }
}

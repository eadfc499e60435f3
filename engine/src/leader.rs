/*
 * Created on Mon Mar 04 2024
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

//! # The leader
//!
//! One leader coordinates the whole run: it distributes the partitions and
//! the schedule, beats a heartbeat over every worker (a silent worker is
//! declared dead and restarted with a replay of the schedule its volatile
//! memory lost), and decides termination.
//!
//! Termination is two-phase because "every worker drained its local data"
//! is necessary but not sufficient: change-key records can still be in
//! flight. Once all W finish notices are in, the leader orders everyone to
//! re-check; the workers drain whatever arrived since and answer with their
//! conservation counters. Only when `sum(sent) = sum(received)`, meaning no
//! handoff is in flight anywhere, does the leader broadcast `FinishSim`.
//! Otherwise it loops, re-issuing the order until the counters agree.

use crate::clock::{self, SimInstant, TimerWheel};
use crate::gen::Workload;
use crate::net::{Mailbox, Post};
use crate::ops;
use crate::storage;
use crate::wire::{Envelope, Frame, NodeId, PartialResult, WorkerId};
use crate::error::{Error, RillResult};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderTimer {
    /// broadcast pings
    PingTick,
    /// inspect who answered and restart the silent
    PingCheck,
}

#[derive(Debug, Clone)]
pub struct LeaderCfg {
    pub workers: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub data_root: PathBuf,
}

/// The verdict and statistics of one finished run
#[derive(Debug, Clone)]
pub struct SimReport {
    pub correct: bool,
    /// the reference result (a single total for reduce pipelines, the
    /// sorted surviving records otherwise)
    pub expected: Vec<i32>,
    /// what the workers actually produced
    pub actual: Vec<i32>,
    pub change_key_sent: u32,
    pub change_key_received: u32,
    pub restarts: u32,
    pub recheck_rounds: u32,
    pub duration: Duration,
}

pub struct Leader {
    inbox: Mailbox,
    post: Post,
    cfg: LeaderCfg,
    workload: Workload,
    reduce_last: bool,
    timers: TimerWheel<LeaderTimer>,
    pinged: Vec<bool>,
    finished: Vec<bool>,
    ck_checked: Vec<bool>,
    ck_sent: Vec<u32>,
    ck_received: Vec<u32>,
    results: Vec<Vec<i32>>,
    /// the re-check order has been broadcast at least once
    order_broadcast: bool,
    stop_ping: bool,
    restarts: u32,
    recheck_rounds: u32,
    started: SimInstant,
    outcome: Option<SimReport>,
}

enum Tick {
    Frame(Envelope),
    Timer(LeaderTimer),
    Closed,
}

impl Leader {
    pub fn new(inbox: Mailbox, post: Post, cfg: LeaderCfg, workload: Workload) -> Self {
        let workers = cfg.workers;
        let reduce_last = workload.schedule.reduce_last();
        Self {
            inbox,
            post,
            cfg,
            workload,
            reduce_last,
            timers: TimerWheel::new(),
            pinged: vec![false; workers],
            finished: vec![false; workers],
            ck_checked: vec![false; workers],
            ck_sent: vec![0; workers],
            ck_received: vec![0; workers],
            results: vec![Vec::new(); workers],
            order_broadcast: false,
            stop_ping: false,
            restarts: 0,
            recheck_rounds: 0,
            started: clock::now(),
            outcome: None,
        }
    }

    /// Drive the run to its verdict
    pub async fn run(mut self) -> RillResult<SimReport> {
        self.setup()?;
        loop {
            let tick = tokio::select! {
                maybe = self.inbox.recv() => match maybe {
                    Some(env) => Tick::Frame(env),
                    None => Tick::Closed,
                },
                tag = clock::expired(&self.timers) => Tick::Timer(tag),
            };
            match tick {
                Tick::Frame(env) => self.handle_frame(env),
                Tick::Timer(tag) => {
                    self.timers.cancel(tag);
                    self.on_timer(tag);
                }
                Tick::Closed => {
                    return Err(Error::SimError(
                        "the mesh was torn down mid-run".to_owned(),
                    ));
                }
            }
            if let Some(report) = self.outcome.take() {
                return Ok(report);
            }
        }
    }

    /// Purge and recreate the durable tree, hand out partitions and the
    /// schedule, and start the heartbeat
    fn setup(&mut self) -> RillResult<()> {
        storage::purge_tree(&self.cfg.data_root)
            .map_err(|e| Error::ioerror_extra(e, "purging the data root"))?;
        storage::create_tree(&self.cfg.data_root, self.cfg.workers)
            .map_err(|e| Error::ioerror_extra(e, "creating the data root"))?;
        self.started = clock::now();
        for (id, partition) in self.workload.partitions.iter().enumerate() {
            self.post.send(
                NodeId::Worker(id),
                Frame::Setup {
                    assigned_id: id,
                    data: partition.clone(),
                },
            );
        }
        for id in 0..self.cfg.workers {
            self.post.send(
                NodeId::Worker(id),
                Frame::Schedule {
                    schedule: self.workload.schedule.clone(),
                },
            );
        }
        log::info!(
            "Leader: {} workers set up, schedule [{}]",
            self.cfg.workers,
            self.workload
                .schedule
                .steps()
                .iter()
                .map(|s| format!("{} {}", s.op.as_str(), s.param))
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.timers.arm(LeaderTimer::PingTick, self.cfg.ping_interval);
        self.timers.arm(
            LeaderTimer::PingCheck,
            self.cfg.ping_interval + self.cfg.ping_timeout,
        );
        Ok(())
    }

    fn handle_frame(&mut self, env: Envelope) {
        let NodeId::Worker(worker) = env.from else {
            return;
        };
        match env.frame {
            Frame::Ping { .. } => {
                if let Some(slot) = self.pinged.get_mut(worker) {
                    *slot = true;
                }
            }
            Frame::FinishLocalElaboration {
                worker,
                change_key_sent,
                change_key_received,
            } => self.handle_finish_notice(worker, change_key_sent, change_key_received),
            Frame::CheckChangeKeyAck {
                worker,
                partial,
                change_key_sent,
                change_key_received,
            } => self.handle_check_ack(worker, partial, change_key_sent, change_key_received),
            _ => log::warn!("Leader: unexpected frame from worker {}", worker),
        }
    }

    fn on_timer(&mut self, tag: LeaderTimer) {
        match tag {
            LeaderTimer::PingTick => self.send_pings(),
            LeaderTimer::PingCheck => self.check_pings(),
        }
    }

    /// A worker drained its local partition and its buffered change-keys.
    /// Once every worker has said so, order the quiescence re-check; a
    /// notice arriving after the broadcast (a restarted worker reporting
    /// again) gets the order immediately so reconciliation cannot stall.
    fn handle_finish_notice(&mut self, worker: WorkerId, sent: u32, received: u32) {
        if worker >= self.cfg.workers {
            return;
        }
        self.finished[worker] = true;
        self.ck_sent[worker] = sent;
        self.ck_received[worker] = received;
        log::info!(
            "Leader: worker {} finished local elaboration ({}/{} workers)",
            worker,
            self.finished.iter().filter(|f| **f).count(),
            self.cfg.workers
        );
        if !self.finished.iter().all(|f| *f) {
            return;
        }
        if !self.order_broadcast {
            self.order_broadcast = true;
            for slot in self.ck_checked.iter_mut() {
                *slot = false;
            }
            self.broadcast_check_order();
        } else {
            self.ck_checked[worker] = false;
            self.send_check_order(worker);
        }
    }

    /// A worker's answer to the re-check order: fresh counters and its
    /// partial result. With all answers in, quiescence is decided by
    /// conservation: every acknowledged handoff must have been accepted
    /// somewhere.
    fn handle_check_ack(
        &mut self,
        worker: WorkerId,
        partial: PartialResult,
        sent: u32,
        received: u32,
    ) {
        if worker >= self.cfg.workers {
            return;
        }
        self.ck_sent[worker] = sent;
        self.ck_received[worker] = received;
        self.results[worker] = match partial {
            PartialResult::Reduce(total) => vec![total],
            PartialResult::Records(records) => records,
        };
        self.ck_checked[worker] = true;
        if !(self.finished.iter().all(|f| *f) && self.ck_checked.iter().all(|c| *c)) {
            return;
        }
        let total_sent: u64 = self.ck_sent.iter().map(|&v| v as u64).sum();
        let total_received: u64 = self.ck_received.iter().map(|&v| v as u64).sum();
        if total_sent != total_received {
            log::info!(
                "Leader: change-keys still in flight (sent {}, received {}); rechecking",
                total_sent,
                total_received
            );
            self.recheck_rounds += 1;
            for slot in self.ck_checked.iter_mut() {
                *slot = false;
            }
            self.broadcast_check_order();
            return;
        }
        self.finish(total_sent as u32, total_received as u32);
    }

    fn broadcast_check_order(&self) {
        for id in 0..self.cfg.workers {
            self.send_check_order(id);
        }
    }

    fn send_check_order(&self, worker: WorkerId) {
        self.post.send(
            NodeId::Worker(worker),
            Frame::FinishLocalElaboration {
                worker,
                change_key_sent: 0,
                change_key_received: 0,
            },
        );
    }

    /// Quiescence reached: stop the heartbeat, tell everyone, compute the
    /// verdict against the reference pipeline
    fn finish(&mut self, sent: u32, received: u32) {
        self.stop_ping = true;
        self.timers.clear();
        for id in 0..self.cfg.workers {
            self.post.send(NodeId::Worker(id), Frame::FinishSim);
        }
        let all_values = self.workload.all_values();
        let mut expected = ops::reference_pipeline(&all_values, &self.workload.schedule);
        let mut actual = if self.reduce_last {
            vec![self
                .results
                .iter()
                .map(|r| r.first().copied().unwrap_or(0))
                .fold(0i32, |acc, v| acc.wrapping_add(v))]
        } else {
            self.results.iter().flatten().copied().collect()
        };
        if !self.reduce_last {
            expected.sort_unstable();
            actual.sort_unstable();
        }
        let correct = expected == actual;
        if correct {
            log::info!("Leader: run finished, result matches the reference");
        } else {
            log::error!(
                "Leader: run finished with a WRONG result (expected {:?}, got {:?})",
                expected,
                actual
            );
        }
        self.outcome = Some(SimReport {
            correct,
            expected,
            actual,
            change_key_sent: sent,
            change_key_received: received,
            restarts: self.restarts,
            recheck_rounds: self.recheck_rounds,
            duration: clock::now() - self.started,
        });
    }

    fn send_pings(&mut self) {
        if self.stop_ping {
            return;
        }
        for id in 0..self.cfg.workers {
            self.post.send(NodeId::Worker(id), Frame::Ping { worker: id });
        }
    }

    /// Anyone silent since the last broadcast is presumed crashed and gets
    /// a `Restart` carrying the schedule replay
    fn check_pings(&mut self) {
        if self.stop_ping {
            return;
        }
        for id in 0..self.cfg.workers {
            if !self.pinged[id] {
                log::warn!("Leader: worker {} is dead, restarting it", id);
                self.restarts += 1;
                self.post.send(
                    NodeId::Worker(id),
                    Frame::Restart {
                        worker: id,
                        schedule: self.workload.schedule.clone(),
                    },
                );
            }
            self.pinged[id] = false;
        }
        self.timers.arm(LeaderTimer::PingTick, self.cfg.ping_interval);
        self.timers.arm(
            LeaderTimer::PingCheck,
            self.cfg.ping_interval + self.cfg.ping_timeout,
        );
    }

    #[cfg(test)]
    fn schedule(&self) -> &ops::Schedule {
        &self.workload.schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Mesh;
    use crate::ops::{Op, Schedule, Step};
    use crate::storage::testutil::scratch_root;
    use crate::wire::DataInsert;
    use std::sync::Arc;

    struct Rig {
        leader: Leader,
        worker_rx: Vec<Mailbox>,
        _mesh: Arc<Mesh>,
        root: PathBuf,
    }

    fn schedule(steps: &[(Op, i32)]) -> Schedule {
        Schedule::new(steps.iter().map(|&(op, param)| Step { op, param }).collect())
    }

    fn rig(label: &str, partitions: Vec<Vec<i32>>, steps: &[(Op, i32)]) -> Rig {
        let root = scratch_root(label);
        let workers = partitions.len();
        let (mesh, leader_rx, worker_rxs) = Mesh::build(workers);
        let cfg = LeaderCfg {
            workers,
            ping_interval: Duration::from_millis(2500),
            ping_timeout: Duration::from_millis(2000),
            data_root: root.clone(),
        };
        let workload = Workload {
            partitions,
            schedule: schedule(steps),
        };
        let leader = Leader::new(leader_rx, Post::new(NodeId::Leader, mesh.clone()), cfg, workload);
        Rig {
            leader,
            worker_rx: worker_rxs,
            _mesh: mesh,
            root,
        }
    }

    fn deliver(l: &mut Leader, from: WorkerId, frame: Frame) {
        l.handle_frame(Envelope {
            from: NodeId::Worker(from),
            frame,
        });
    }

    fn drain_frames(rx: &mut Mailbox) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(env) = rx.try_recv() {
            frames.push(env.frame);
        }
        frames
    }

    fn notice(worker: WorkerId, sent: u32, received: u32) -> Frame {
        Frame::FinishLocalElaboration {
            worker,
            change_key_sent: sent,
            change_key_received: received,
        }
    }

    fn ack(worker: WorkerId, partial: i32, sent: u32, received: u32) -> Frame {
        Frame::CheckChangeKeyAck {
            worker,
            partial: PartialResult::Reduce(partial),
            change_key_sent: sent,
            change_key_received: received,
        }
    }

    #[test]
    fn test_setup_distributes_partitions_and_schedule() {
        let mut r = rig("ld-setup", vec![vec![1, 2], vec![3]], &[(Op::Add, 1), (Op::Reduce, 0)]);
        r.leader.setup().unwrap();
        for (id, rx) in r.worker_rx.iter_mut().enumerate() {
            let frames = drain_frames(rx);
            assert!(matches!(&frames[0], Frame::Setup { assigned_id, .. } if *assigned_id == id));
            assert!(matches!(&frames[1], Frame::Schedule { .. }));
        }
        assert!(r.leader.timers.is_armed(LeaderTimer::PingTick));
        assert!(r.leader.timers.is_armed(LeaderTimer::PingCheck));
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_order_only_after_every_notice() {
        let mut r = rig("ld-order", vec![vec![1], vec![2]], &[(Op::Add, 0), (Op::Reduce, 0)]);
        deliver(&mut r.leader, 0, notice(0, 0, 0));
        assert!(drain_frames(&mut r.worker_rx[0]).is_empty());
        deliver(&mut r.leader, 1, notice(1, 0, 0));
        // now both workers get the re-check order
        for rx in r.worker_rx.iter_mut() {
            let frames = drain_frames(rx);
            assert!(frames
                .iter()
                .any(|f| matches!(f, Frame::FinishLocalElaboration { .. })));
        }
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_termination_loops_until_counters_match() {
        // S6: one in-flight change-key keeps the leader looping
        let mut r = rig("ld-s6", vec![vec![1], vec![2]], &[(Op::Add, 0), (Op::Reduce, 0)]);
        deliver(&mut r.leader, 0, notice(0, 3, 0));
        deliver(&mut r.leader, 1, notice(1, 0, 2));
        for rx in r.worker_rx.iter_mut() {
            drain_frames(rx);
        }
        // round 1: 3 sent vs 2 received -> keep going
        deliver(&mut r.leader, 0, ack(0, 1, 3, 0));
        deliver(&mut r.leader, 1, ack(1, 2, 0, 2));
        assert!(r.leader.outcome.is_none());
        assert_eq!(r.leader.recheck_rounds, 1);
        for rx in r.worker_rx.iter_mut() {
            let frames = drain_frames(rx);
            assert!(frames
                .iter()
                .any(|f| matches!(f, Frame::FinishLocalElaboration { .. })));
            assert!(!frames.iter().any(|f| matches!(f, Frame::FinishSim)));
        }
        // round 2: the straggler was delivered; 3 == 3 -> FinishSim
        deliver(&mut r.leader, 0, ack(0, 1, 3, 0));
        deliver(&mut r.leader, 1, ack(1, 2, 0, 3));
        let report = r.leader.outcome.take().expect("run must be over");
        assert_eq!(report.change_key_sent, 3);
        assert_eq!(report.change_key_received, 3);
        assert_eq!(report.actual, vec![3]);
        assert_eq!(report.expected, vec![3]);
        assert!(report.correct);
        for rx in r.worker_rx.iter_mut() {
            let frames = drain_frames(rx);
            assert!(frames.iter().any(|f| matches!(f, Frame::FinishSim)));
        }
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_late_notice_gets_an_immediate_order() {
        let mut r = rig("ld-late", vec![vec![1], vec![2]], &[(Op::Add, 0), (Op::Reduce, 0)]);
        deliver(&mut r.leader, 0, notice(0, 0, 0));
        deliver(&mut r.leader, 1, notice(1, 0, 0));
        for rx in r.worker_rx.iter_mut() {
            drain_frames(rx);
        }
        // worker 1 restarted and reported again after the broadcast
        deliver(&mut r.leader, 1, notice(1, 0, 0));
        assert!(drain_frames(&mut r.worker_rx[1])
            .iter()
            .any(|f| matches!(f, Frame::FinishLocalElaboration { .. })));
        assert!(drain_frames(&mut r.worker_rx[0]).is_empty());
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_silent_workers_are_restarted_with_the_schedule() {
        let mut r = rig("ld-restart", vec![vec![1], vec![2]], &[(Op::Add, 0), (Op::Reduce, 0)]);
        r.leader.send_pings();
        deliver(&mut r.leader, 0, Frame::Ping { worker: 0 });
        for rx in r.worker_rx.iter_mut() {
            drain_frames(rx);
        }
        r.leader.check_pings();
        assert!(drain_frames(&mut r.worker_rx[0])
            .iter()
            .all(|f| !matches!(f, Frame::Restart { .. })));
        let frames = drain_frames(&mut r.worker_rx[1]);
        let restart = frames
            .iter()
            .find(|f| matches!(f, Frame::Restart { .. }))
            .expect("silent worker must be restarted")
            .clone();
        let Frame::Restart { worker, schedule } = restart else { unreachable!() };
        assert_eq!(worker, 1);
        assert_eq!(&schedule, r.leader.schedule());
        assert_eq!(r.leader.restarts, 1);
        // the ping slate is wiped for the next round
        assert!(r.leader.pinged.iter().all(|p| !p));
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_ping_echo_marks_the_worker_alive() {
        let mut r = rig("ld-ping", vec![vec![1]], &[(Op::Add, 0), (Op::Reduce, 0)]);
        assert!(!r.leader.pinged[0]);
        deliver(&mut r.leader, 0, Frame::Ping { worker: 0 });
        assert!(r.leader.pinged[0]);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_leader_ignores_worker_bound_frames() {
        let mut r = rig("ld-bogus", vec![vec![1]], &[(Op::Add, 0), (Op::Reduce, 0)]);
        deliver(
            &mut r.leader,
            0,
            Frame::DataInsert(DataInsert {
                dest: 0,
                req_id: 0,
                schedule_step: 0,
                value: 1,
                ack: false,
            }),
        );
        assert!(r.leader.outcome.is_none());
        crate::storage::purge_tree(&r.root).unwrap();
    }
}

/*
 * Created on Tue Feb 20 2024
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

//! # The worker executor
//!
//! A worker is a single-threaded cooperative actor. It progresses on two
//! kinds of events only: frames delivered to its mailbox and its own tagged
//! timers. One self-posted `NextStep` pops one record off the current
//! schedule step, applies the operator, and re-arms itself after an
//! operator-class delay; batch boundaries, change-key handoffs, crashes and
//! restarts all happen inside that cycle.
//!
//! Everything the worker must not lose lives under its `Data/Worker_<i>`
//! directory and is written at well-defined points:
//!
//! 1. at a batch boundary: partial result, then the consumed source's
//!    commit (`progress.txt` or the staged batch), then
//!    `(changeKeyCtr, previousLocal)` and the conservation counters;
//! 2. at a non-duplicate change-key acceptance: the insert log, the request
//!    log and `changeKeyReceived`.
//!
//! A simulated crash deallocates all volatile state and refuses every frame
//! but `Restart`; recovery re-reads the durable files and replays the
//! uncommitted batch. Because the request counter rolls back with the
//! batch, the replay regenerates the same request ids and the receivers'
//! dedup makes redelivery harmless.

use crate::clock::{self, Delays, TimerWheel};
use crate::net::{Mailbox, Post};
use crate::ops::{self, Schedule, StepOutcome};
use crate::storage::{BatchLoader, CounterStore, InsertManager, ResultStore, WorkerHome};
use crate::wire::{DataInsert, Envelope, Frame, NodeId, PartialResult, WorkerId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

mod failure;
pub use failure::{FailurePlan, FailureSampler};

/// Crash sampling before a reduce fold weighs the whole batch, not one
/// record
const REDUCE_FAILURE_WEIGHT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTimer {
    NextStep,
    InsertTimeout,
    PingReply,
}

/// Per-worker configuration, shared by every worker of a run
#[derive(Debug, Clone)]
pub struct WorkerCfg {
    pub workers: usize,
    pub batch_size: usize,
    pub change_key_probability: f64,
    pub insert_timeout: Duration,
    pub delays: Delays,
    pub failure: FailurePlan,
    pub data_root: PathBuf,
    pub seed: u64,
}

/// Everything a crash wipes. Rebuilt from the durable files (plus the
/// schedule replayed by the leader) on restart.
struct Volatile {
    id: WorkerId,
    loader: BatchLoader,
    inserts: InsertManager,
    results: ResultStore,
    counters: CounterStore,
    schedule: Schedule,
    reduce_last: bool,
    ck_modulus: i32,
    /// in-memory queues, keyed by the schedule step each record resumes at
    data: BTreeMap<usize, VecDeque<i32>>,
    current_step: usize,
    tmp_reduce: i32,
    tmp_result: Vec<i32>,
    change_key_ctr: u32,
    change_key_sent: u32,
    /// the sent counter as of the last batch boundary; what the durable
    /// file pairs with an eagerly-persisted received counter
    sent_durable: u32,
    change_key_received: u32,
    /// source to read the next batch from
    local_batch: bool,
    /// source of the in-flight (uncommitted) batch
    current_batch_local: bool,
    finished_local: bool,
    finished_partial_ck: bool,
    check_ck_received: bool,
    finish_notice_sent: bool,
    /// single-slot holder for the unacknowledged change-key insert
    unstable: Option<DataInsert>,
    waiting_for_insert: bool,
}

impl Volatile {
    /// Attach to the worker's durable directory, reloading counters and
    /// (for reduce pipelines) the partial total
    fn attach(cfg: &WorkerCfg, id: WorkerId, schedule: Schedule) -> Self {
        let home = WorkerHome::new(&cfg.data_root, id);
        let loader = BatchLoader::open(&home, cfg.batch_size);
        let inserts = InsertManager::open(&home, cfg.batch_size);
        let results = ResultStore::open(&home);
        let counters = CounterStore::open(&home);
        let (change_key_ctr, previous_local) = counters.load_ck();
        let (change_key_sent, change_key_received) = counters.load_sent_received();
        let reduce_last = schedule.reduce_last();
        let tmp_reduce = if reduce_last { results.load_reduce() } else { 0 };
        Self {
            id,
            loader,
            inserts,
            results,
            counters,
            reduce_last,
            ck_modulus: ops::change_key_modulus(cfg.change_key_probability, cfg.workers),
            schedule,
            data: BTreeMap::new(),
            current_step: 0,
            tmp_reduce,
            tmp_result: Vec::new(),
            change_key_ctr,
            change_key_sent,
            sent_durable: change_key_sent,
            change_key_received,
            local_batch: previous_local,
            current_batch_local: previous_local,
            finished_local: false,
            finished_partial_ck: false,
            check_ck_received: false,
            finish_notice_sent: false,
            unstable: None,
            waiting_for_insert: false,
        }
    }

    fn queues_empty(&self) -> bool {
        self.data.values().all(|q| q.is_empty())
    }

    /// Pull the next batch into the in-memory queues, alternating between
    /// the local partition and buffered change-keys. The local source is
    /// never picked again once its end-of-file has been observed. This
    /// only reads; commits are the executor's job.
    fn load_next_batch(&mut self) {
        self.data.clear();
        if self.local_batch {
            let batch = self.loader.load_batch();
            if batch.is_empty() {
                log::debug!("Worker {}: local partition is drained", self.id);
                self.finished_local = true;
                self.local_batch = false;
            } else {
                self.data.entry(0).or_default().extend(batch);
                self.current_batch_local = true;
            }
        } else {
            let ck_batch = self.inserts.get_batch();
            if ck_batch.is_empty() {
                self.finished_partial_ck = true;
            } else {
                for (step, values) in ck_batch {
                    self.data.entry(step).or_default().extend(values);
                }
                self.current_batch_local = false;
            }
        }
        self.local_batch = !self.local_batch && !self.finished_local;
        self.current_step = 0;
    }
}

pub struct Worker {
    inbox: Mailbox,
    post: Post,
    cfg: WorkerCfg,
    rng: StdRng,
    sampler: FailureSampler,
    timers: TimerWheel<WorkerTimer>,
    failed: bool,
    done: bool,
    vol: Option<Volatile>,
}

enum Tick {
    Frame(Envelope),
    Timer(WorkerTimer),
    Closed,
}

impl Worker {
    /// `slot` is the mailbox index this worker was spawned for; it only
    /// seeds the rng (the authoritative identity arrives with `Setup`)
    pub fn new(slot: WorkerId, inbox: Mailbox, post: Post, cfg: WorkerCfg) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(1 + slot as u64));
        let sampler = FailureSampler::new(cfg.failure.clone());
        Self {
            inbox,
            post,
            cfg,
            rng,
            sampler,
            timers: TimerWheel::new(),
            failed: false,
            done: false,
            vol: None,
        }
    }

    /// Drive the actor until the leader calls the run over (or the mesh is
    /// torn down)
    pub async fn run(mut self) {
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
                Tick::Closed => break,
            }
            if self.done {
                break;
            }
        }
    }

    fn handle_frame(&mut self, env: Envelope) {
        match env.frame {
            Frame::Setup { assigned_id, data } => self.handle_setup(assigned_id, &data),
            Frame::Schedule { schedule } => self.handle_schedule(schedule),
            Frame::Restart { worker, schedule } => self.handle_restart(worker, schedule),
            Frame::FinishSim => self.handle_finish_sim(),
            Frame::Ping { .. } => self.handle_ping(),
            Frame::FinishLocalElaboration { .. } => self.handle_check_order(),
            Frame::DataInsert(insert) => self.handle_data_insert(env.from, insert),
            Frame::CheckChangeKeyAck { .. } => {
                log::warn!("Worker received a leader-bound frame; dropping it");
            }
        }
    }

    fn on_timer(&mut self, tag: WorkerTimer) {
        if self.failed {
            return;
        }
        match tag {
            WorkerTimer::NextStep => self.process_step(),
            WorkerTimer::InsertTimeout => self.retry_insert(),
            WorkerTimer::PingReply => self.send_ping_reply(),
        }
    }

    /// Persist the partition this worker owns and attach to its (fresh)
    /// durable directory
    fn handle_setup(&mut self, assigned_id: WorkerId, data: &[i32]) {
        let home = WorkerHome::new(&self.cfg.data_root, assigned_id);
        if let Err(e) = std::fs::create_dir_all(home.root()) {
            log::error!("Worker {}: cannot create home: {}", assigned_id, e);
        }
        let mut contents = String::new();
        for value in data {
            let _ = writeln!(contents, "{},{}", assigned_id, value);
        }
        if let Err(e) = crate::storage::write_partition(&home, &contents) {
            log::error!("Worker {}: cannot persist partition: {}", assigned_id, e);
        }
        self.vol = Some(Volatile::attach(&self.cfg, assigned_id, Schedule::default()));
        log::info!(
            "Worker {} set up with {} records",
            assigned_id,
            data.len()
        );
    }

    /// Install the pipeline and start elaborating
    fn handle_schedule(&mut self, schedule: Schedule) {
        if self.failed {
            return;
        }
        let Some(vol) = self.vol.as_mut() else {
            log::warn!("Schedule delivered before Setup; dropping it");
            return;
        };
        vol.reduce_last = schedule.reduce_last();
        vol.schedule = schedule;
        vol.load_next_batch();
        self.timers.arm(WorkerTimer::NextStep, Duration::ZERO);
    }

    /// Come back from the dead: reinstall identity and schedule, re-read
    /// the durable state and reload the uncommitted batch from the source
    /// recorded at the last boundary
    fn handle_restart(&mut self, worker: WorkerId, schedule: Schedule) {
        if !self.failed && self.vol.is_some() {
            log::warn!(
                "Worker {} received a Restart but has not failed: restarting anyway",
                worker
            );
        }
        self.failed = false;
        self.timers.clear();
        let mut vol = Volatile::attach(&self.cfg, worker, schedule);
        vol.load_next_batch();
        log::info!(
            "Worker {} restarted (ctr {}, sent {}, received {}, reduce {})",
            worker,
            vol.change_key_ctr,
            vol.change_key_sent,
            vol.change_key_received,
            vol.tmp_reduce
        );
        self.vol = Some(vol);
        let delay = self.cfg.delays.restart.sample(&mut self.rng);
        self.timers.arm(WorkerTimer::NextStep, delay);
    }

    fn handle_finish_sim(&mut self) {
        if let Some(vol) = self.vol.as_ref() {
            log::info!(
                "Worker {} finished (sent {}, received {}, buffer empty: {})",
                vol.id,
                vol.change_key_sent,
                vol.change_key_received,
                vol.inserts.is_empty()
            );
        }
        self.done = true;
    }

    fn handle_ping(&mut self) {
        if self.failed || self.vol.is_none() {
            return;
        }
        let delay = self.cfg.delays.ping_reply.sample(&mut self.rng);
        self.timers.arm(WorkerTimer::PingReply, delay);
    }

    fn send_ping_reply(&mut self) {
        let Some(vol) = self.vol.as_ref() else { return };
        self.post.send(NodeId::Leader, Frame::Ping { worker: vol.id });
    }

    /// A re-check order from the leader: drain whatever change-keys arrived
    /// since the finish notice and answer with fresh counters
    fn handle_check_order(&mut self) {
        if self.failed {
            return;
        }
        let Some(vol) = self.vol.as_mut() else { return };
        vol.check_ck_received = true;
        vol.finished_partial_ck = false;
        if vol.waiting_for_insert {
            // the pending ack will resume the executor
            return;
        }
        self.timers.cancel(WorkerTimer::NextStep);
        let delay = self.cfg.delays.finish.sample(&mut self.rng);
        self.timers.arm(WorkerTimer::NextStep, delay);
    }

    fn handle_data_insert(&mut self, from: NodeId, insert: DataInsert) {
        if self.failed {
            log::debug!("Dropping a DataInsert: worker is down");
            return;
        }
        if insert.ack {
            self.handle_insert_ack(insert);
        } else {
            self.handle_insert_request(from, insert);
        }
    }

    /// Receiver half of the change-key protocol: accept-or-dedup, then ack
    /// unconditionally (the sender may be retrying a delivered insert)
    fn handle_insert_request(&mut self, from: NodeId, insert: DataInsert) {
        let NodeId::Worker(sender) = from else {
            log::warn!("DataInsert from the leader makes no sense; dropping it");
            return;
        };
        let Some(vol) = self.vol.as_mut() else {
            // not set up yet; no ack, the sender will retry
            return;
        };
        let fresh = vol.inserts.insert_value(sender, insert.req_id, insert.schedule_step, insert.value);
        if fresh {
            vol.change_key_received += 1;
            vol.counters
                .save_sent_received(vol.sent_durable, vol.change_key_received);
        }
        vol.finished_partial_ck = false;
        self.post.send(
            from,
            Frame::DataInsert(DataInsert {
                dest: sender,
                req_id: insert.req_id,
                schedule_step: insert.schedule_step,
                value: insert.value,
                ack: true,
            }),
        );
        // a worker that had gone idle has new work now
        let idle = !self.timers.is_armed(WorkerTimer::NextStep)
            && !self.vol.as_ref().map(|v| v.waiting_for_insert).unwrap_or(false);
        if idle {
            let delay = self.cfg.delays.finish.sample(&mut self.rng);
            self.timers.arm(WorkerTimer::NextStep, delay);
        }
    }

    /// Sender half: a matching ack releases the unstable slot and resumes
    /// the executor. Cancel the timer before releasing the held message.
    fn handle_insert_ack(&mut self, ack: DataInsert) {
        let Some(vol) = self.vol.as_mut() else { return };
        if !vol.waiting_for_insert {
            return;
        }
        match vol.unstable.as_ref() {
            Some(held) if held.req_id == ack.req_id => {}
            _ => return,
        }
        self.timers.cancel(WorkerTimer::InsertTimeout);
        vol.unstable = None;
        vol.waiting_for_insert = false;
        vol.change_key_sent += 1;
        self.timers.arm(WorkerTimer::NextStep, Duration::ZERO);
    }

    /// The ack is overdue: resend the held duplicate and rearm. Retries are
    /// unbounded; the timeout covers both message loss and a receiver that
    /// crashed and lost the (unacked) insert.
    fn retry_insert(&mut self) {
        let Some(vol) = self.vol.as_ref() else { return };
        let Some(held) = vol.unstable.clone() else { return };
        log::debug!(
            "Worker {}: insert req {} unacked, resending to {}",
            vol.id,
            held.req_id,
            held.dest
        );
        self.post
            .send(NodeId::Worker(held.dest), Frame::DataInsert(held));
        self.timers
            .arm(WorkerTimer::InsertTimeout, self.cfg.insert_timeout);
    }

    /// Marshal a handoff, remember it in the unstable slot and pause the
    /// executor until the ack comes back
    fn send_insert(&mut self, dest: WorkerId, value: i32, schedule_step: usize) {
        let Some(vol) = self.vol.as_mut() else { return };
        let insert = DataInsert {
            dest,
            req_id: vol.change_key_ctr,
            schedule_step,
            value,
            ack: false,
        };
        vol.change_key_ctr += 1;
        log::debug!(
            "Worker {}: changing key {} -> {} for value {} (req {})",
            vol.id,
            vol.id,
            dest,
            value,
            insert.req_id
        );
        vol.unstable = Some(insert.clone());
        vol.waiting_for_insert = true;
        self.post.send(NodeId::Worker(dest), Frame::DataInsert(insert));
        self.timers
            .arm(WorkerTimer::InsertTimeout, self.cfg.insert_timeout);
    }

    /// One `NextStep`: pop one record, apply one operator, rearm. Empty
    /// steps cascade forward in the same event; an exhausted schedule runs
    /// the batch boundary.
    fn process_step(&mut self) {
        if self.failed || self.vol.is_none() {
            return;
        }
        if self.vol.as_ref().unwrap().schedule.is_empty() {
            return;
        }
        loop {
            let at_boundary = {
                let vol = self.vol.as_ref().unwrap();
                vol.current_step >= vol.schedule.len()
            };
            if at_boundary {
                if !self.batch_boundary() {
                    return;
                }
                continue;
            }
            let at_reduce = {
                let vol = self.vol.as_ref().unwrap();
                vol.reduce_last && vol.current_step == vol.schedule.len() - 1
            };
            if at_reduce {
                self.process_reduce();
                return;
            }
            let popped = {
                let vol = self.vol.as_mut().unwrap();
                let step_idx = vol.current_step;
                vol.data.get_mut(&step_idx).and_then(|q| q.pop_front())
            };
            let Some(value) = popped else {
                // finished this step; cascade into the next one
                self.vol.as_mut().unwrap().current_step += 1;
                continue;
            };
            if self.sampler.should_fail(&mut self.rng, 1.0) {
                self.crash();
                return;
            }
            let (step, op_class) = {
                let vol = self.vol.as_ref().unwrap();
                let step = vol.schedule.step(vol.current_step);
                (step, step.op.class())
            };
            let outcome = {
                let vol = self.vol.as_ref().unwrap();
                ops::apply_step(step, value, vol.id, self.cfg.workers, vol.ck_modulus)
            };
            match outcome {
                StepOutcome::Keep(out) => {
                    let vol = self.vol.as_mut().unwrap();
                    if vol.current_step + 1 < vol.schedule.len() {
                        vol.data.entry(vol.current_step + 1).or_default().push_back(out);
                    } else if !vol.reduce_last {
                        vol.tmp_result.push(out);
                    }
                }
                StepOutcome::Drop => {}
                StepOutcome::Handoff { dest, value } => {
                    let next_step = self.vol.as_ref().unwrap().current_step + 1;
                    self.send_insert(dest, value, next_step);
                }
            }
            if self.vol.as_ref().unwrap().waiting_for_insert {
                // paused until the ack arrives
                return;
            }
            let delay = self.cfg.delays.for_class(op_class).sample(&mut self.rng);
            self.timers.arm(WorkerTimer::NextStep, delay);
            return;
        }
    }

    /// Fold the whole batch into the running total at the final step
    fn process_reduce(&mut self) {
        if self.sampler.should_fail(&mut self.rng, REDUCE_FAILURE_WEIGHT) {
            self.crash();
            return;
        }
        let vol = self.vol.as_mut().unwrap();
        let step_idx = vol.current_step;
        let batch_total = match vol.data.get_mut(&step_idx) {
            Some(q) => ops::reduce_batch(q.drain(..)),
            None => 0,
        };
        log::debug!(
            "Worker {} reducing: {} + {} = {}",
            vol.id,
            vol.tmp_reduce,
            batch_total,
            vol.tmp_reduce.wrapping_add(batch_total)
        );
        vol.tmp_reduce = vol.tmp_reduce.wrapping_add(batch_total);
        vol.current_step += 1;
        let delay = self.cfg.delays.reduce.sample(&mut self.rng);
        self.timers.arm(WorkerTimer::NextStep, delay);
    }

    /// The batch is fully elaborated. Commit in the order that makes
    /// replays exactly-once: partial result, then the consumed source, then
    /// the counters; refill the queues in between; and take part in the
    /// termination sub-protocol. Returns whether there is a fresh batch to
    /// keep stepping through.
    fn batch_boundary(&mut self) -> bool {
        {
            let vol = self.vol.as_mut().unwrap();
            // 1. partial result; a final changekey leaves remotely-received
            // survivors parked one step past the end of the schedule
            if !vol.reduce_last {
                let past_end = vol.schedule.len();
                if let Some(mut parked) = vol.data.remove(&past_end) {
                    vol.tmp_result.extend(parked.drain(..));
                }
            }
            if vol.reduce_last {
                vol.results.write_reduce(vol.tmp_reduce);
            } else {
                vol.results.append_records(&vol.tmp_result);
                vol.tmp_result.clear();
            }
            // 2. the consumed batch's source
            if vol.current_batch_local {
                vol.loader.save_progress();
            } else {
                vol.inserts.persist_data();
            }
            // 3. refill
            while vol.queues_empty() && !(vol.finished_local && vol.finished_partial_ck) {
                vol.load_next_batch();
            }
            // 4. counters
            vol.counters.save_ck(vol.change_key_ctr, vol.current_batch_local);
            vol.sent_durable = vol.change_key_sent;
            vol.counters
                .save_sent_received(vol.change_key_sent, vol.change_key_received);
        }
        // 5. termination sub-protocol
        let drained = {
            let vol = self.vol.as_ref().unwrap();
            vol.finished_local && vol.finished_partial_ck
        };
        if drained {
            let (id, sent, received, notice_due) = {
                let vol = self.vol.as_ref().unwrap();
                (
                    vol.id,
                    vol.change_key_sent,
                    vol.change_key_received,
                    !vol.finish_notice_sent,
                )
            };
            if notice_due {
                log::info!("Worker {}: local elaboration finished", id);
                self.post.send(
                    NodeId::Leader,
                    Frame::FinishLocalElaboration {
                        worker: id,
                        change_key_sent: sent,
                        change_key_received: received,
                    },
                );
                self.vol.as_mut().unwrap().finish_notice_sent = true;
            }
            if !self.vol.as_ref().unwrap().check_ck_received {
                log::debug!("Worker {}: idle until further change-keys", id);
                return false;
            }
            let partial = {
                let vol = self.vol.as_ref().unwrap();
                if vol.reduce_last {
                    PartialResult::Reduce(vol.tmp_reduce)
                } else {
                    PartialResult::Records(vol.results.load_records())
                }
            };
            self.post.send(
                NodeId::Leader,
                Frame::CheckChangeKeyAck {
                    worker: id,
                    partial,
                    change_key_sent: sent,
                    change_key_received: received,
                },
            );
            return false;
        }
        true
    }

    /// Enter the `Failed` state: all volatile memory is gone, timers are
    /// freed, and every frame but `Restart` is refused until the leader
    /// notices
    fn crash(&mut self) {
        if let Some(vol) = self.vol.as_ref() {
            log::warn!("Worker {} crashed; volatile state lost", vol.id);
        }
        self.failed = true;
        self.timers.clear();
        self.vol = None;
    }

    #[cfg(test)]
    fn volatile(&self) -> &Volatile {
        self.vol.as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Mesh;
    use crate::ops::{Op, Step};
    use crate::storage::testutil::scratch_root;
    use std::sync::Arc;

    struct Rig {
        worker: Worker,
        leader_rx: Mailbox,
        peer_rx: Vec<Mailbox>,
        _mesh: Arc<Mesh>,
        root: PathBuf,
    }

    /// A hand-driven worker: frames and timers are delivered directly, no
    /// runtime involved
    fn rig(label: &str, slot: WorkerId, workers: usize, cfg_tweak: impl FnOnce(&mut WorkerCfg)) -> Rig {
        let root = scratch_root(label);
        let (mesh, leader_rx, mut worker_rxs) = Mesh::build(workers);
        let inbox = worker_rxs.remove(slot);
        let mut cfg = WorkerCfg {
            workers,
            batch_size: 4,
            change_key_probability: 0.5,
            insert_timeout: Duration::from_millis(500),
            delays: Delays::default(),
            failure: FailurePlan::Disabled,
            data_root: root.clone(),
            seed: 7,
        };
        cfg_tweak(&mut cfg);
        let post = Post::new(NodeId::Worker(slot), mesh.clone());
        Rig {
            worker: Worker::new(slot, inbox, post, cfg),
            leader_rx,
            peer_rx: worker_rxs,
            _mesh: mesh,
            root,
        }
    }

    fn schedule(steps: &[(Op, i32)]) -> Schedule {
        Schedule::new(steps.iter().map(|&(op, param)| Step { op, param }).collect())
    }

    fn deliver(w: &mut Worker, from: NodeId, frame: Frame) {
        w.handle_frame(Envelope { from, frame });
    }

    /// Fire `NextStep` until the worker parks itself (idle or awaiting an
    /// ack)
    fn pump(w: &mut Worker) {
        while w.timers.is_armed(WorkerTimer::NextStep) {
            w.timers.cancel(WorkerTimer::NextStep);
            w.on_timer(WorkerTimer::NextStep);
        }
    }

    /// Fire at most `n` `NextStep`s
    fn pump_n(w: &mut Worker, n: usize) {
        for _ in 0..n {
            if !w.timers.is_armed(WorkerTimer::NextStep) {
                break;
            }
            w.timers.cancel(WorkerTimer::NextStep);
            w.on_timer(WorkerTimer::NextStep);
        }
    }

    fn drain_frames(rx: &mut Mailbox) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(env) = rx.try_recv() {
            frames.push(env.frame);
        }
        frames
    }

    #[test]
    fn test_single_worker_reduce_pipeline() {
        // S1: [add 5, mul 2, reduce] over [1, 2, 3], N = 2 => 42
        let mut r = rig("wk-s1", 0, 1, |cfg| cfg.batch_size = 2);
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![1, 2, 3] });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Schedule { schedule: schedule(&[(Op::Add, 5), (Op::Mul, 2), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        let vol = r.worker.volatile();
        assert_eq!(vol.tmp_reduce, 42);
        assert_eq!(vol.results.load_reduce(), 42);
        let frames = drain_frames(&mut r.leader_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::FinishLocalElaboration { worker: 0, change_key_sent: 0, change_key_received: 0 }
        )));
        // the re-check order produces a fresh ack with the partial result
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::FinishLocalElaboration { worker: 0, change_key_sent: 0, change_key_received: 0 },
        );
        pump(&mut r.worker);
        let frames = drain_frames(&mut r.leader_rx);
        assert!(frames.iter().any(|f| matches!(
            f,
            Frame::CheckChangeKeyAck { partial: PartialResult::Reduce(42), .. }
        )));
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_filter_only_pipeline_appends_in_consumption_order() {
        // S2: [gt 10] over [5, 12, 8, 20] => result file 12, 20
        let mut r = rig("wk-s2", 0, 1, |_| {});
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![5, 12, 8, 20] });
        deliver(&mut r.worker, NodeId::Leader, Frame::Schedule { schedule: schedule(&[(Op::Gt, 10)]) });
        pump(&mut r.worker);
        assert_eq!(r.worker.volatile().results.load_records(), vec![12, 20]);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_invalid_change_key_proposals_stay() {
        // S3: value 2 at worker 0 of 2 proposes owner 2 mod 4 = 2 (>= W):
        // the record stays local
        let mut r = rig("wk-s3", 0, 2, |_| {});
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![2] });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Schedule { schedule: schedule(&[(Op::ChangeKey, 0), (Op::Add, 1), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        let vol = r.worker.volatile();
        assert_eq!(vol.tmp_reduce, 3);
        assert_eq!(vol.change_key_sent, 0);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_sender_blocks_until_ack_and_counts_once() {
        // S4, sender half: worker 0 hands value 1 to worker 1; a duplicate
        // ack must not double-count
        let mut r = rig("wk-s4-send", 0, 2, |_| {});
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![1] });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Schedule { schedule: schedule(&[(Op::ChangeKey, 0), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        assert!(r.worker.volatile().waiting_for_insert);
        assert!(r.worker.timers.is_armed(WorkerTimer::InsertTimeout));
        let sent = drain_frames(&mut r.peer_rx[0]);
        assert_eq!(sent.len(), 1);
        let Frame::DataInsert(insert) = &sent[0] else { panic!("expected an insert") };
        assert_eq!((insert.dest, insert.req_id, insert.value, insert.ack), (1, 0, 1, false));
        assert_eq!(insert.schedule_step, 1);
        // timeout fires: the duplicate goes out again
        r.worker.timers.cancel(WorkerTimer::InsertTimeout);
        r.worker.on_timer(WorkerTimer::InsertTimeout);
        assert_eq!(drain_frames(&mut r.peer_rx[0]).len(), 1);
        // first ack releases the slot and counts the handoff
        deliver(
            &mut r.worker,
            NodeId::Worker(1),
            Frame::DataInsert(DataInsert { dest: 0, req_id: 0, schedule_step: 1, value: 1, ack: true }),
        );
        assert!(!r.worker.volatile().waiting_for_insert);
        assert!(!r.worker.timers.is_armed(WorkerTimer::InsertTimeout));
        assert_eq!(r.worker.volatile().change_key_sent, 1);
        // a duplicate ack is stale and changes nothing
        deliver(
            &mut r.worker,
            NodeId::Worker(1),
            Frame::DataInsert(DataInsert { dest: 0, req_id: 0, schedule_step: 1, value: 1, ack: true }),
        );
        assert_eq!(r.worker.volatile().change_key_sent, 1);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_receiver_dedups_but_always_acks() {
        // S4, receiver half: the same (sender, reqID) delivered twice is
        // accepted once but acked twice
        let mut r = rig("wk-s4-recv", 1, 2, |_| {});
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 1, data: vec![] });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Schedule { schedule: schedule(&[(Op::ChangeKey, 0), (Op::Reduce, 0)]) },
        );
        let insert = DataInsert { dest: 1, req_id: 7, schedule_step: 1, value: 42, ack: false };
        deliver(&mut r.worker, NodeId::Worker(0), Frame::DataInsert(insert.clone()));
        deliver(&mut r.worker, NodeId::Worker(0), Frame::DataInsert(insert));
        let acks = drain_frames(&mut r.peer_rx[0]);
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|f| matches!(f, Frame::DataInsert(DataInsert { req_id: 7, ack: true, .. }))));
        let vol = r.worker.volatile();
        assert_eq!(vol.change_key_received, 1);
        assert_eq!(vol.counters.load_sent_received(), (0, 1));
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_insert_wakes_an_idle_worker() {
        let mut r = rig("wk-wake", 1, 2, |_| {});
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 1, data: vec![] });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Schedule { schedule: schedule(&[(Op::ChangeKey, 0), (Op::Add, 1), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        // empty partition: the worker declared local elaboration finished
        // and went idle
        assert!(r.worker.volatile().finished_local);
        assert!(drain_frames(&mut r.leader_rx)
            .iter()
            .any(|f| matches!(f, Frame::FinishLocalElaboration { worker: 1, .. })));
        assert!(!r.worker.timers.is_armed(WorkerTimer::NextStep));
        // a late insert resumes elaboration at its recorded step
        deliver(
            &mut r.worker,
            NodeId::Worker(0),
            Frame::DataInsert(DataInsert { dest: 1, req_id: 0, schedule_step: 1, value: 9, ack: false }),
        );
        assert!(r.worker.timers.is_armed(WorkerTimer::NextStep));
        assert!(!r.worker.volatile().finished_partial_ck);
        pump(&mut r.worker);
        assert_eq!(r.worker.volatile().tmp_reduce, 10);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_crash_refuses_everything_but_restart() {
        let mut r = rig("wk-crash", 0, 1, |cfg| {
            cfg.failure = FailurePlan::Scripted { crash_points: vec![0] };
        });
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![1, 2] });
        deliver(&mut r.worker, NodeId::Leader, Frame::Schedule { schedule: schedule(&[(Op::Add, 1), (Op::Reduce, 0)]) });
        pump(&mut r.worker);
        assert!(r.worker.failed);
        assert!(r.worker.vol.is_none());
        assert!(r.worker.timers.next_deadline().is_none());
        // pings and orders bounce off
        deliver(&mut r.worker, NodeId::Leader, Frame::Ping { worker: 0 });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::FinishLocalElaboration { worker: 0, change_key_sent: 0, change_key_received: 0 },
        );
        assert!(r.worker.timers.next_deadline().is_none());
        // restart replays the uncommitted batch and finishes the run
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Restart { worker: 0, schedule: schedule(&[(Op::Add, 1), (Op::Reduce, 0)]) },
        );
        assert!(!r.worker.failed);
        pump(&mut r.worker);
        assert_eq!(r.worker.volatile().tmp_reduce, 5);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_crash_after_local_commit_resumes_from_remote() {
        // S5: the local batch commits, then the crash fires before the
        // remote batch is elaborated. The local batch must not replay and
        // the staged remote batch must.
        let mut r = rig("wk-s5", 1, 2, |cfg| {
            cfg.batch_size = 2;
            // samples: 0,1 = records of the local batch; 2 = the reduce
            // fold; 3 = first record of the remote batch
            cfg.failure = FailurePlan::Scripted { crash_points: vec![3] };
        });
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 1, data: vec![1, 2] });
        deliver(&mut r.worker, NodeId::Leader, Frame::Schedule { schedule: schedule(&[(Op::Add, 1), (Op::Reduce, 0)]) });
        // a change-key arrives while the local batch is elaborating
        deliver(
            &mut r.worker,
            NodeId::Worker(0),
            Frame::DataInsert(DataInsert { dest: 1, req_id: 0, schedule_step: 0, value: 10, ack: false }),
        );
        pump(&mut r.worker);
        // local batch (1+1) + (2+1) reduced to 5 and committed; the crash
        // hit the remote record
        assert!(r.worker.failed);
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Restart { worker: 1, schedule: schedule(&[(Op::Add, 1), (Op::Reduce, 0)]) },
        );
        let vol = r.worker.volatile();
        assert_eq!(vol.tmp_reduce, 5); // reloaded, not recomputed
        assert!(!vol.current_batch_local); // resumed from the remote source
        pump(&mut r.worker);
        assert_eq!(r.worker.volatile().tmp_reduce, 16); // 5 + (10+1)
        assert_eq!(r.worker.volatile().results.load_reduce(), 16);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_replayed_batch_regenerates_request_ids() {
        // crash while AwaitingAck: the restart rediscovers the record in
        // the uncommitted batch and the resend reuses the same request id
        let mut r = rig("wk-replay-req", 0, 2, |cfg| {
            cfg.failure = FailurePlan::Scripted { crash_points: vec![1] };
        });
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![1] });
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Schedule { schedule: schedule(&[(Op::ChangeKey, 0), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        assert!(r.worker.volatile().waiting_for_insert);
        let first = drain_frames(&mut r.peer_rx[0]);
        let Frame::DataInsert(first) = &first[0] else { panic!() };
        assert_eq!(first.req_id, 0);
        // the ack never arrives; instead the worker crashes on its next
        // sampling point after a restart-free retry window
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Restart { worker: 0, schedule: schedule(&[(Op::ChangeKey, 0), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        // crash point 1 hits the replayed record before the handoff...
        assert!(r.worker.failed);
        deliver(
            &mut r.worker,
            NodeId::Leader,
            Frame::Restart { worker: 0, schedule: schedule(&[(Op::ChangeKey, 0), (Op::Reduce, 0)]) },
        );
        pump(&mut r.worker);
        // ...and the second replay hands off with the same request id
        let resent = drain_frames(&mut r.peer_rx[0]);
        let Frame::DataInsert(resent) = resent.last().unwrap() else { panic!() };
        assert_eq!(resent.req_id, 0);
        assert_eq!(resent.value, 1);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_batch_sources_alternate() {
        // buffered change-keys must not starve behind a long local backlog:
        // the second batch comes from the remote source even though the
        // local partition still has records
        let mut r = rig("wk-alternate", 0, 2, |cfg| cfg.batch_size = 2);
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![1, 2, 3, 4] });
        deliver(&mut r.worker, NodeId::Leader, Frame::Schedule { schedule: schedule(&[(Op::Add, 0), (Op::Reduce, 0)]) });
        deliver(
            &mut r.worker,
            NodeId::Worker(1),
            Frame::DataInsert(DataInsert { dest: 0, req_id: 0, schedule_step: 0, value: 100, ack: false }),
        );
        // 3 events drain the first local batch, the 4th crosses the
        // boundary into the next one
        pump_n(&mut r.worker, 4);
        let vol = r.worker.volatile();
        assert!(!vol.current_batch_local);
        assert!(!vol.finished_local);
        pump(&mut r.worker);
        assert_eq!(r.worker.volatile().tmp_reduce, 110);
        crate::storage::purge_tree(&r.root).unwrap();
    }

    #[test]
    fn test_restart_of_a_live_worker_is_tolerated() {
        let mut r = rig("wk-false-suspect", 0, 1, |cfg| cfg.batch_size = 2);
        deliver(&mut r.worker, NodeId::Leader, Frame::Setup { assigned_id: 0, data: vec![1, 2, 3] });
        deliver(&mut r.worker, NodeId::Leader, Frame::Schedule { schedule: schedule(&[(Op::Add, 1), (Op::Reduce, 0)]) });
        pump(&mut r.worker);
        let before = r.worker.volatile().tmp_reduce;
        // a slow ping made the leader restart a healthy worker
        deliver(&mut r.worker, NodeId::Leader, Frame::Restart { worker: 0, schedule: schedule(&[(Op::Add, 1), (Op::Reduce, 0)]) });
        pump(&mut r.worker);
        // everything committed survives; the run still converges
        assert_eq!(r.worker.volatile().tmp_reduce, before);
        crate::storage::purge_tree(&r.root).unwrap();
    }
}

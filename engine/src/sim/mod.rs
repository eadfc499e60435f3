/*
 * Created on Mon Apr 08 2024
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

//! # The simulation harness
//!
//! Wires one leader and W workers onto a mailbox mesh, spawns each actor as
//! its own task, and waits for the leader's verdict. Worker tasks exit when
//! the leader broadcasts `FinishSim`; the whole run is capped by the
//! configured simulated-time budget so a wedged protocol turns into an
//! error instead of a hang.

use crate::config::Config;
use crate::error::{Error, RillResult};
use crate::gen::{self, Workload};
use crate::leader::{Leader, LeaderCfg, SimReport};
use crate::net::{Mesh, Post};
use crate::wire::NodeId;
use crate::worker::{FailurePlan, Worker, WorkerCfg};
use std::fmt::Write as _;
use std::path::PathBuf;

/// Run one simulation with the configured (or generated) workload
pub async fn run_simulation(cfg: &Config) -> RillResult<(Workload, SimReport)> {
    let workload = match &cfg.workload {
        Some(explicit) => explicit.clone(),
        None => gen::generate(cfg.workers, &cfg.generator, cfg.seed),
    };
    workload
        .validate(cfg.workers)
        .map_err(Error::WorkloadError)?;
    let report = run_with_workload(cfg, workload.clone()).await?;
    Ok((workload, report))
}

/// Spawn the actors and drive the run to completion
pub async fn run_with_workload(cfg: &Config, workload: Workload) -> RillResult<SimReport> {
    let (mesh, leader_rx, worker_rxs) = Mesh::build(cfg.workers);
    let worker_cfg = WorkerCfg {
        workers: cfg.workers,
        batch_size: cfg.batch_size,
        change_key_probability: cfg.change_key_probability,
        insert_timeout: cfg.insert_timeout_duration(),
        delays: cfg.delays,
        failure: if cfg.failure_probability > 0.0 {
            FailurePlan::Random {
                probability: cfg.failure_probability,
            }
        } else {
            FailurePlan::Disabled
        },
        data_root: cfg.data_root.clone(),
        seed: cfg.seed,
    };
    let mut worker_handles = Vec::with_capacity(cfg.workers);
    for (slot, inbox) in worker_rxs.into_iter().enumerate() {
        let post = Post::new(NodeId::Worker(slot), mesh.clone());
        let worker = Worker::new(slot, inbox, post, worker_cfg.clone());
        worker_handles.push(tokio::spawn(worker.run()));
    }
    let leader_cfg = LeaderCfg {
        workers: cfg.workers,
        ping_interval: cfg.ping_interval_duration(),
        ping_timeout: cfg.ping_timeout_duration(),
        data_root: cfg.data_root.clone(),
    };
    let leader = Leader::new(
        leader_rx,
        Post::new(NodeId::Leader, mesh.clone()),
        leader_cfg,
        workload,
    );
    drop(mesh);
    let leader_handle = tokio::spawn(leader.run());
    let report = match tokio::time::timeout(cfg.sim_time_budget_duration(), leader_handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(Error::SimError(format!(
            "the leader task died: {}",
            join_error
        ))),
        Err(_) => Err(Error::SimError(
            "the simulated-time budget was exceeded before termination".to_owned(),
        )),
    };
    match report {
        Ok(report) => {
            // workers exit on FinishSim; collect them so their last writes
            // are sequenced before the caller inspects the tree
            for handle in worker_handles {
                let _ = handle.await;
            }
            Ok(report)
        }
        Err(e) => {
            for handle in worker_handles {
                handle.abort();
            }
            Err(e)
        }
    }
}

/// Append the run's numbers to the per-experiment log tree, mirroring the
/// layout the engine's plotting scripts consume:
/// `Logs/<experiment>/<n>/SIM_<W>_<f>_<datasize>_<N>_<schedulelen>.log`
pub fn write_report(cfg: &Config, workload: &Workload, report: &SimReport) -> RillResult<PathBuf> {
    let parent = PathBuf::from("Logs").join(&cfg.experiment);
    std::fs::create_dir_all(&parent)
        .map_err(|e| Error::ioerror_extra(e, "creating the log tree"))?;
    let mut max_id: i64 = -1;
    for entry in std::fs::read_dir(&parent).map_err(Error::IoError)? {
        let entry = entry.map_err(Error::IoError)?;
        if entry.path().is_dir() {
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) {
                max_id = max_id.max(id);
            }
        }
    }
    let run_dir = parent.join(format!("{}", max_id + 1));
    std::fs::create_dir_all(&run_dir)
        .map_err(|e| Error::ioerror_extra(e, "creating the run directory"))?;
    let file = run_dir.join(format!(
        "SIM_{}_{}_{}_{}_{}.log",
        cfg.workers,
        cfg.failure_probability,
        workload.total_records(),
        cfg.batch_size,
        workload.schedule.len()
    ));
    let mut contents = String::new();
    let _ = writeln!(contents, "timestamp: {}", chrono::Local::now().to_rfc3339());
    let _ = writeln!(contents, "duration_secs: {}", report.duration.as_secs_f64());
    let _ = writeln!(contents, "correct: {}", report.correct);
    let _ = writeln!(contents, "restarts: {}", report.restarts);
    let _ = writeln!(contents, "recheck_rounds: {}", report.recheck_rounds);
    let _ = writeln!(
        contents,
        "change_keys: {}/{}",
        report.change_key_sent, report.change_key_received
    );
    std::fs::write(&file, contents).map_err(|e| Error::ioerror_extra(e, "writing the report"))?;
    Ok(file)
}

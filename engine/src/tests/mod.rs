/*
 * Created on Tue Apr 16 2024
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

//! End-to-end runs on a paused-time runtime: every actor is spawned for
//! real, the clock is virtual, and the suite asserts on the leader's
//! verdict plus the durable files the run leaves behind.

use crate::config::Config;
use crate::gen::Workload;
use crate::ops::{Op, Schedule, Step};
use crate::sim;
use crate::storage::{self, testutil::scratch_root, WorkerHome};

fn schedule(steps: &[(Op, i32)]) -> Schedule {
    Schedule::new(steps.iter().map(|&(op, param)| Step { op, param }).collect())
}

fn cfg_for(label: &str, partitions: Vec<Vec<i32>>, steps: &[(Op, i32)]) -> Config {
    let mut cfg = Config::default();
    cfg.workers = partitions.len();
    cfg.batch_size = 4;
    cfg.change_key_probability = 0.5;
    cfg.failure_probability = 0.0;
    cfg.seed = 11;
    cfg.data_root = scratch_root(label);
    cfg.workload = Some(Workload {
        partitions,
        schedule: schedule(steps),
    });
    cfg
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_single_worker_reduce() {
    // S1: [add 5, mul 2, reduce] over [1, 2, 3] with N = 2 => 42
    let mut cfg = cfg_for(
        "e2e-s1",
        vec![vec![1, 2, 3]],
        &[(Op::Add, 5), (Op::Mul, 2), (Op::Reduce, 0)],
    );
    cfg.batch_size = 2;
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![42]);
    // the durable result file holds the final total
    let home = WorkerHome::new(&cfg.data_root, 0);
    assert_eq!(
        std::fs::read_to_string(home.result_file()).unwrap().trim(),
        "42"
    );
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_filter_only_no_reduce() {
    // S2: [gt 10] over [5, 12, 8, 20] => result file "12\n20\n" in
    // consumption order
    let cfg = cfg_for("e2e-s2", vec![vec![5, 12, 8, 20]], &[(Op::Gt, 10)]);
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![12, 20]);
    let home = WorkerHome::new(&cfg.data_root, 0);
    assert_eq!(
        std::fs::read_to_string(home.result_file()).unwrap(),
        "12\n20\n"
    );
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_two_worker_change_key_stays_local() {
    // S3: with p = 0.5 and W = 2 the proposals 2 mod 4 and 3 mod 4 are out
    // of range, so both records stay put and the sums flow to the leader
    let cfg = cfg_for(
        "e2e-s3",
        vec![vec![2], vec![3]],
        &[(Op::ChangeKey, 0), (Op::Add, 1), (Op::Reduce, 0)],
    );
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![7]);
    assert_eq!(report.change_key_sent, 0);
    assert_eq!(report.change_key_received, 0);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_change_key_actually_moves_records() {
    // value 1 at worker 0 proposes owner 1: exactly one exactly-once
    // handoff, conserved at termination
    let cfg = cfg_for(
        "e2e-move",
        vec![vec![1], vec![2]],
        &[(Op::ChangeKey, 0), (Op::Reduce, 0)],
    );
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![3]);
    assert_eq!(report.change_key_sent, 1);
    assert_eq!(report.change_key_received, 1);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_empty_partition_terminates() {
    // a worker with no local data must still take part in termination
    let cfg = cfg_for(
        "e2e-empty",
        vec![vec![], vec![1, 2, 3]],
        &[(Op::Add, 1), (Op::Reduce, 0)],
    );
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![9]);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_single_step_reduce_schedule() {
    // schedule of length 1: every batch folds straight into the total
    let cfg = cfg_for("e2e-len1", vec![vec![1, 2, 3, 4, 5]], &[(Op::Reduce, 0)]);
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![15]);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_change_key_as_final_operator() {
    // records surviving a final changekey land in the result file of
    // whichever worker owns them at the end
    let cfg = cfg_for(
        "e2e-ck-last",
        vec![vec![1, 4], vec![5, 8]],
        &[(Op::Add, 0), (Op::ChangeKey, 0)],
    );
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.actual, vec![1, 4, 5, 8]);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_generated_workload_is_deterministic_without_failures() {
    // P1: same inputs, schedule, W and p => same result, run after run
    let mut cfg = Config::default();
    cfg.workers = 3;
    cfg.batch_size = 8;
    cfg.seed = 20240416;
    cfg.generator.partition_min = 12;
    cfg.generator.partition_max = 16;
    cfg.generator.schedule_min = 4;
    cfg.generator.schedule_max = 8;
    cfg.data_root = scratch_root("e2e-p1-a");
    let (workload_a, report_a) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report_a.correct);
    storage::purge_tree(&cfg.data_root).unwrap();
    cfg.data_root = scratch_root("e2e-p1-b");
    let (workload_b, report_b) = sim::run_simulation(&cfg).await.unwrap();
    assert_eq!(workload_a.partitions, workload_b.partitions);
    assert_eq!(report_a.actual, report_b.actual);
    assert_eq!(report_a.change_key_sent, report_b.change_key_sent);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_crash_recovery_matches_the_crash_free_run() {
    // P5: randomly crashing workers are restarted by the leader and the
    // final result still matches the crash-free reference
    let mut cfg = Config::default();
    cfg.workers = 2;
    cfg.batch_size = 3;
    cfg.change_key_probability = 0.5;
    cfg.failure_probability = 0.02;
    cfg.seed = 77;
    cfg.data_root = scratch_root("e2e-p5");
    cfg.workload = Some(Workload {
        partitions: vec![vec![3, 1, 4, 1, 5, 9, 2, 6], vec![5, 3, 5, 8, 9, 7]],
        schedule: schedule(&[
            (Op::ChangeKey, 0),
            (Op::Add, 2),
            (Op::Ge, 4),
            (Op::Reduce, 0),
        ]),
    });
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    // the verdict is computed against the crash-free reference pipeline
    assert!(report.correct, "crash recovery diverged: {:?}", report);
    assert_eq!(report.change_key_sent, report.change_key_received);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_crashes_with_filters_and_appended_results() {
    // P5/P6 for the append-only result path: replayed batches must not
    // double-append committed records
    let mut cfg = Config::default();
    cfg.workers = 2;
    cfg.batch_size = 2;
    cfg.change_key_probability = 0.5;
    cfg.failure_probability = 0.03;
    cfg.seed = 404;
    cfg.data_root = scratch_root("e2e-p6");
    cfg.workload = Some(Workload {
        partitions: vec![vec![11, 2, 13, 4, 15], vec![6, 17, 8, 19]],
        schedule: schedule(&[(Op::Gt, 5), (Op::Add, 1)]),
    });
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct, "replay duplicated or lost records: {:?}", report);
    storage::purge_tree(&cfg.data_root).unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_explicit_workload_smoke_run_with_many_workers() {
    // a wider cluster exercising routing: p = 0.25 gives modulus 4W and a
    // mix of kept and moved records
    let mut cfg = Config::default();
    cfg.workers = 4;
    cfg.batch_size = 5;
    cfg.change_key_probability = 0.25;
    cfg.seed = 9;
    cfg.data_root = scratch_root("e2e-wide");
    cfg.workload = Some(Workload {
        partitions: vec![
            vec![1, 2, 3, 4, 5, 6, 7],
            vec![8, 9, 10, 11],
            vec![12, 13, 14, 15, 16],
            vec![17, 18, 19, 20],
        ],
        schedule: schedule(&[
            (Op::Mul, 3),
            (Op::ChangeKey, 0),
            (Op::Sub, 2),
            (Op::ChangeKey, 0),
            (Op::Reduce, 0),
        ]),
    });
    let (_, report) = sim::run_simulation(&cfg).await.unwrap();
    assert!(report.correct);
    assert_eq!(report.change_key_sent, report.change_key_received);
    storage::purge_tree(&cfg.data_root).unwrap();
}

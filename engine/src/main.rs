/*
 * Created on Mon Jan 22 2024
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

//! # Rillflow
//!
//! The `rilld` crate (or the `engine` folder) is the Rillflow engine: a
//! leader and a set of workers evaluating an operator pipeline over
//! partitioned integer data, tolerating arbitrary worker crashes without
//! losing or duplicating a single record. One invocation runs one complete
//! simulation and reports whether the distributed result matches a
//! crash-free reference.

use env_logger::Builder;
use librill::util::terminal;
use librill::{URL, VERSION};
use std::env;

mod clock;
mod config;
mod error;
mod gen;
mod leader;
mod net;
mod ops;
mod sim;
mod storage;
mod wire;
mod worker;
#[cfg(test)]
mod tests;

/// The terminal art
static TEXT: &str = "\n\
██████  ██ ██      ██      ███████ ██       ██████  ██     ██\n\
██   ██ ██ ██      ██      ██      ██      ██    ██ ██     ██\n\
██████  ██ ██      ██      █████   ██      ██    ██ ██  █  ██\n\
██   ██ ██ ██      ██      ██      ██      ██    ██ ██ ███ ██\n\
██   ██ ██ ███████ ███████ ██      ███████  ██████   ███ ███\n";

fn main() {
    Builder::new()
        .parse_filters(&env::var("RILL_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let (cfg, warnings) = config::get_config_or_exit();
    println!("Rillflow v{} | {}\n{}", VERSION, URL, TEXT);
    warnings.print_warnings();
    log::info!(
        "Starting a run: {} workers, batch size {}, failure probability {}",
        cfg.workers,
        cfg.batch_size,
        cfg.failure_probability
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("engine")
        .enable_all()
        .build()
        .unwrap();
    let outcome = runtime.block_on(sim::run_simulation(&cfg));
    drop(runtime);
    let (workload, report) = match outcome {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("The run failed: {}", e);
            std::process::exit(0x100);
        }
    };
    match sim::write_report(&cfg, &workload, &report) {
        Ok(path) => log::info!("Report written to {}", path.display()),
        Err(e) => log::error!("Failed to write the report: {}", e),
    }
    println!(
        "Elaborated {} records through {} steps in {:.3}s (simulated), {} restarts, {} change-keys",
        workload.total_records(),
        workload.schedule.len(),
        report.duration.as_secs_f64(),
        report.restarts,
        report.change_key_sent
    );
    if report.correct {
        terminal::write_success("The distributed result matches the reference :)\n").unwrap();
    } else {
        terminal::write_error("The distributed result does NOT match the reference\n").unwrap();
        log::error!("expected {:?}", report.expected);
        log::error!("got      {:?}", report.actual);
        std::process::exit(0x100);
    }
}

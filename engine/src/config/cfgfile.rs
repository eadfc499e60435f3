/*
 * Created on Tue Mar 26 2024
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

//! The on-disk TOML layout. Every field is optional; whatever is absent
//! keeps its built-in default. Example:
//!
//! ```toml
//! [system]
//! workers = 10
//! batch_size = 10
//! seed = 4807
//! data_root = "Data"
//! experiment = "Increasing_Number_of_Data"
//!
//! [protocol]
//! change_key_probability = 0.85
//! failure_probability = 0.002
//! ping_interval = 2.5
//! ping_timeout = 2.0
//! insert_timeout = 0.5
//!
//! [delays]
//! map = [0.0001, 0.0003]
//! reduce = [0.02, 0.01]
//!
//! [workload]
//! partitions = [[31, 35, 47], [12, 32, 42]]
//! steps = [{ op = "gt", param = 10 }, { op = "reduce", param = 0 }]
//! ```

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub system: Option<SystemSection>,
    pub protocol: Option<ProtocolSection>,
    pub delays: Option<DelaysSection>,
    pub generator: Option<GeneratorSection>,
    pub workload: Option<WorkloadSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SystemSection {
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub seed: Option<u64>,
    pub data_root: Option<String>,
    pub experiment: Option<String>,
    pub sim_time_budget: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProtocolSection {
    pub change_key_probability: Option<f64>,
    pub failure_probability: Option<f64>,
    pub ping_interval: Option<f64>,
    pub ping_timeout: Option<f64>,
    pub insert_timeout: Option<f64>,
}

/// Each entry is a `[mu, sigma]` pair of the underlying normal, in seconds
#[derive(Debug, Default, Deserialize)]
pub struct DelaysSection {
    pub map: Option<[f64; 2]>,
    pub filter: Option<[f64; 2]>,
    pub change_key: Option<[f64; 2]>,
    pub reduce: Option<[f64; 2]>,
    pub finish: Option<[f64; 2]>,
    pub ping_reply: Option<[f64; 2]>,
    pub restart: Option<[f64; 2]>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GeneratorSection {
    pub partition_min: Option<usize>,
    pub partition_max: Option<usize>,
    pub value_max: Option<i32>,
    pub schedule_min: Option<usize>,
    pub schedule_max: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkloadSection {
    pub partitions: Vec<Vec<i32>>,
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StepEntry {
    pub op: String,
    #[serde(default)]
    pub param: i32,
}

impl ConfigFile {
    pub fn from_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

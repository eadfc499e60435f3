/*
 * Created on Wed Mar 27 2024
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

//! # Configuration
//!
//! Resolution is layered: built-in defaults, then the TOML file (first CLI
//! argument or `RILL_CONFIG`), then `RILL_*` environment overrides. Errors
//! abort startup; oddities that the daemon can live with are collected in a
//! [`WarningStack`] and logged once the logger is up.

use crate::clock::{DelayProfile, Delays};
use crate::gen::{GenParams, Workload};
use crate::ops::{Op, Schedule, Step};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod cfgfile;
mod feedback;
use self::cfgfile::ConfigFile;
pub use self::feedback::{ConfigError, WarningStack};

// system defaults
const DEFAULT_WORKERS: usize = 10;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_SEED: u64 = 4807;
const DEFAULT_DATA_ROOT: &str = "Data";
const DEFAULT_EXPERIMENT: &str = "Baseline";
const DEFAULT_SIM_TIME_BUDGET: f64 = 86_400.0;
// protocol defaults
const DEFAULT_CHANGE_KEY_PROBABILITY: f64 = 0.85;
const DEFAULT_FAILURE_PROBABILITY: f64 = 0.0;
const DEFAULT_PING_INTERVAL: f64 = 2.5;
const DEFAULT_PING_TIMEOUT: f64 = 2.0;
const DEFAULT_INSERT_TIMEOUT: f64 = 0.5;

/// One run's full configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub data_root: PathBuf,
    pub experiment: String,
    /// simulated-time cap before the run is declared wedged
    pub sim_time_budget: f64,
    pub change_key_probability: f64,
    /// per sampling point; scaled up before reduce folds
    pub failure_probability: f64,
    pub ping_interval: f64,
    pub ping_timeout: f64,
    pub insert_timeout: f64,
    pub delays: Delays,
    pub generator: GenParams,
    /// explicit workload; `None` means generate one from the seed
    pub workload: Option<Workload>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: DEFAULT_SEED,
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            experiment: DEFAULT_EXPERIMENT.to_owned(),
            sim_time_budget: DEFAULT_SIM_TIME_BUDGET,
            change_key_probability: DEFAULT_CHANGE_KEY_PROBABILITY,
            failure_probability: DEFAULT_FAILURE_PROBABILITY,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            insert_timeout: DEFAULT_INSERT_TIMEOUT,
            delays: Delays::default(),
            generator: GenParams::default(),
            workload: None,
        }
    }
}

impl Config {
    pub fn ping_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval)
    }
    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.ping_timeout)
    }
    pub fn insert_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.insert_timeout)
    }
    pub fn sim_time_budget_duration(&self) -> Duration {
        Duration::from_secs_f64(self.sim_time_budget)
    }

    /// Guard against configurations the protocol cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::OnValidate("at least one worker".to_owned()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::OnValidate(
                "the batch size must be positive".to_owned(),
            ));
        }
        if !(0.0 < self.change_key_probability && self.change_key_probability <= 1.0) {
            return Err(ConfigError::OnValidate(
                "the change-key probability must be in (0, 1]".to_owned(),
            ));
        }
        if !(0.0..1.0).contains(&self.failure_probability) {
            return Err(ConfigError::OnValidate(
                "the failure probability must be in [0, 1)".to_owned(),
            ));
        }
        if self.ping_interval <= 0.0 || self.ping_timeout <= 0.0 || self.insert_timeout <= 0.0 {
            return Err(ConfigError::OnValidate(
                "intervals and timeouts must be positive".to_owned(),
            ));
        }
        if let Some(workload) = &self.workload {
            workload
                .validate(self.workers)
                .map_err(ConfigError::OnValidate)?;
        }
        Ok(())
    }
}

/// Resolve the configuration from the process environment, or explain on
/// stderr and exit
pub fn get_config_or_exit() -> (Config, WarningStack) {
    match resolve_from_env() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(0x100);
        }
    }
}

fn resolve_from_env() -> Result<(Config, WarningStack), ConfigError> {
    let mut warnings = WarningStack::new();
    let path = env::args().nth(1).or_else(|| env::var("RILL_CONFIG").ok());
    let file = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::OnRead(format!("{}: {}", path, e)))?;
            ConfigFile::from_str(&raw).map_err(|e| ConfigError::OnParse(e.to_string()))?
        }
        None => {
            warnings.push("no configuration file supplied, using default settings");
            ConfigFile::default()
        }
    };
    let mut cfg = resolve(file, &mut warnings)?;
    apply_env_overrides(&mut cfg, &mut warnings)?;
    cfg.validate()?;
    Ok((cfg, warnings))
}

/// Merge a parsed file over the defaults
fn resolve(file: ConfigFile, warnings: &mut WarningStack) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    if let Some(system) = file.system {
        set_if(&mut cfg.workers, system.workers);
        set_if(&mut cfg.batch_size, system.batch_size);
        set_if(&mut cfg.seed, system.seed);
        if let Some(root) = system.data_root {
            cfg.data_root = PathBuf::from(root);
        }
        set_if(&mut cfg.experiment, system.experiment);
        set_if(&mut cfg.sim_time_budget, system.sim_time_budget);
    }
    if let Some(protocol) = file.protocol {
        set_if(&mut cfg.change_key_probability, protocol.change_key_probability);
        set_if(&mut cfg.failure_probability, protocol.failure_probability);
        set_if(&mut cfg.ping_interval, protocol.ping_interval);
        set_if(&mut cfg.ping_timeout, protocol.ping_timeout);
        set_if(&mut cfg.insert_timeout, protocol.insert_timeout);
    }
    if let Some(delays) = file.delays {
        apply_delay(&mut cfg.delays.map, delays.map);
        apply_delay(&mut cfg.delays.filter, delays.filter);
        apply_delay(&mut cfg.delays.change_key, delays.change_key);
        apply_delay(&mut cfg.delays.reduce, delays.reduce);
        apply_delay(&mut cfg.delays.finish, delays.finish);
        apply_delay(&mut cfg.delays.ping_reply, delays.ping_reply);
        apply_delay(&mut cfg.delays.restart, delays.restart);
    }
    if let Some(generator) = file.generator {
        set_if(&mut cfg.generator.partition_min, generator.partition_min);
        set_if(&mut cfg.generator.partition_max, generator.partition_max);
        set_if(&mut cfg.generator.value_max, generator.value_max);
        set_if(&mut cfg.generator.schedule_min, generator.schedule_min);
        set_if(&mut cfg.generator.schedule_max, generator.schedule_max);
    }
    if let Some(workload) = file.workload {
        let mut steps = Vec::with_capacity(workload.steps.len());
        for entry in &workload.steps {
            let op = Op::parse(&entry.op).ok_or_else(|| {
                ConfigError::OnValidate(format!("unknown operator {:?}", entry.op))
            })?;
            steps.push(Step {
                op,
                param: entry.param,
            });
        }
        if workload.partitions.len() != cfg.workers {
            warnings.push(format!(
                "the explicit workload has {} partitions; adjusting the worker count",
                workload.partitions.len()
            ));
            cfg.workers = workload.partitions.len();
        }
        cfg.workload = Some(Workload {
            partitions: workload.partitions,
            schedule: Schedule::new(steps),
        });
    }
    Ok(cfg)
}

/// `RILL_*` variables override everything else
fn apply_env_overrides(cfg: &mut Config, warnings: &mut WarningStack) -> Result<(), ConfigError> {
    override_from_env(&mut cfg.workers, "RILL_WORKERS", warnings)?;
    override_from_env(&mut cfg.batch_size, "RILL_BATCH_SIZE", warnings)?;
    override_from_env(&mut cfg.seed, "RILL_SEED", warnings)?;
    override_from_env(&mut cfg.failure_probability, "RILL_FAILURE_PROBABILITY", warnings)?;
    if let Ok(root) = env::var("RILL_DATA_ROOT") {
        warnings.push(format!("data root overridden from the environment: {}", root));
        cfg.data_root = PathBuf::from(root);
    }
    if let Ok(experiment) = env::var("RILL_EXPERIMENT") {
        cfg.experiment = experiment;
    }
    Ok(())
}

fn override_from_env<T: std::str::FromStr>(
    target: &mut T,
    var: &str,
    warnings: &mut WarningStack,
) -> Result<(), ConfigError> {
    match env::var(var) {
        Ok(raw) => match raw.parse() {
            Ok(value) => {
                warnings.push(format!("{} overridden from the environment", var));
                *target = value;
                Ok(())
            }
            Err(_) => Err(ConfigError::OnParse(format!(
                "{} has an unparseable value {:?}",
                var, raw
            ))),
        },
        Err(_) => Ok(()),
    }
}

fn set_if<T>(target: &mut T, source: Option<T>) {
    if let Some(value) = source {
        *target = value;
    }
}

fn apply_delay(target: &mut DelayProfile, source: Option<[f64; 2]>) {
    if let Some([mu, sigma]) = source {
        *target = DelayProfile::new(mu, sigma);
    }
}

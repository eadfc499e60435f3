/*
 * Created on Mon Mar 25 2024
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

//! Feedback for configuration resolution: hard errors abort startup,
//! warnings accumulate and are printed once the logger is up

use std::fmt;

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    OnRead(String),
    OnParse(String),
    OnValidate(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnRead(e) => write!(f, "failed to read the configuration: {}", e),
            Self::OnParse(e) => write!(f, "failed to parse the configuration: {}", e),
            Self::OnValidate(e) => write!(f, "bad configuration: {}", e),
        }
    }
}

/// Warnings that shouldn't stop the daemon but should be seen
#[derive(Debug, Default)]
pub struct WarningStack {
    stack: Vec<String>,
}

impl WarningStack {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, warning: impl ToString) {
        self.stack.push(warning.to_string());
    }
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
    /// Print everything through the logger
    pub fn print_warnings(&self) {
        for warning in &self.stack {
            log::warn!("{}", warning);
        }
    }
}

impl fmt::Display for WarningStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for warning in &self.stack {
            writeln!(f, "warning: {}", warning)?;
        }
        Ok(())
    }
}

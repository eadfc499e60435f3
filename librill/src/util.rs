/*
 * Created on Mon Jan 15 2024
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

pub mod terminal {
    //! Colored verdict output
    //!
    //! The daemon's last line tells the operator whether the distributed
    //! result matched the reference; that line (and only that line) goes
    //! through here so it stands out from the surrounding log stream.
    use std::fmt;
    use std::io::Write;
    use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

    fn write_verdict<T: fmt::Display>(item: T, color: Color) -> fmt::Result {
        let mut stdout = StandardStream::stdout(ColorChoice::Always);
        stdout
            .set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))
            .map_err(|_| fmt::Error)?;
        write!(&mut stdout, "{}", item).map_err(|_| fmt::Error)?;
        stdout.reset().map_err(|_| fmt::Error)
    }

    /// A run that ended well: bold green
    pub fn write_success<T: fmt::Display>(item: T) -> fmt::Result {
        write_verdict(item, Color::Green)
    }

    /// A run that produced a wrong result: bold red
    pub fn write_error<T: fmt::Display>(item: T) -> fmt::Result {
        write_verdict(item, Color::Red)
    }
}

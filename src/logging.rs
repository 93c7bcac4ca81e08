// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Global logger shared by all board workers
//!
//! Terminal output is filtered by `RUST_LOG` (defaults to `info`). When `BF16_LOG_FILE` is set,
//! every record is duplicated into that file as well.

use std::env;
use std::fs::OpenOptions;

use lazy_static::lazy_static;
use slog::{o, Drain, Duplicate, Level, LevelFilter, Logger};
use slog_async;
use slog_envlogger;
use slog_term;

/// Environment variable with an optional path of the log file
pub const LOG_FILE_ENV: &str = "BF16_LOG_FILE";

lazy_static! {
    /// Build static reference to the logger that will be accessible from all modules
    pub static ref LOGGER: Logger = {
        let level = Level::Trace;

        // envlogger doesn't allow to set default log level, so this is a workaround
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", "info");
        }

        // Setup drain for terminal output
        let terminal_decorator = slog_term::TermDecorator::new().build();
        let terminal_drain = slog_term::FullFormat::new(terminal_decorator).build().fuse();
        let terminal_drain = LevelFilter::new(terminal_drain, level).fuse();
        let terminal_drain = slog_envlogger::new(terminal_drain);
        let terminal_drain = slog_async::Async::new(terminal_drain).build().fuse();

        let file = env::var(LOG_FILE_ENV).ok().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .append(true)
                .open(path)
                .ok()
        });

        match file {
            Some(file) => {
                let file_decorator = slog_term::PlainDecorator::new(file);
                let file_drain = slog_term::FullFormat::new(file_decorator).build().fuse();
                let file_drain = LevelFilter::new(file_drain, level).fuse();
                let file_drain = slog_async::Async::new(file_drain).build().fuse();

                let composite_drain = Duplicate::new(terminal_drain, file_drain).fuse();
                Logger::root(composite_drain, o!())
            }
            None => Logger::root(terminal_drain, o!()),
        }
    };
}

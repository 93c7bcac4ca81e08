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

use bosminer_bf16::config;
use bosminer_bf16::error::{self, ErrorKind};
use bosminer_bf16::logging::LOGGER;
use bosminer_bf16::test_utils::TEST_BLOCKS;
use bosminer_bf16::work::{NonceSink, PoolWork};
use bosminer_bf16::Driver;

use byteorder::{ByteOrder, LittleEndian};
use slog::{error, info};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Offset of the ntime field in a block header
const NTIME_OFFSET: usize = 68;
/// Time given to workers to finish
const HALT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sink logging every solution found by the boards
#[derive(Default)]
struct LoggingSink {
    found: AtomicUsize,
}

impl NonceSink for LoggingSink {
    fn submit(&self, work: &Arc<PoolWork>, nonce: u32, ntime: u32) {
        let found = self.found.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            LOGGER,
            "Solution #{}: work {} nonce {:#010x} ntime {:#x}", found, work.id, nonce, ntime
        );
    }
}

fn parse_header(text: &str) -> error::Result<[u8; 80]> {
    let bytes = hex::decode(text)
        .map_err(|e| ErrorKind::General(format!("invalid header hex: {}", e)))?;
    if bytes.len() != 80 {
        Err(ErrorKind::General(format!(
            "header has {} bytes, expected 80",
            bytes.len()
        )))?
    }
    let mut header = [0u8; 80];
    header.copy_from_slice(&bytes);
    Ok(header)
}

fn main() {
    let app = clap::App::new("bf16-hashboard-test")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("header")
                .long("header")
                .value_name("HEX")
                .help("Block header (80 bytes) to mine on, ntime is rolled")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Stop mining after this time")
                .required(false)
                .takes_value(true),
        );

    let matches = app.get_matches();
    let config_path = matches
        .value_of("config")
        .unwrap_or(config::DEFAULT_CONFIG_PATH);

    let config = match config::parse(config_path) {
        Err(e) => {
            error!(LOGGER, "Cannot load configuration file \"{}\"", config_path);
            error!(LOGGER, "Reason: {}", e);
            return;
        }
        Ok(v) => v,
    };

    let header = match matches.value_of("header").map(parse_header) {
        None => TEST_BLOCKS[0].header_bytes,
        Some(Ok(header)) => header,
        Some(Err(e)) => {
            error!(LOGGER, "{}", e);
            return;
        }
    };

    let duration = match matches.value_of("duration").map(|v| v.parse::<u64>()) {
        None => Duration::from_secs(60),
        Some(Ok(secs)) => Duration::from_secs(secs),
        Some(Err(e)) => {
            error!(LOGGER, "Invalid duration: {}", e);
            return;
        }
    };

    let poll = config.timing.worker_poll();
    let sink = Arc::new(LoggingSink::default());
    let mut driver = match Driver::open(config, sink.clone()) {
        Err(e) => {
            error!(LOGGER, "Cannot open hashboards: {}", e);
            return;
        }
        Ok(v) => v,
    };
    if let Err(e) = driver.start() {
        error!(LOGGER, "Cannot start hashboards: {}", e);
        if let Err(e) = driver.stop(HALT_TIMEOUT) {
            error!(LOGGER, "{}", e);
        }
        return;
    }

    let ntime = LittleEndian::read_u32(&header[NTIME_OFFSET..]);
    let deadline = Instant::now() + duration;
    let mut id = 0u64;
    while Instant::now() < deadline {
        while driver.needs_work() {
            let mut rolled = header;
            LittleEndian::write_u32(&mut rolled[NTIME_OFFSET..], ntime.wrapping_add(id as u32));
            driver.enqueue_work(Arc::new(PoolWork::from_header(id, &rolled)));
            id += 1;
        }
        thread::sleep(poll);
    }

    if let Err(e) = driver.stop(HALT_TIMEOUT) {
        error!(LOGGER, "{}", e);
    }
    info!(
        LOGGER,
        "Finished: {} works, {} solutions",
        id,
        sink.found.load(Ordering::SeqCst)
    );
}

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

//! This module handles driver configuration and configuration file parsing

use crate::bf16::{self, ChipAddress};
use crate::chip::LifecycleParams;
use crate::error::{self, ErrorKind};
use crate::renonce::DEFAULT_STAGE_BITS;
use crate::task::MAX_MASK_BITS;

use serde::{Deserialize, Serialize};

use std::collections::HashSet;
use std::time::Duration;

/// Location of default config
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bosminer-bf16.toml";

pub const DEFAULT_SPI_DEVICE: &str = "/dev/spidev0.0";
pub const DEFAULT_CHAINS: usize = 2;
pub const DEFAULT_CONCENTRATORS_PER_CHAIN: usize = 4;
pub const DEFAULT_CHIPS_PER_CONCENTRATOR: usize = bf16::CHIPS_PER_CONCENTRATOR;

/// Default chip clock register value and prescaler
pub const DEFAULT_CLOCK: u8 = 0x36;
pub const DEFAULT_PRESCALER: u8 = 0;

/// Task iterations before a chip gets initialized again
pub const DEFAULT_RESTART_LIMIT: u32 = 1000;
pub const DEFAULT_WORK_QUEUE_LEN: usize = 64;
pub const DEFAULT_NTIME_ROLL: u32 = 1;

pub const DEFAULT_STATUS_POLL_MS: u64 = 20;
pub const DEFAULT_TASK_SWITCH_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_GOOD_NONCE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_ERROR_RATE_LIMIT: usize = 10;
pub const DEFAULT_FAILING_BACKOFF_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 5;
pub const DEFAULT_WORKER_POLL_MS: u64 = 20;
pub const DEFAULT_STATS_PERIOD_S: u64 = 30;

/// Temperature at which the power chain is switched off
pub const DEFAULT_MAX_TEMPERATURE: f32 = 95.0;
pub const DEFAULT_MONITOR_PERIOD_MS: u64 = 1_000;

/// Chip inside a board
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChipLocation {
    pub concentrator: usize,
    pub chip: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BoardConfig {
    pub id: usize,
    pub spi_device: String,
    pub channel: u8,
    pub chains: usize,
    pub concentrators_per_chain: usize,
    pub chips_per_concentrator: usize,
    /// sysfs GPIO number of the active low reset line
    pub reset_gpio: Option<u64>,
    /// Chip verifying uncertain nonces, the first chip when not set
    pub renonce_chip: Option<ChipLocation>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            id: 0,
            spi_device: DEFAULT_SPI_DEVICE.to_string(),
            channel: 0,
            chains: DEFAULT_CHAINS,
            concentrators_per_chain: DEFAULT_CONCENTRATORS_PER_CHAIN,
            chips_per_concentrator: DEFAULT_CHIPS_PER_CONCENTRATOR,
            reset_gpio: None,
            renonce_chip: None,
        }
    }
}

impl BoardConfig {
    pub fn concentrators(&self) -> usize {
        self.chains * self.concentrators_per_chain
    }

    pub fn chip_count(&self) -> usize {
        self.concentrators() * self.chips_per_concentrator
    }

    /// Addresses of all chips on the board in scheduling order
    pub fn chip_addresses(&self) -> Vec<ChipAddress> {
        let mut addresses = Vec::with_capacity(self.chip_count());
        for concentrator in 0..self.concentrators() {
            for chip in 0..self.chips_per_concentrator {
                addresses.push(ChipAddress::new(self.id, concentrator, chip as u8));
            }
        }
        addresses
    }

    /// Position of `addr` in [`BoardConfig::chip_addresses`]
    pub fn chip_index(&self, addr: ChipAddress) -> Option<usize> {
        if addr.board != self.id
            || addr.concentrator >= self.concentrators()
            || addr.chip as usize >= self.chips_per_concentrator
        {
            return None;
        }
        Some(addr.concentrator * self.chips_per_concentrator + addr.chip as usize)
    }

    pub fn renonce_chip_address(&self) -> ChipAddress {
        let location = self.renonce_chip.unwrap_or(ChipLocation {
            concentrator: 0,
            chip: 0,
        });
        ChipAddress::new(self.id, location.concentrator, location.chip)
    }

    pub fn validate(&self) -> error::Result<()> {
        let invalid = |msg: String| ErrorKind::Config(format!("board {}: {}", self.id, msg));
        if self.chains == 0 || self.chains > 2 {
            Err(invalid(format!("{} chains, expected 1 or 2", self.chains)))?
        }
        if self.concentrators_per_chain == 0 {
            Err(invalid("no concentrators".to_string()))?
        }
        if self.chips_per_concentrator == 0
            || self.chips_per_concentrator > bf16::CHIPS_PER_CONCENTRATOR
        {
            Err(invalid(format!(
                "{} chips per concentrator, expected 1 to {}",
                self.chips_per_concentrator,
                bf16::CHIPS_PER_CONCENTRATOR
            )))?
        }
        if let Some(location) = self.renonce_chip {
            if location.concentrator >= self.concentrators()
                || location.chip as usize >= self.chips_per_concentrator
            {
                Err(invalid(format!(
                    "renonce chip {}:{} does not exist",
                    location.concentrator, location.chip
                )))?
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ChipConfig {
    pub clock: u8,
    pub prescaler: u8,
    pub restart_limit: u32,
    pub work_queue_len: usize,
    pub ntime_roll: u32,
}

impl Default for ChipConfig {
    fn default() -> Self {
        Self {
            clock: DEFAULT_CLOCK,
            prescaler: DEFAULT_PRESCALER,
            restart_limit: DEFAULT_RESTART_LIMIT,
            work_queue_len: DEFAULT_WORK_QUEUE_LEN,
            ntime_roll: DEFAULT_NTIME_ROLL,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RenonceConfig {
    pub enabled: bool,
    pub mask_bits: [u8; 4],
}

impl Default for RenonceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mask_bits: DEFAULT_STAGE_BITS,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub status_poll_ms: u64,
    pub task_switch_timeout_ms: u64,
    pub good_nonce_timeout_ms: u64,
    /// Errors per second
    pub error_rate_limit: usize,
    /// Backoff per recovery attempt
    pub failing_backoff_ms: u64,
    pub max_recovery_attempts: u32,
    pub worker_poll_ms: u64,
    pub stats_period_s: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            status_poll_ms: DEFAULT_STATUS_POLL_MS,
            task_switch_timeout_ms: DEFAULT_TASK_SWITCH_TIMEOUT_MS,
            good_nonce_timeout_ms: DEFAULT_GOOD_NONCE_TIMEOUT_MS,
            error_rate_limit: DEFAULT_ERROR_RATE_LIMIT,
            failing_backoff_ms: DEFAULT_FAILING_BACKOFF_MS,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            worker_poll_ms: DEFAULT_WORKER_POLL_MS,
            stats_period_s: DEFAULT_STATS_PERIOD_S,
        }
    }
}

impl TimingConfig {
    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn stats_period(&self) -> Duration {
        Duration::from_secs(self.stats_period_s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub max_temperature: f32,
    pub period_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_temperature: DEFAULT_MAX_TEMPERATURE,
            period_ms: DEFAULT_MONITOR_PERIOD_MS,
        }
    }
}

impl MonitorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub boards: Vec<BoardConfig>,
    pub chip: ChipConfig,
    pub renonce: RenonceConfig,
    pub timing: TimingConfig,
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            boards: vec![BoardConfig::default()],
            chip: Default::default(),
            renonce: Default::default(),
            timing: Default::default(),
            monitor: Default::default(),
        }
    }
}

impl Config {
    /// Check value ranges and board topology
    pub fn validate(&self) -> error::Result<()> {
        if self.boards.is_empty() {
            Err(ErrorKind::Config("no boards configured".to_string()))?
        }
        let mut ids = HashSet::new();
        for board in self.boards.iter() {
            if !ids.insert(board.id) {
                Err(ErrorKind::Config(format!("duplicate board id {}", board.id)))?
            }
            board.validate()?;
        }
        bf16::ClockReg::new(self.chip.clock, self.chip.prescaler)
            .map_err(|e| ErrorKind::Config(e.to_string()))?;
        if let Some(bits) = self.renonce.mask_bits.iter().find(|bits| **bits > MAX_MASK_BITS) {
            Err(ErrorKind::Config(format!(
                "renonce mask of {} bits, maximum is {}",
                bits, MAX_MASK_BITS
            )))?
        }
        if self.chip.work_queue_len == 0 || self.chip.ntime_roll == 0 {
            Err(ErrorKind::Config(
                "work queue length and ntime roll must be positive".to_string(),
            ))?
        }
        Ok(())
    }

    /// Chip lifecycle policy derived from this configuration
    pub fn lifecycle_params(&self) -> error::Result<LifecycleParams> {
        Ok(LifecycleParams {
            clock_word: bf16::generate_clock_word(self.chip.clock, self.chip.prescaler)?,
            default_mask: 0,
            status_poll_interval: Duration::from_millis(self.timing.status_poll_ms),
            task_switch_timeout: Duration::from_millis(self.timing.task_switch_timeout_ms),
            good_nonce_timeout: Duration::from_millis(self.timing.good_nonce_timeout_ms),
            error_rate_limit: self.timing.error_rate_limit,
            failing_backoff: Duration::from_millis(self.timing.failing_backoff_ms),
            max_recovery_attempts: self.timing.max_recovery_attempts,
            restart_limit: self.chip.restart_limit,
        })
    }
}

/// Parse and validate a configuration file from `config_path`.
pub fn parse(config_path: &str) -> error::Result<Config> {
    let mut settings = config::Config::default();
    settings
        .merge(config::File::with_name(config_path))
        .map_err(|e| ErrorKind::Config(format!("{}", e)))?;

    // Parse it into structure
    let config: Config = settings
        .try_into()
        .map_err(|e| ErrorKind::Config(format!("{}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[[boards]]
id = 0
spi_device = "/dev/spidev1.0"
channel = 1
chains = 1
concentrators_per_chain = 3
reset_gpio = 907
renonce_chip = { concentrator = 2, chip = 10 }

[[boards]]
id = 1

[chip]
clock = 0x20
prescaler = 1
ntime_roll = 4

[renonce]
mask_bits = [16, 18, 20, 22]

[timing]
status_poll_ms = 50
"#;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").expect("empty config");
        assert_eq!(config, Config::default());
        config.validate().expect("default config is valid");
        let board = &config.boards[0];
        assert_eq!(board.chip_count(), 88);
        assert_eq!(board.renonce_chip_address(), ChipAddress::new(0, 0, 0));
    }

    #[test]
    fn test_sample_config() {
        let config: Config = toml::from_str(SAMPLE).expect("sample config");
        config.validate().expect("sample config is valid");
        assert_eq!(config.boards.len(), 2);
        let board = &config.boards[0];
        assert_eq!(board.spi_device, "/dev/spidev1.0");
        assert_eq!(board.concentrators(), 3);
        assert_eq!(board.reset_gpio, Some(907));
        assert_eq!(board.renonce_chip_address(), ChipAddress::new(0, 2, 10));
        assert_eq!(board.chip_addresses().len(), 33);
        for (index, addr) in board.chip_addresses().iter().enumerate() {
            assert_eq!(board.chip_index(*addr), Some(index));
        }
        assert_eq!(board.chip_index(ChipAddress::new(0, 3, 0)), None);
        assert_eq!(board.chip_index(ChipAddress::new(1, 0, 0)), None);
        assert_eq!(config.boards[1], BoardConfig { id: 1, ..Default::default() });
        assert_eq!(config.chip.ntime_roll, 4);
        assert_eq!(config.renonce.mask_bits, [16, 18, 20, 22]);
        assert_eq!(config.timing.status_poll_ms, 50);
        assert_eq!(config.timing.worker_poll_ms, DEFAULT_WORKER_POLL_MS);

        let params = config.lifecycle_params().expect("params");
        assert_eq!(params.clock_word, [0x60, 0x00, 0x8c, 0x03]);
        assert_eq!(params.status_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            "[chip]\nclock = 0x40",
            "[chip]\nprescaler = 2",
            "[[boards]]\nchips_per_concentrator = 12",
            "[[boards]]\nchains = 3",
            "[[boards]]\nid = 1\n[[boards]]\nid = 1",
            "[[boards]]\nrenonce_chip = { concentrator = 8, chip = 0 }",
            "[renonce]\nmask_bits = [16, 16, 20, 28]",
            "boards = []",
        ];
        for case in cases.iter() {
            let config: Config = toml::from_str(case).expect("parse");
            assert!(config.validate().is_err(), "accepted invalid config: {}", case);
        }
        assert!(toml::from_str::<Config>("[chip]\nunknown = 1").is_err());
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write config");
        let path = file.path().to_str().expect("path").to_string();

        let config = parse(&path).expect("parse config file");
        assert_eq!(config, toml::from_str::<Config>(SAMPLE).expect("sample"));

        assert!(parse("/nonexistent/bosminer-bf16.toml").is_err());
    }
}

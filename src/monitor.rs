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

//! This module watches board health through the housekeeping collaborator and switches the
//! power chain off when the board overheats or stops reporting.

use crate::config::MonitorConfig;
use crate::error;
use crate::logging::LOGGER;

use slog::{error, info, warn};

/// Consecutive failed health reads after which the board is considered broken
pub const MAX_READ_FAILURES: u32 = 3;

/// Snapshot of board housekeeping values
#[derive(Debug, Clone, PartialEq)]
pub struct BoardHealth {
    /// Hottest sensor of the board, `None` when no sensor could be read
    pub temperature: Option<f32>,
    /// Power chain is up
    pub power_on: bool,
}

/// Board housekeeping (sensors, power chain) provided by the surrounding driver
pub trait BoardControl: Send {
    fn read_health(&mut self) -> error::Result<BoardHealth>;
    fn set_power_chain(&mut self, on: bool) -> error::Result<()>;
}

/// Interpreted board temperature
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoardTemperature {
    /// Temperature unknown... in a good way (no sensor, chain off)
    Unknown,
    /// Temperature unknown... in a bad way (sensors stopped responding)
    Failed,
    /// Temperature was measured
    Ok(f32),
}

/// State of the board power chain as seen by the monitor
#[derive(Debug, Clone, PartialEq)]
pub enum ChainState {
    On,
    /// Switched off for good (no way out)
    Shutdown(&'static str),
}

pub struct Monitor {
    board: usize,
    control: Box<dyn BoardControl>,
    config: MonitorConfig,
    read_failures: u32,
    state: ChainState,
    last_temperature: BoardTemperature,
}

impl Monitor {
    pub fn new(board: usize, control: Box<dyn BoardControl>, config: MonitorConfig) -> Self {
        Self {
            board,
            control,
            config,
            read_failures: 0,
            state: ChainState::On,
            last_temperature: BoardTemperature::Unknown,
        }
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn temperature(&self) -> BoardTemperature {
        self.last_temperature
    }

    pub fn is_powered(&self) -> bool {
        self.state == ChainState::On
    }

    /// Read board health, a failed read keeps the power chain state unknown (assumed on)
    fn read_health(&mut self) -> (BoardTemperature, bool) {
        match self.control.read_health() {
            Ok(health) => {
                self.read_failures = 0;
                let temperature = match health.temperature {
                    Some(temperature) => BoardTemperature::Ok(temperature),
                    None => BoardTemperature::Unknown,
                };
                (temperature, health.power_on)
            }
            Err(e) => {
                self.read_failures += 1;
                warn!(
                    LOGGER,
                    "Board {}: health read failed ({} in a row): {}",
                    self.board,
                    self.read_failures,
                    e
                );
                let temperature = if self.read_failures >= MAX_READ_FAILURES {
                    BoardTemperature::Failed
                } else {
                    self.last_temperature
                };
                (temperature, true)
            }
        }
    }

    fn shutdown(&mut self, reason: &'static str) {
        error!(LOGGER, "Board {}: {}, switching power chain off", self.board, reason);
        if let Err(e) = self.control.set_power_chain(false) {
            error!(LOGGER, "Board {}: cannot switch power chain off: {}", self.board, e);
        }
        self.state = ChainState::Shutdown(reason);
    }

    /// One monitoring pass, returns whether the chain stays powered
    pub fn step(&mut self) -> bool {
        if !self.is_powered() {
            return false;
        }
        let (temperature, power_on) = self.read_health();
        if !power_on {
            self.shutdown("power chain lost");
            return false;
        }
        if temperature != self.last_temperature {
            if let BoardTemperature::Ok(value) = temperature {
                info!(LOGGER, "Board {}: temperature {:.1} C", self.board, value);
            }
        }
        self.last_temperature = temperature;
        match temperature {
            BoardTemperature::Ok(value) if value >= self.config.max_temperature => {
                self.shutdown("temperature limit reached")
            }
            BoardTemperature::Failed => self.shutdown("sensors failed"),
            _ => (),
        }
        self.is_powered()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Shared {
        readings: Vec<Option<Option<f32>>>,
        power: Vec<bool>,
        chain_down: bool,
    }

    /// Replays prepared readings, `None` is a failed read
    struct FakeControl(Arc<Mutex<Shared>>);

    impl BoardControl for FakeControl {
        fn read_health(&mut self) -> error::Result<BoardHealth> {
            let mut shared = self.0.lock().expect("lock");
            match shared.readings.remove(0) {
                Some(temperature) => Ok(BoardHealth {
                    temperature,
                    power_on: !shared.chain_down,
                }),
                None => Err(ErrorKind::General("i2c timeout".to_string()).into()),
            }
        }

        fn set_power_chain(&mut self, on: bool) -> error::Result<()> {
            self.0.lock().expect("lock").power.push(on);
            Ok(())
        }
    }

    fn monitor(readings: Vec<Option<Option<f32>>>) -> (Monitor, Arc<Mutex<Shared>>) {
        let shared = Arc::new(Mutex::new(Shared {
            readings,
            power: vec![],
            chain_down: false,
        }));
        let monitor = Monitor::new(
            0,
            Box::new(FakeControl(shared.clone())),
            MonitorConfig::default(),
        );
        (monitor, shared)
    }

    #[test]
    fn test_overtemperature_shutdown() {
        let (mut monitor, shared) = monitor(vec![Some(Some(70.0)), Some(None), Some(Some(96.5))]);
        assert!(monitor.step());
        assert_eq!(monitor.temperature(), BoardTemperature::Ok(70.0));
        assert!(monitor.step());
        assert_eq!(monitor.temperature(), BoardTemperature::Unknown);
        assert!(!monitor.step(), "board above limit must be switched off");
        assert_eq!(
            monitor.state(),
            &ChainState::Shutdown("temperature limit reached")
        );
        assert_eq!(shared.lock().expect("lock").power, vec![false]);
        // no way out, no more reads
        assert!(!monitor.step());
    }

    #[test]
    fn test_failed_reads() {
        let (mut monitor, shared) = monitor(vec![Some(Some(60.0)), None, None, Some(Some(61.0))]);
        assert!(monitor.step());
        assert!(monitor.step());
        assert!(monitor.step());
        assert_eq!(monitor.temperature(), BoardTemperature::Ok(60.0));
        assert!(monitor.step());
        assert!(shared.lock().expect("lock").power.is_empty());

        let (mut monitor, shared) = monitor_failing();
        for _ in 1..MAX_READ_FAILURES {
            assert!(monitor.step());
        }
        assert!(!monitor.step());
        assert_eq!(monitor.temperature(), BoardTemperature::Failed);
        assert_eq!(shared.lock().expect("lock").power, vec![false]);
    }

    #[test]
    fn test_lost_power_chain() {
        let (mut monitor, shared) = monitor(vec![Some(Some(60.0)), Some(Some(60.0))]);
        assert!(monitor.step());
        shared.lock().expect("lock").chain_down = true;
        assert!(!monitor.step());
        assert_eq!(monitor.state(), &ChainState::Shutdown("power chain lost"));
        assert_eq!(shared.lock().expect("lock").power, vec![false]);
    }

    fn monitor_failing() -> (Monitor, Arc<Mutex<Shared>>) {
        monitor(vec![None; MAX_READ_FAILURES as usize])
    }
}

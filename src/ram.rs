/*
 * This file is part of Ringmon.
 *
 * Copyright (C) 2026 Ringmon contributors
 *
 * Ringmon is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Ringmon is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Ringmon. If not, see <https://www.gnu.org/licenses/>.
 */

//! System memory telemetry from the OS memory-status query.

use std::fs;

use crate::tree::{
    Group, Hardware, HardwareType, Identifier, Observers, Sensor, SensorBank, SensorId, SensorType,
};

const MEMINFO_PATH: &str = "/proc/meminfo";
const KIB_PER_GIB: f64 = 1024.0 * 1024.0;

/// Extract a kB-valued field from /proc/meminfo text.
fn meminfo_field(text: &str, key: &str) -> Option<u64> {
    for line in text.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == key {
            return rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    None
}

pub struct Ram {
    identifier: Identifier,
    bank: SensorBank,
    load: SensorId,
    used: SensorId,
    available: SensorId,
    closed: bool,
}

impl Ram {
    pub fn new(observers: Observers) -> Ram {
        let identifier = Identifier::new(&["ram"]);
        let mut bank = SensorBank::new(identifier.clone(), observers);
        let load = bank.add(Sensor::new("Memory", 0, SensorType::Load, &identifier));
        let used = bank.add(Sensor::new("Used Memory", 0, SensorType::Data, &identifier));
        let available = bank.add(Sensor::new("Available Memory", 1, SensorType::Data, &identifier));
        Ram {
            identifier,
            bank,
            load,
            used,
            available,
            closed: false,
        }
    }

    fn apply(&mut self, text: &str) {
        let (Some(total), Some(avail)) = (
            meminfo_field(text, "MemTotal"),
            meminfo_field(text, "MemAvailable"),
        ) else {
            self.bank.retract(self.load);
            self.bank.retract(self.used);
            self.bank.retract(self.available);
            return;
        };
        let used = total.saturating_sub(avail);
        self.bank
            .publish(self.load, (used as f64 / total as f64 * 100.0) as f32);
        self.bank.publish(self.used, (used as f64 / KIB_PER_GIB) as f32);
        self.bank
            .publish(self.available, (avail as f64 / KIB_PER_GIB) as f32);
    }
}

impl Hardware for Ram {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn name(&self) -> &str {
        "Memory"
    }

    fn hardware_type(&self) -> HardwareType {
        HardwareType::Memory
    }

    fn update(&mut self) {
        if self.closed {
            return;
        }
        match fs::read_to_string(MEMINFO_PATH) {
            Ok(text) => self.apply(&text),
            Err(_) => {
                self.bank.retract(self.load);
                self.bank.retract(self.used);
                self.bank.retract(self.available);
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn sensors(&self) -> Vec<&Sensor> {
        self.bank.active()
    }

    fn all_sensors(&self) -> Vec<&Sensor> {
        self.bank.all().iter().collect()
    }
}

/// Fixed probe; always yields exactly one memory node.
pub struct RamGroup {
    hardware: Vec<Box<dyn Hardware>>,
}

impl RamGroup {
    pub fn new(observers: Observers) -> RamGroup {
        RamGroup {
            hardware: vec![Box::new(Ram::new(observers))],
        }
    }
}

impl Group for RamGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.hardware.iter().map(|h| h.as_ref() as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.hardware.iter_mut().map(|h| h.as_mut() as &mut dyn Hardware).collect()
    }

    fn close(&mut self) {
        for h in &mut self.hardware {
            h.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
MemTotal:       16384000 kB
MemFree:         1024000 kB
MemAvailable:    8192000 kB
Buffers:          512000 kB
";

    #[test]
    fn test_meminfo_field_parse() {
        assert_eq!(meminfo_field(SAMPLE, "MemTotal"), Some(16_384_000));
        assert_eq!(meminfo_field(SAMPLE, "MemAvailable"), Some(8_192_000));
        assert_eq!(meminfo_field(SAMPLE, "Missing"), None);
    }

    #[test]
    fn test_apply_publishes_load_and_data() {
        let mut ram = Ram::new(Observers::new());
        ram.apply(SAMPLE);
        assert_eq!(ram.bank.get(ram.load).value(), Some(50.0));
        let used = ram.bank.get(ram.used).value().unwrap();
        assert!((used - 7.8125).abs() < 0.001);
        assert_eq!(ram.sensors().len(), 3);
    }

    #[test]
    fn test_apply_retracts_on_malformed_input() {
        let mut ram = Ram::new(Observers::new());
        ram.apply(SAMPLE);
        ram.apply("garbage");
        assert!(ram.sensors().is_empty());
        // Slots survive for re-activation.
        assert_eq!(ram.all_sensors().len(), 3);
    }

    #[test]
    fn test_update_against_live_meminfo() {
        let mut ram = Ram::new(Observers::new());
        ram.update();
        // On any Linux box this succeeds; load is a percentage.
        if let Some(load) = ram.bank.get(ram.load).value() {
            assert!((0.0..=100.0).contains(&load));
        }
    }
}

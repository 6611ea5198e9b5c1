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

//! Report tool: enable every group, run one update traversal, print the
//! report, exit 0. `--json` dumps the active sensors as JSON instead.

use std::fs;

use anyhow::Result;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ringmon::computer::Computer;
use ringmon::cpu::{CpuGroup, CpuInfo};
use ringmon::hid_sensor::HidSensorGroup;
use ringmon::ram::RamGroup;
use ringmon::ring0::Ring0;
use ringmon::serial_fan::SerialFanGroup;
use ringmon::tree::Observers;

#[derive(Serialize)]
struct SensorRecord {
    hardware: String,
    identifier: String,
    name: String,
    sensor_type: String,
    value: Option<f32>,
}

/// TSC calibration stand-in: the current core clock as reported by the
/// kernel. Good enough for a one-shot report.
fn tsc_frequency_mhz() -> f64 {
    fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|text| {
            text.lines()
                .find(|l| l.starts_with("cpu MHz"))
                .and_then(|l| l.split(':').nth(1))
                .and_then(|v| v.trim().parse().ok())
        })
        .unwrap_or(1000.0)
}

fn build_computer() -> Computer {
    let observers = Observers::new();
    let ring0 = Ring0::shared();
    ring0.open();

    let mut computer = Computer::new(observers.clone());

    let packages = fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|text| CpuInfo::from_proc_cpuinfo(&text, tsc_frequency_mhz()))
        .map(|info| vec![info])
        .unwrap_or_default();
    computer.add_group(Box::new(CpuGroup::new(packages, ring0.clone(), observers.clone())));
    computer.add_group(Box::new(RamGroup::new(observers.clone())));
    computer.add_group(Box::new(SerialFanGroup::new(observers.clone())));
    computer.add_group(Box::new(HidSensorGroup::new(observers)));
    computer
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let json = std::env::args().any(|a| a == "--json");

    let mut computer = build_computer();
    computer.update();

    if json {
        let records: Vec<SensorRecord> = computer
            .hardware()
            .iter()
            .flat_map(|hardware| {
                hardware.sensors().into_iter().map(move |sensor| SensorRecord {
                    hardware: hardware.identifier().to_string(),
                    identifier: sensor.identifier().to_string(),
                    name: sensor.name().to_string(),
                    sensor_type: format!("{:?}", sensor.sensor_type()),
                    value: sensor.value(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", computer.report());
        let ring0_report = Ring0::shared().report();
        if !ring0_report.is_empty() {
            print!("{}", ring0_report);
        }
    }

    computer.close();
    Ok(())
}

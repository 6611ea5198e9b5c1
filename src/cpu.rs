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

//! AMD family 0Fh (K8) telemetry decoded from CPU registers.
//!
//! Temperatures come from the thermtrip status register in the PCI
//! miscellaneous-control function; the core to sample is selected by
//! writing a one-byte code first. Which code addresses which core was
//! swapped between silicon revisions, keyed on an undocumented model-id
//! threshold; the values below are field-verified and must not be
//! "cleaned up". Clocks come from the FID/VID status MSR, read pinned to
//! each logical processor in turn.

use tracing::trace;

use crate::ring0::{PciAddress, Ring0};
use crate::tree::{
    Group, Hardware, HardwareType, Identifier, Observers, Parameter, Sensor, SensorBank, SensorId,
    SensorType,
};

const FIDVID_STATUS: u32 = 0xC001_0042;

const MISCELLANEOUS_CONTROL_FUNCTION: u8 = 3;
const MISCELLANEOUS_CONTROL_DEVICE_ID: u16 = 0x1103;
const AMD_VENDOR_ID: u16 = 0x1022;
/// PCI device number of the first processor node.
const PCI_BASE_DEVICE: u8 = 0x18;

const THERMTRIP_STATUS_REGISTER: u32 = 0xE4;

pub const FAMILY_0F: u32 = 0x0F;

/// CPU identification and calibration data, supplied by the caller.
/// Topology and feature enumeration is outside this crate.
#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub name: String,
    pub family: u32,
    pub model: u32,
    /// Logical processor index for each core, in core order.
    pub core_threads: Vec<usize>,
    /// Whether the package has a digital thermal sensor.
    pub has_thermal_sensor: bool,
    /// Whether an invariant timestamp counter is available.
    pub has_tsc: bool,
    /// Calibrated timestamp-counter frequency in MHz.
    pub tsc_frequency_mhz: f64,
}

impl CpuInfo {
    /// Best-effort identification from /proc/cpuinfo text. Only fills the
    /// fields this crate needs; returns None when the vendor is not AMD.
    pub fn from_proc_cpuinfo(text: &str, tsc_frequency_mhz: f64) -> Option<CpuInfo> {
        let mut name = String::new();
        let mut vendor = String::new();
        let mut family = 0u32;
        let mut model = 0u32;
        let mut logical = 0usize;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "processor" => logical += 1,
                "vendor_id" if vendor.is_empty() => vendor = value.to_string(),
                "model name" if name.is_empty() => name = value.to_string(),
                "cpu family" if family == 0 => family = value.parse().unwrap_or(0),
                "model" if model == 0 => model = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        if vendor != "AuthenticAMD" || logical == 0 {
            return None;
        }

        Some(CpuInfo {
            name,
            family,
            model,
            // Family 0Fh has no SMT; one thread per core.
            core_threads: (0..logical).collect(),
            has_thermal_sensor: true,
            has_tsc: true,
            tsc_frequency_mhz,
        })
    }
}

/// Current and maximum FID multipliers from the FID/VID status register.
/// CurrFID lives in eax bits 0-5, MaxFID in bits 16-21 (bits 8-13 hold
/// StartFID, unused here).
pub fn fid_multipliers(eax: u32) -> (f64, f64) {
    let current = 0.5 * ((eax & 0x3F) + 8) as f64;
    let maximum = 0.5 * (((eax >> 16) & 0x3F) + 8) as f64;
    (current, maximum)
}

/// Thermtrip core-select codes (cpu0, cpu1) for a model id. NPT revisions
/// F and G (model >= 40) have the selection swapped.
fn core_select_codes(model: u32) -> (u8, u8) {
    if model < 40 {
        (0x0, 0x4)
    } else {
        (0x4, 0x0)
    }
}

/// Thermal-diode offset for a model id. Base -49; AM2+ 65nm parts
/// (model >= 0x69, except 0xC1, 0x6C and 0x7C) run +21 on top.
fn temperature_offset(model: u32) -> f32 {
    let mut offset = -49.0;
    if model >= 0x69 && model != 0xC1 && model != 0x6C && model != 0x7C {
        offset += 21.0;
    }
    offset
}

/// Locate the miscellaneous-control function of a processor node and
/// verify its vendor/device id before trusting it.
fn miscellaneous_control_address(ring0: &Ring0, processor_index: u8) -> Option<PciAddress> {
    let address = PciAddress::new(
        0,
        PCI_BASE_DEVICE + processor_index,
        MISCELLANEOUS_CONTROL_FUNCTION,
    );
    let id = ring0.read_pci_config(address, 0)?;
    let expected = (u32::from(MISCELLANEOUS_CONTROL_DEVICE_ID) << 16) | u32::from(AMD_VENDOR_ID);
    if id == expected {
        Some(address)
    } else {
        None
    }
}

pub struct Amd0fCpu {
    identifier: Identifier,
    name: String,
    ring0: Ring0,
    info: CpuInfo,
    bank: SensorBank,
    core_temperatures: Vec<SensorId>,
    core_clocks: Vec<SensorId>,
    bus_clock: SensorId,
    therm_sense_core_sel_cpu0: u8,
    therm_sense_core_sel_cpu1: u8,
    miscellaneous_control_address: Option<PciAddress>,
    closed: bool,
}

impl Amd0fCpu {
    pub fn new(processor_index: u8, info: CpuInfo, ring0: Ring0, observers: Observers) -> Amd0fCpu {
        let identifier = Identifier::new(&["amdcpu", &processor_index.to_string()]);
        let mut bank = SensorBank::new(identifier.clone(), observers);

        let offset = temperature_offset(info.model);
        let (sel_cpu0, sel_cpu1) = core_select_codes(info.model);
        let miscellaneous_control_address = miscellaneous_control_address(&ring0, processor_index);

        let core_count = info.core_threads.len();
        let mut core_temperatures = Vec::new();
        if info.has_thermal_sensor {
            for i in 0..core_count {
                core_temperatures.push(bank.add(
                    Sensor::new(format!("Core #{}", i + 1), i, SensorType::Temperature, &identifier)
                        .with_parameters(vec![Parameter::new(
                            "Offset [°C]",
                            "Temperature offset of the thermal sensor.\nTemperature = Value + Offset.",
                            offset,
                        )]),
                ));
            }
        }

        let bus_clock = bank.add(Sensor::new("Bus Speed", 0, SensorType::Clock, &identifier));
        let mut core_clocks = Vec::new();
        for i in 0..core_count {
            core_clocks.push(bank.add(Sensor::new(
                format!("Core #{}", i + 1),
                i + 1,
                SensorType::Clock,
                &identifier,
            )));
        }

        Amd0fCpu {
            identifier,
            name: info.name.clone(),
            ring0,
            info,
            bank,
            core_temperatures,
            core_clocks,
            bus_clock,
            therm_sense_core_sel_cpu0: sel_cpu0,
            therm_sense_core_sel_cpu1: sel_cpu1,
            miscellaneous_control_address,
            closed: false,
        }
    }

    fn update_temperatures(&mut self) {
        let Some(address) = self.miscellaneous_control_address else {
            return;
        };
        for (i, &sensor) in self.core_temperatures.iter().enumerate() {
            let select = if i > 0 {
                self.therm_sense_core_sel_cpu1
            } else {
                self.therm_sense_core_sel_cpu0
            };
            if !self
                .ring0
                .write_pci_config(address, THERMTRIP_STATUS_REGISTER, u32::from(select))
            {
                continue;
            }
            match self.ring0.read_pci_config(address, THERMTRIP_STATUS_REGISTER) {
                Some(value) => {
                    // The raw diode code sits in bits 16-23.
                    let raw = ((value >> 16) & 0xFF) as f32;
                    let offset = self.bank.get(sensor).parameter("Offset [°C]").unwrap_or(0.0);
                    self.bank.publish(sensor, raw + offset);
                }
                None => self.bank.retract(sensor),
            }
        }
    }

    fn update_clocks(&mut self) {
        if !self.info.has_tsc {
            return;
        }
        let tsc = self.info.tsc_frequency_mhz;
        let mut new_bus_clock = 0.0;

        for (i, &sensor) in self.core_clocks.iter().enumerate() {
            let thread = self.info.core_threads[i];
            match self.ring0.read_msr(FIDVID_STATUS, thread) {
                Some((eax, _edx)) => {
                    let (current, maximum) = fid_multipliers(eax);
                    self.bank.publish(sensor, (current * tsc / maximum) as f32);
                    new_bus_clock = tsc / maximum;
                }
                None => {
                    // Fail-safe: publish the calibrated reference clock
                    // instead of leaving the sensor stale.
                    self.bank.publish(sensor, tsc as f32);
                }
            }
        }

        if new_bus_clock > 0.0 {
            self.bank.publish(self.bus_clock, new_bus_clock as f32);
        }
    }
}

impl Hardware for Amd0fCpu {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_type(&self) -> HardwareType {
        HardwareType::Cpu
    }

    fn update(&mut self) {
        if self.closed {
            return;
        }
        self.update_temperatures();
        self.update_clocks();
        trace!(identifier = %self.identifier, "cpu update done");
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn report(&self) -> String {
        let mut r = String::new();
        r.push_str("AMD Family 0Fh CPU\n\n");
        r.push_str(&format!("Name: {}\n", self.name));
        r.push_str(&format!("Model: 0x{:X}\n", self.info.model));
        match self.miscellaneous_control_address {
            Some(address) => r.push_str(&format!("Miscellaneous Control Address: {}\n", address)),
            None => r.push_str("Miscellaneous Control Address: not found\n"),
        }
        r.push('\n');
        r
    }

    fn sensors(&self) -> Vec<&Sensor> {
        self.bank.active()
    }

    fn all_sensors(&self) -> Vec<&Sensor> {
        self.bank.all().iter().collect()
    }
}

/// Fixed probe over the supplied CPU identification data: admits family
/// 0Fh packages, reports anything else as unsupported.
pub struct CpuGroup {
    hardware: Vec<Box<dyn Hardware>>,
    report: String,
}

impl CpuGroup {
    pub fn new(packages: Vec<CpuInfo>, ring0: Ring0, observers: Observers) -> CpuGroup {
        let mut hardware: Vec<Box<dyn Hardware>> = Vec::new();
        let mut report = String::new();

        for (index, info) in packages.into_iter().enumerate() {
            report.push_str(&format!("Processor Index: {}\n", index));
            report.push_str(&format!("Family: 0x{:X}\n", info.family));
            if info.family != FAMILY_0F {
                report.push_str("Status: Unsupported family\n");
                continue;
            }
            report.push_str("Status: OK\n");
            hardware.push(Box::new(Amd0fCpu::new(
                index as u8,
                info,
                ring0.clone(),
                observers.clone(),
            )));
        }

        if hardware.is_empty() && report.is_empty() {
            report.push_str("Status: No CPU identification data supplied\n");
        }

        CpuGroup { hardware, report }
    }
}

impl Group for CpuGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.hardware.iter().map(|h| h.as_ref() as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.hardware.iter_mut().map(|h| h.as_mut() as &mut dyn Hardware).collect()
    }

    fn report(&self) -> String {
        let mut r = String::from("CPU Group\n\n");
        r.push_str(&self.report);
        r.push('\n');
        r
    }

    fn close(&mut self) {
        for h in &mut self.hardware {
            h.close();
        }
    }
}

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

//! Thin orchestrator over the enabled groups: runs the update traversal,
//! publishes add/remove events and aggregates the diagnostic reports.

use tracing::trace;

use crate::tree::{Group, Hardware, Observers, TreeEvent};

pub struct Computer {
    groups: Vec<Box<dyn Group>>,
    observers: Observers,
}

impl Default for Computer {
    fn default() -> Self {
        Computer::new(Observers::new())
    }
}

fn announce(observers: &Observers, hardware: &dyn Hardware) {
    observers.emit(&TreeEvent::HardwareAdded {
        identifier: hardware.identifier().clone(),
        name: hardware.name().to_string(),
        hardware_type: hardware.hardware_type(),
        parent: hardware.parent().cloned(),
    });
    for child in hardware.sub_hardware() {
        announce(observers, child.as_ref());
    }
}

fn retire(observers: &Observers, hardware: &dyn Hardware) {
    for child in hardware.sub_hardware() {
        retire(observers, child.as_ref());
    }
    observers.emit(&TreeEvent::HardwareRemoved {
        identifier: hardware.identifier().clone(),
    });
}

fn update_node(hardware: &mut dyn Hardware) {
    hardware.update();
    for child in hardware.sub_hardware_mut() {
        update_node(child.as_mut());
    }
}

impl Computer {
    pub fn new(observers: Observers) -> Computer {
        Computer {
            groups: Vec::new(),
            observers,
        }
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Take ownership of a group and announce its hardware.
    pub fn add_group(&mut self, group: Box<dyn Group>) {
        for hardware in group.hardware() {
            announce(&self.observers, hardware);
        }
        self.groups.push(group);
    }

    /// One polling tick across the whole tree. A malfunctioning backend
    /// degrades its own sensors; it cannot halt the traversal.
    pub fn update(&mut self) {
        for group in &mut self.groups {
            for hardware in group.hardware_mut() {
                trace!(identifier = %hardware.identifier(), "updating");
                update_node(hardware);
            }
        }
    }

    /// Every hardware node in traversal order.
    pub fn hardware(&self) -> Vec<&dyn Hardware> {
        self.groups.iter().flat_map(|g| g.hardware()).collect()
    }

    /// Combined diagnostic report: group scan results first, then the
    /// per-hardware reports and their active sensor values.
    pub fn report(&self) -> String {
        let mut r = String::new();
        r.push_str("Ringmon Report\n");
        r.push_str("--------------\n\n");

        for group in &self.groups {
            let group_report = group.report();
            if !group_report.is_empty() {
                r.push_str(&group_report);
            }
        }

        for hardware in self.hardware() {
            r.push_str(&format!(
                "Hardware: {} ({})\n",
                hardware.name(),
                hardware.identifier()
            ));
            let hw_report = hardware.report();
            if !hw_report.is_empty() {
                r.push_str(&hw_report);
            }
            for sensor in hardware.sensors() {
                r.push_str(&format!(
                    "  {:<11} {:<24} {:>10.3}  ({})\n",
                    format!("{:?}:", sensor.sensor_type()),
                    sensor.name(),
                    sensor.value().unwrap_or(f32::NAN),
                    sensor.identifier()
                ));
            }
            r.push('\n');
        }
        r
    }

    /// Retire every node and release all native handles.
    pub fn close(&mut self) {
        for group in &mut self.groups {
            for hardware in group.hardware() {
                retire(&self.observers, hardware);
            }
            group.close();
        }
        self.groups.clear();
    }
}

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

//! Ringmon - hardware telemetry for Linux
//!
//! Collects live temperature, clock, fan-speed and utilization readings
//! by talking directly to privileged CPU/PCI registers, USB HID streams
//! and USB-serial fan-controller links, and exposes them as one uniform
//! tree of named sensors.

pub mod affinity;
pub mod computer;
pub mod cpu;
pub mod error;
pub mod hid_sensor;
pub mod ram;
pub mod ring0;
pub mod serial_fan;
pub mod tree;

pub use computer::Computer;
pub use error::{Result, RingmonError};
pub use ring0::{PciAddress, Ring0};
pub use tree::{
    Group, Hardware, HardwareType, Identifier, Observers, Parameter, Sensor, SensorType, TreeEvent,
};

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

//! The sensor tree: hardware nodes, sensors, groups and notifications.
//!
//! Backends of any kind (CPU registers, serial fan controllers, HID
//! streams, fixed probes) present themselves through the same small
//! capability set so consumers can traverse the tree without knowing
//! what produced it. Identifiers are built compositionally from the
//! parent path, a type tag and a disambiguating index; they stay valid
//! as lookup keys even after the node that minted them is gone, which
//! is what makes remove notifications safe to consume.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Hierarchical, globally unique, immutable-after-construction path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identifier(Vec<String>);

impl Identifier {
    pub fn new(parts: &[&str]) -> Identifier {
        Identifier(parts.iter().map(|p| p.to_ascii_lowercase()).collect())
    }

    /// A new identifier with one more path segment appended.
    pub fn child(&self, part: &str) -> Identifier {
        let mut parts = self.0.clone();
        parts.push(part.to_ascii_lowercase());
        Identifier(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.0 {
            write!(f, "/{}", part)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HardwareType {
    Cpu,
    Memory,
    FanController,
    HidSensor,
}

impl HardwareType {
    /// Path segment used when composing identifiers.
    pub fn tag(&self) -> &'static str {
        match self {
            HardwareType::Cpu => "cpu",
            HardwareType::Memory => "ram",
            HardwareType::FanController => "fanbridge",
            HardwareType::HidSensor => "hid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SensorType {
    Voltage,
    Clock,
    Temperature,
    Load,
    Fan,
    Flow,
    Control,
    Data,
}

impl SensorType {
    pub fn tag(&self) -> &'static str {
        match self {
            SensorType::Voltage => "voltage",
            SensorType::Clock => "clock",
            SensorType::Temperature => "temperature",
            SensorType::Load => "load",
            SensorType::Fan => "fan",
            SensorType::Flow => "flow",
            SensorType::Control => "control",
            SensorType::Data => "data",
        }
    }
}

/// A named, user-tunable numeric input that influences decoding, e.g. a
/// temperature offset applied to a raw thermal-diode code.
#[derive(Debug, Clone, Serialize)]
pub struct Parameter {
    name: &'static str,
    description: &'static str,
    default_value: f32,
    value: f32,
}

impl Parameter {
    pub fn new(name: &'static str, description: &'static str, default_value: f32) -> Parameter {
        Parameter {
            name,
            description,
            default_value,
            value: default_value,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn description(&self) -> &str {
        self.description
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn set_value(&mut self, value: f32) {
        self.value = value;
    }

    pub fn reset(&mut self) {
        self.value = self.default_value;
    }
}

/// One measured quantity. Exists from construction; visible to consumers
/// only while `active`. (type, index) is unique within the owning hardware.
#[derive(Debug, Clone, Serialize)]
pub struct Sensor {
    name: String,
    identifier: Identifier,
    sensor_type: SensorType,
    index: usize,
    value: Option<f32>,
    active: bool,
    parameters: Vec<Parameter>,
}

impl Sensor {
    pub fn new(name: impl Into<String>, index: usize, sensor_type: SensorType, parent: &Identifier) -> Sensor {
        Sensor {
            name: name.into(),
            identifier: parent.child(sensor_type.tag()).child(&index.to_string()),
            sensor_type,
            index,
            value: None,
            active: false,
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Sensor {
        self.parameters = parameters;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Undefined (`None`) until the first successful read.
    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }

    /// Value of a named parameter, if the sensor carries one.
    pub fn parameter(&self, name: &str) -> Option<f32> {
        self.parameters.iter().find(|p| p.name == name).map(|p| p.value)
    }
}

/// Tree change notifications. Events carry identifiers, never object
/// references, so a consumer can drop per-node state on a remove event
/// without the node having to outlive it.
#[derive(Debug, Clone, Serialize)]
pub enum TreeEvent {
    HardwareAdded {
        identifier: Identifier,
        name: String,
        hardware_type: HardwareType,
        parent: Option<Identifier>,
    },
    HardwareRemoved {
        identifier: Identifier,
    },
    SensorAdded {
        identifier: Identifier,
        hardware: Identifier,
        name: String,
        sensor_type: SensorType,
        index: usize,
    },
    SensorRemoved {
        identifier: Identifier,
        hardware: Identifier,
    },
}

type ObserverFn = Box<dyn FnMut(&TreeEvent) + Send>;

/// Registry of tree observers. Cloning shares the registration list, so
/// a group can hand the same registry down to the hardware it creates.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<Mutex<Vec<ObserverFn>>>,
}

impl Observers {
    pub fn new() -> Observers {
        Observers::default()
    }

    pub fn subscribe(&self, observer: impl FnMut(&TreeEvent) + Send + 'static) {
        self.inner.lock().push(Box::new(observer));
    }

    /// Deliver an event to every observer registered before this call.
    /// The registry lock is not held while observers run, so an observer
    /// may subscribe further observers; those start receiving with the
    /// next event.
    pub fn emit(&self, event: &TreeEvent) {
        let mut active = std::mem::take(&mut *self.inner.lock());
        for observer in active.iter_mut() {
            observer(event);
        }
        let mut inner = self.inner.lock();
        let subscribed_meanwhile = std::mem::take(&mut *inner);
        *inner = active;
        inner.extend(subscribed_meanwhile);
    }
}

/// Handle to a sensor slot inside a [`SensorBank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorId(usize);

/// Owned sensor storage plus the activation discipline shared by every
/// backend: a sensor becomes visible on its first successful read and is
/// hidden again (slot preserved) when a read fails. Activation changes
/// are published as add/remove events.
pub struct SensorBank {
    hardware: Identifier,
    sensors: Vec<Sensor>,
    observers: Observers,
}

impl SensorBank {
    pub fn new(hardware: Identifier, observers: Observers) -> SensorBank {
        SensorBank {
            hardware,
            sensors: Vec::new(),
            observers,
        }
    }

    /// Add a sensor slot. Panics in debug builds if (type, index) is
    /// already taken within this hardware.
    pub fn add(&mut self, sensor: Sensor) -> SensorId {
        debug_assert!(
            !self
                .sensors
                .iter()
                .any(|s| s.sensor_type == sensor.sensor_type && s.index == sensor.index),
            "duplicate (sensor type, index) within one hardware"
        );
        self.sensors.push(sensor);
        SensorId(self.sensors.len() - 1)
    }

    /// Record a successful read: set the value and activate the sensor.
    pub fn publish(&mut self, id: SensorId, value: f32) {
        let sensor = &mut self.sensors[id.0];
        sensor.value = Some(value);
        if !sensor.active {
            sensor.active = true;
            self.observers.emit(&TreeEvent::SensorAdded {
                identifier: sensor.identifier.clone(),
                hardware: self.hardware.clone(),
                name: sensor.name.clone(),
                sensor_type: sensor.sensor_type,
                index: sensor.index,
            });
        }
    }

    /// Record a failed read: hide the sensor but keep its slot so a later
    /// successful read re-activates it under the same identifier.
    pub fn retract(&mut self, id: SensorId) {
        let sensor = &mut self.sensors[id.0];
        if sensor.active {
            sensor.active = false;
            self.observers.emit(&TreeEvent::SensorRemoved {
                identifier: sensor.identifier.clone(),
                hardware: self.hardware.clone(),
            });
        }
    }

    pub fn get(&self, id: SensorId) -> &Sensor {
        &self.sensors[id.0]
    }

    pub fn get_mut(&mut self, id: SensorId) -> &mut Sensor {
        &mut self.sensors[id.0]
    }

    /// Currently active sensors, in insertion order.
    pub fn active(&self) -> Vec<&Sensor> {
        self.sensors.iter().filter(|s| s.active).collect()
    }

    /// The full fixed topology, active or not.
    pub fn all(&self) -> &[Sensor] {
        &self.sensors
    }
}

/// Capability set every hardware node implements.
pub trait Hardware: Send {
    fn identifier(&self) -> &Identifier;
    fn name(&self) -> &str;
    fn hardware_type(&self) -> HardwareType;

    /// Identifier of the parent node, for lookup only.
    fn parent(&self) -> Option<&Identifier> {
        None
    }

    /// Refresh sensor values. Must not let any fault escape: a broken
    /// device degrades its own sensors, never the polling of the tree.
    fn update(&mut self);

    /// Release native handles. Further updates become no-ops. Idempotent.
    fn close(&mut self) {}

    /// Diagnostic text for this node, empty when there is nothing to say.
    fn report(&self) -> String {
        String::new()
    }

    /// Currently active sensors.
    fn sensors(&self) -> Vec<&Sensor>;

    /// Full sensor topology, active or not.
    fn all_sensors(&self) -> Vec<&Sensor>;

    fn sub_hardware(&self) -> &[Box<dyn Hardware>] {
        &[]
    }

    fn sub_hardware_mut(&mut self) -> &mut [Box<dyn Hardware>] {
        &mut []
    }
}

/// A discovery strategy over one enumeration surface. Finding nothing is
/// not an error; the report explains what was seen and why candidates
/// were rejected. The hardware set is fixed after construction.
pub trait Group: Send {
    fn hardware(&self) -> Vec<&dyn Hardware>;
    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware>;

    fn report(&self) -> String {
        String::new()
    }

    /// Close all owned hardware. Idempotent.
    fn close(&mut self);
}

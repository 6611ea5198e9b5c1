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

//! Fan controller behind an FTDI-style USB-serial bridge.
//!
//! The device speaks a fixed 285-byte frame: one start sentinel followed
//! by a 284-byte payload, solicited with a single query byte. Discovery
//! walks every enumerated bridge port and admits only devices that
//! answer with a well-formed frame of a known protocol generation; each
//! rejection is recorded with its reason in the group report. Serial
//! streams can shift, so the sentinel is re-validated on every read at
//! steady state and a mismatch purges the input instead of misparsing.

use std::io::{Read, Write};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::tree::{
    Group, Hardware, HardwareType, Identifier, Observers, Sensor, SensorBank, SensorId, SensorType,
};

/// Start-of-frame sentinel.
pub const START_FLAG: u8 = 0x64;
/// Payload bytes following the sentinel.
pub const PAYLOAD_LENGTH: usize = 284;
/// Sentinel plus payload.
pub const FRAME_LENGTH: usize = 285;
/// Byte holding the protocol version, indexed from the sentinel.
const PROTOCOL_VERSION_OFFSET: usize = 274;
/// High nibble of the version byte for the supported generation
/// (versions seen in the field: 0x2C, 0x2A, 0x28).
const PROTOCOL_GENERATION: u8 = 0x20;

const QUERY_COMMAND: u8 = 0x38;
const BAUD_RATE: u32 = 19200;
const PORT_TIMEOUT: Duration = Duration::from_millis(1000);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Poll bound while waiting for the first response byte.
const RESPONSE_POLLS: u32 = 2;
/// Poll bound while waiting for the rest of the frame.
const FRAME_POLLS: u32 = 5;

/// The controller sits behind an FT232BM bridge.
const BRIDGE_VID: u16 = 0x0403;
const BRIDGE_PID: u16 = 0x6001;

const FAN_COUNT: usize = 4;
const TEMPERATURE_COUNT: usize = 4;

// Payload layout, indexed from the sentinel.
const DIGITAL_TEMPERATURE_OFFSET: usize = 238;
const ANALOG_TEMPERATURE_OFFSET: usize = 260;
const FAN_MAX_RPM_OFFSET: usize = 148;
const FAN_DUTY_OFFSET: usize = 156;

/// Why a candidate device or a buffered frame was rejected.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("no response")]
    NoResponse,
    #[error("wrong start flag: 0x{0:02X}")]
    WrongStartFlag(u8),
    #[error("wrong message length: {0}")]
    WrongMessageLength(usize),
    #[error("wrong protocol version: 0x{0:02X}")]
    WrongProtocolVersion(u8),
}

/// Validate a complete frame buffer and extract the protocol version.
pub fn validate_frame(frame: &[u8]) -> std::result::Result<u8, FrameError> {
    match frame.first() {
        None => return Err(FrameError::WrongMessageLength(0)),
        Some(&first) if first != START_FLAG => return Err(FrameError::WrongStartFlag(first)),
        _ => {}
    }
    if frame.len() < FRAME_LENGTH {
        return Err(FrameError::WrongMessageLength(frame.len()));
    }
    let version = frame[PROTOCOL_VERSION_OFFSET];
    if version & 0xF0 != PROTOCOL_GENERATION {
        return Err(FrameError::WrongProtocolVersion(version));
    }
    Ok(version)
}

/// The narrow slice of a serial bridge the backend needs. `serialport`
/// handles implement it directly; tests drive the protocol with a
/// scripted fake.
pub trait BridgePort: Send {
    fn bytes_to_read(&mut self) -> Result<u32>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    /// Drop any buffered input bytes.
    fn clear_input(&mut self) -> Result<()>;
}

impl BridgePort for Box<dyn serialport::SerialPort> {
    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(serialport::SerialPort::bytes_to_read(self.as_ref())?)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Ok(Read::read_exact(self, buf)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(Write::write_all(self, buf)?)
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok(self.clear(serialport::ClearBuffer::Input)?)
    }
}

/// Query the device once and check that it answers with a valid frame.
/// Mirrors the frame read at steady state, but with bounded waiting and
/// per-step rejection reasons for the discovery report.
fn probe(port: &mut dyn BridgePort) -> std::result::Result<u8, FrameError> {
    let io = |e| {
        debug!(error = %format!("{e:?}"), "probe i/o failed");
        FrameError::NoResponse
    };

    port.clear_input().map_err(io)?;
    port.write_all(&[QUERY_COMMAND]).map_err(io)?;

    let mut polls = 0;
    while port.bytes_to_read().map_err(io)? == 0 && polls < RESPONSE_POLLS {
        std::thread::sleep(POLL_INTERVAL);
        polls += 1;
    }
    if port.bytes_to_read().map_err(io)? == 0 {
        return Err(FrameError::NoResponse);
    }

    let mut first = [0u8; 1];
    port.read_exact(&mut first).map_err(io)?;
    if first[0] != START_FLAG {
        return Err(FrameError::WrongStartFlag(first[0]));
    }

    while (port.bytes_to_read().map_err(io)? as usize) < PAYLOAD_LENGTH && polls < FRAME_POLLS {
        std::thread::sleep(POLL_INTERVAL);
        polls += 1;
    }
    let buffered = port.bytes_to_read().map_err(io)? as usize;
    if buffered < PAYLOAD_LENGTH {
        return Err(FrameError::WrongMessageLength(buffered));
    }

    let mut frame = [0u8; FRAME_LENGTH];
    frame[0] = START_FLAG;
    port.read_exact(&mut frame[1..]).map_err(io)?;
    validate_frame(&frame)
}

pub struct SerialFanController {
    identifier: Identifier,
    name: String,
    port: Option<Box<dyn BridgePort>>,
    port_name: String,
    protocol_version: u8,
    bank: SensorBank,
    digital_temperatures: Vec<SensorId>,
    analog_temperatures: Vec<SensorId>,
    fans: Vec<SensorId>,
}

impl SerialFanController {
    pub fn new(
        device_index: usize,
        port: Box<dyn BridgePort>,
        port_name: String,
        protocol_version: u8,
        observers: Observers,
    ) -> SerialFanController {
        let identifier = Identifier::new(&["fanbridge", &device_index.to_string()]);
        let mut bank = SensorBank::new(identifier.clone(), observers);

        let mut digital_temperatures = Vec::new();
        let mut analog_temperatures = Vec::new();
        for i in 0..TEMPERATURE_COUNT {
            digital_temperatures.push(bank.add(Sensor::new(
                format!("Digital Sensor #{}", i + 1),
                i,
                SensorType::Temperature,
                &identifier,
            )));
        }
        for i in 0..TEMPERATURE_COUNT {
            analog_temperatures.push(bank.add(Sensor::new(
                format!("Analog Sensor #{}", i + 1),
                TEMPERATURE_COUNT + i,
                SensorType::Temperature,
                &identifier,
            )));
        }
        let mut fans = Vec::new();
        for i in 0..FAN_COUNT {
            fans.push(bank.add(Sensor::new(
                format!("Fan Channel #{}", i + 1),
                i,
                SensorType::Fan,
                &identifier,
            )));
        }

        SerialFanController {
            identifier,
            name: "T-Balancer bigNG".to_string(),
            port: Some(port),
            port_name,
            protocol_version,
            bank,
            digital_temperatures,
            analog_temperatures,
            fans,
        }
    }

    /// Decode one validated frame into sensor values. A zero byte in a
    /// temperature channel means "nothing connected".
    fn decode_frame(&mut self, frame: &[u8; FRAME_LENGTH]) {
        for (i, &sensor) in self.digital_temperatures.iter().enumerate() {
            let raw = frame[DIGITAL_TEMPERATURE_OFFSET + i];
            if raw > 0 {
                self.bank.publish(sensor, 0.5 * f32::from(raw));
            } else {
                self.bank.retract(sensor);
            }
        }
        for (i, &sensor) in self.analog_temperatures.iter().enumerate() {
            let raw = frame[ANALOG_TEMPERATURE_OFFSET + i];
            if raw > 0 {
                self.bank.publish(sensor, 0.5 * f32::from(raw));
            } else {
                self.bank.retract(sensor);
            }
        }
        for (i, &sensor) in self.fans.iter().enumerate() {
            let max_rpm = 11.5
                * f32::from(u16::from_le_bytes([
                    frame[FAN_MAX_RPM_OFFSET + 2 * i],
                    frame[FAN_MAX_RPM_OFFSET + 2 * i + 1],
                ]));
            let duty = f32::from(frame[FAN_DUTY_OFFSET + i]) / 255.0;
            self.bank.publish(sensor, max_rpm * duty.min(1.0));
        }
    }

    /// Read and decode one frame if a full one is buffered, then solicit
    /// the next. Any failure skips this tick; stale values are retained.
    fn poll(&mut self) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };

        let mut received: Option<[u8; FRAME_LENGTH]> = None;
        if port.bytes_to_read()? as usize >= FRAME_LENGTH {
            let mut frame = [0u8; FRAME_LENGTH];
            port.read_exact(&mut frame)?;
            match validate_frame(&frame) {
                Ok(_) => received = Some(frame),
                Err(e) => {
                    // Desynchronized stream; drop the buffer and resync
                    // on the next solicited frame.
                    warn!(identifier = %self.identifier, reason = %e, "discarding shifted frame");
                    port.clear_input()?;
                }
            }
        }
        port.write_all(&[QUERY_COMMAND])?;

        if let Some(frame) = received {
            self.decode_frame(&frame);
        }
        Ok(())
    }
}

impl Hardware for SerialFanController {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_type(&self) -> HardwareType {
        HardwareType::FanController
    }

    fn update(&mut self) {
        if let Err(e) = self.poll() {
            trace!(identifier = %self.identifier, error = %e, "fan controller tick skipped");
        }
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn report(&self) -> String {
        format!(
            "Serial Fan Controller\n\nPort: {}\nProtocol Version: 0x{:02X}\n\n",
            self.port_name, self.protocol_version
        )
    }

    fn sensors(&self) -> Vec<&Sensor> {
        self.bank.active()
    }

    fn all_sensors(&self) -> Vec<&Sensor> {
        self.bank.all().iter().collect()
    }
}

/// Scans the serial bridge device list. Only candidates that match the
/// bridge chip and answer the probe with a valid frame are admitted;
/// scanning continues across all devices and every rejection reason is
/// recorded per device index.
pub struct SerialFanGroup {
    hardware: Vec<Box<dyn Hardware>>,
    report: String,
}

impl SerialFanGroup {
    pub fn new(observers: Observers) -> SerialFanGroup {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                return SerialFanGroup {
                    hardware: Vec::new(),
                    report: format!("Status: port enumeration failed: {}\n", e),
                }
            }
        };

        let mut hardware: Vec<Box<dyn Hardware>> = Vec::new();
        let mut report = String::new();

        for (index, info) in ports.iter().enumerate() {
            report.push_str(&format!("Device Index: {}\n", index));
            report.push_str(&format!("Port Name: {}\n", info.port_name));

            let serialport::SerialPortType::UsbPort(usb) = &info.port_type else {
                report.push_str("Status: Not a USB bridge\n");
                continue;
            };
            if usb.vid != BRIDGE_VID || usb.pid != BRIDGE_PID {
                report.push_str("Status: Wrong device type\n");
                continue;
            }

            let opened = serialport::new(&info.port_name, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .flow_control(serialport::FlowControl::Hardware)
                .timeout(PORT_TIMEOUT)
                .open();
            let mut port: Box<dyn serialport::SerialPort> = match opened {
                Ok(p) => p,
                Err(e) => {
                    report.push_str(&format!("Open Status: {}\n", e));
                    continue;
                }
            };

            match probe(&mut port) {
                Ok(protocol_version) => {
                    report.push_str("Status: OK\n");
                    debug!(port = %info.port_name, protocol_version, "fan controller admitted");
                    hardware.push(Box::new(SerialFanController::new(
                        hardware.len(),
                        Box::new(port),
                        info.port_name.clone(),
                        protocol_version,
                        observers.clone(),
                    )));
                }
                Err(reason) => {
                    report.push_str(&format!("Status: {}\n", reason));
                }
            }
        }

        if ports.is_empty() {
            report.push_str("Status: No bridge devices found\n");
        }

        SerialFanGroup { hardware, report }
    }
}

impl Group for SerialFanGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.hardware.iter().map(|h| h.as_ref() as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.hardware.iter_mut().map(|h| h.as_mut() as &mut dyn Hardware).collect()
    }

    fn report(&self) -> String {
        let mut r = String::from("Serial Fan Controllers\n\n");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Observers;
    use std::collections::VecDeque;

    /// Scripted in-memory bridge. Bytes in `input` are readable right
    /// away; `reply` stays staged on the device side until a query byte
    /// is written, so a flush of the input buffer cannot eat it.
    struct FakePort {
        input: VecDeque<u8>,
        reply: Vec<u8>,
        written: Vec<u8>,
    }

    impl FakePort {
        fn with_input(bytes: &[u8]) -> FakePort {
            FakePort {
                input: bytes.iter().copied().collect(),
                reply: Vec::new(),
                written: Vec::new(),
            }
        }

        fn with_reply(bytes: &[u8]) -> FakePort {
            FakePort {
                input: VecDeque::new(),
                reply: bytes.to_vec(),
                written: Vec::new(),
            }
        }
    }

    impl BridgePort for FakePort {
        fn bytes_to_read(&mut self) -> Result<u32> {
            Ok(self.input.len() as u32)
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            for b in buf.iter_mut() {
                *b = self
                    .input
                    .pop_front()
                    .ok_or_else(|| crate::error::RingmonError::generic("underrun"))?;
            }
            Ok(())
        }

        fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.written.extend_from_slice(buf);
            if buf.contains(&QUERY_COMMAND) {
                self.input.extend(self.reply.drain(..));
            }
            Ok(())
        }

        fn clear_input(&mut self) -> Result<()> {
            self.input.clear();
            Ok(())
        }
    }

    fn valid_frame() -> [u8; FRAME_LENGTH] {
        let mut frame = [0u8; FRAME_LENGTH];
        frame[0] = START_FLAG;
        frame[PROTOCOL_VERSION_OFFSET] = 0x2C;
        frame
    }

    #[test]
    fn test_validate_accepts_known_generation() {
        let frame = valid_frame();
        assert_eq!(validate_frame(&frame), Ok(0x2C));
    }

    #[test]
    fn test_validate_rejects_flipped_sentinel() {
        let mut frame = valid_frame();
        frame[0] = 0x65;
        assert_eq!(validate_frame(&frame), Err(FrameError::WrongStartFlag(0x65)));
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let frame = valid_frame();
        assert_eq!(
            validate_frame(&frame[..100]),
            Err(FrameError::WrongMessageLength(100))
        );
        assert_eq!(validate_frame(&[]), Err(FrameError::WrongMessageLength(0)));
    }

    #[test]
    fn test_validate_rejects_unknown_generation() {
        let mut frame = valid_frame();
        frame[PROTOCOL_VERSION_OFFSET] = 0x3C;
        assert_eq!(
            validate_frame(&frame),
            Err(FrameError::WrongProtocolVersion(0x3C))
        );
    }

    #[test]
    fn test_probe_happy_path() {
        let mut frame = valid_frame();
        frame[PROTOCOL_VERSION_OFFSET] = 0x28;
        let mut port = FakePort::with_reply(&frame);
        assert_eq!(probe(&mut port), Ok(0x28));
        assert_eq!(port.written, vec![QUERY_COMMAND]);
    }

    #[test]
    fn test_probe_flushes_stale_input_but_keeps_reply() {
        // Leftover bytes from a previous session sit in the buffer; the
        // probe must discard them before querying, not mistake them for
        // the answer, and still see the solicited frame.
        let mut port = FakePort::with_reply(&valid_frame());
        port.input.extend([0xAA, 0xBB, 0xCC]);
        assert_eq!(probe(&mut port), Ok(0x2C));
    }

    #[test]
    fn test_probe_no_response() {
        let mut port = FakePort::with_reply(&[]);
        assert_eq!(probe(&mut port), Err(FrameError::NoResponse));
    }

    #[test]
    fn test_probe_wrong_start_flag() {
        let mut port = FakePort::with_reply(&[0xAA; FRAME_LENGTH]);
        assert_eq!(probe(&mut port), Err(FrameError::WrongStartFlag(0xAA)));
    }

    #[test]
    fn test_probe_truncated_frame() {
        let mut port = FakePort::with_reply(&valid_frame()[..50]);
        assert_eq!(probe(&mut port), Err(FrameError::WrongMessageLength(49)));
    }

    fn controller_with_input(bytes: &[u8]) -> SerialFanController {
        SerialFanController::new(
            0,
            Box::new(FakePort::with_input(bytes)),
            "/dev/ttyUSB0".to_string(),
            0x2C,
            Observers::new(),
        )
    }

    #[test]
    fn test_update_decodes_channels() {
        let mut frame = valid_frame();
        frame[DIGITAL_TEMPERATURE_OFFSET] = 50; // 25.0 °C
        frame[ANALOG_TEMPERATURE_OFFSET + 1] = 61; // 30.5 °C
        frame[FAN_MAX_RPM_OFFSET] = 0xC8; // 200 -> 2300 rpm at full duty
        frame[FAN_DUTY_OFFSET] = 255;

        let mut controller = controller_with_input(&frame);
        controller.update();

        let digital = controller.bank.get(controller.digital_temperatures[0]);
        assert_eq!(digital.value(), Some(25.0));
        assert!(digital.is_active());

        let analog = controller.bank.get(controller.analog_temperatures[1]);
        assert_eq!(analog.value(), Some(30.5));

        let fan = controller.bank.get(controller.fans[0]);
        assert_eq!(fan.value(), Some(2300.0));

        // Unconnected temperature channels stay invisible.
        assert!(!controller.bank.get(controller.digital_temperatures[1]).is_active());
    }

    #[test]
    fn test_update_resyncs_on_shifted_stream() {
        let mut bytes = vec![0u8; FRAME_LENGTH];
        bytes[0] = 0x00; // shifted: sentinel not first
        let mut controller = controller_with_input(&bytes);
        controller.update();
        // Nothing decoded, nothing activated, no panic.
        assert!(controller.sensors().is_empty());
    }

    #[test]
    fn test_update_with_partial_buffer_waits() {
        let mut controller = controller_with_input(&[START_FLAG; 10]);
        controller.update();
        assert!(controller.sensors().is_empty());
    }

    #[test]
    fn test_close_makes_update_a_noop() {
        let frame = valid_frame();
        let mut controller = controller_with_input(&frame);
        controller.close();
        controller.update();
        assert!(controller.sensors().is_empty());
        // Idempotent.
        controller.close();
    }

    #[test]
    fn test_sensor_type_index_unique() {
        let controller = controller_with_input(&[]);
        let keys: std::collections::HashSet<(SensorType, usize)> = controller
            .all_sensors()
            .iter()
            .map(|s| (s.sensor_type(), s.index()))
            .collect();
        assert_eq!(keys.len(), controller.all_sensors().len());
    }
}

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

//! USB HID temperature probe with a background read loop.
//!
//! The device streams input reports at its own cadence, which has
//! nothing to do with our polling tick, and a dead device must not be
//! able to stall the shared polling thread. So each opened device gets
//! its own reader thread: bounded-timeout read, decode, store into a
//! mutex-guarded snapshot, check the stop flag, repeat. `update` only
//! copies the latest snapshot into sensor state and never touches the
//! device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::tree::{
    Group, Hardware, HardwareType, Identifier, Observers, Sensor, SensorBank, SensorId, SensorType,
};

pub const VENDOR_ID: u16 = 0x0483;
pub const PRODUCT_ID: u16 = 0x5710;

/// Number of 16-bit channels in an input report.
const CHANNEL_COUNT: usize = 2;
/// Report-ID byte plus the channel fields.
const REPORT_LENGTH: usize = 1 + 2 * CHANNEL_COUNT;
/// Bound on each blocking read; also bounds shutdown latency.
const READ_TIMEOUT: Duration = Duration::from_millis(250);
/// Granularity of the stop-flag check while backing off after a failed
/// read, so a close during the backoff still joins within one interval.
const BACKOFF_SLICE: Duration = Duration::from_millis(25);

/// What the read loop needs from a HID device. `hidapi` devices
/// implement it directly; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
pub trait HidTransport: Send {
    /// Read one input report, waiting at most `timeout`. Returns the
    /// number of bytes read; 0 means the wait timed out.
    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

impl HidTransport for hidapi::HidDevice {
    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.read_timeout(buf, timeout.as_millis() as i32)?)
    }
}

/// Decode the fixed-layout report: a leading report-ID byte followed by
/// big-endian u16 channel values in hundredths of a degree. Byte order
/// is a property of this device, not of HID reports in general.
pub fn decode_report(data: &[u8]) -> Option<[f32; CHANNEL_COUNT]> {
    if data.len() < REPORT_LENGTH {
        return None;
    }
    let mut channels = [0.0; CHANNEL_COUNT];
    for (i, channel) in channels.iter_mut().enumerate() {
        let raw = u16::from_be_bytes([data[1 + 2 * i], data[2 + 2 * i]]);
        *channel = f32::from(raw) / 100.0;
    }
    Some(channels)
}

/// Latest decoded channel values, shared between the reader thread and
/// `update`. `None` until the first complete report arrives.
#[derive(Default)]
struct Snapshot {
    channels: Mutex<Option<[f32; CHANNEL_COUNT]>>,
}

fn read_loop(mut transport: impl HidTransport, snapshot: Arc<Snapshot>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; 64];
    while !stop.load(Ordering::Acquire) {
        match transport.read_report(&mut buf, READ_TIMEOUT) {
            Ok(n) if n >= REPORT_LENGTH => {
                if let Some(channels) = decode_report(&buf[..n]) {
                    *snapshot.channels.lock() = Some(channels);
                }
            }
            Ok(_) => {
                // Timed out or short report; just re-check the stop flag.
            }
            Err(e) => {
                // A closed or unplugged device fails the pending read;
                // back off so a persistently broken one cannot spin.
                trace!(error = %e, "hid read failed");
                let mut waited = Duration::ZERO;
                while waited < READ_TIMEOUT && !stop.load(Ordering::Acquire) {
                    std::thread::sleep(BACKOFF_SLICE);
                    waited += BACKOFF_SLICE;
                }
            }
        }
    }
}

pub struct HidTempSensor {
    identifier: Identifier,
    name: String,
    device_path: String,
    bank: SensorBank,
    temperatures: Vec<SensorId>,
    snapshot: Arc<Snapshot>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl HidTempSensor {
    pub fn new(
        device_index: usize,
        transport: impl HidTransport + 'static,
        device_path: String,
        observers: Observers,
    ) -> HidTempSensor {
        let identifier = Identifier::new(&["hid", &device_index.to_string()]);
        let mut bank = SensorBank::new(identifier.clone(), observers);

        let mut temperatures = Vec::new();
        for i in 0..CHANNEL_COUNT {
            temperatures.push(bank.add(Sensor::new(
                format!("Temperature #{}", i + 1),
                i,
                SensorType::Temperature,
                &identifier,
            )));
        }

        let snapshot = Arc::new(Snapshot::default());
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let snapshot = snapshot.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("hid-reader-{}", device_index))
                .spawn(move || read_loop(transport, snapshot, stop))
                .ok()
        };

        HidTempSensor {
            identifier,
            name: "HID Temperature Probe".to_string(),
            device_path,
            bank,
            temperatures,
            snapshot,
            stop,
            reader,
        }
    }
}

impl Hardware for HidTempSensor {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_type(&self) -> HardwareType {
        HardwareType::HidSensor
    }

    /// No I/O here: copy whatever the reader thread decoded last.
    fn update(&mut self) {
        let channels = *self.snapshot.channels.lock();
        if let Some(channels) = channels {
            for (i, &sensor) in self.temperatures.iter().enumerate() {
                self.bank.publish(sensor, channels[i]);
            }
        }
    }

    /// Stop the reader and drop the device. The read timeout bounds how
    /// long the join can take. Idempotent.
    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                debug!(identifier = %self.identifier, "hid reader thread panicked");
            }
        }
    }

    fn report(&self) -> String {
        format!("HID Temperature Probe\n\nDevice Path: {}\n\n", self.device_path)
    }

    fn sensors(&self) -> Vec<&Sensor> {
        self.bank.active()
    }

    fn all_sensors(&self) -> Vec<&Sensor> {
        self.bank.all().iter().collect()
    }
}

impl Drop for HidTempSensor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scans the OS HID device table for matching probes, filtered by
/// vendor/product id and optionally by a device-path substring.
pub struct HidSensorGroup {
    hardware: Vec<Box<dyn Hardware>>,
    report: String,
}

impl HidSensorGroup {
    pub fn new(observers: Observers) -> HidSensorGroup {
        Self::with_path_filter(observers, None)
    }

    pub fn with_path_filter(observers: Observers, path_filter: Option<&str>) -> HidSensorGroup {
        let api = match hidapi::HidApi::new() {
            Ok(api) => api,
            Err(e) => {
                return HidSensorGroup {
                    hardware: Vec::new(),
                    report: format!("Status: HID enumeration failed: {}\n", e),
                }
            }
        };

        let mut hardware: Vec<Box<dyn Hardware>> = Vec::new();
        let mut report = String::new();
        let mut candidates = 0;

        for info in api.device_list() {
            if info.vendor_id() != VENDOR_ID || info.product_id() != PRODUCT_ID {
                continue;
            }
            let path = info.path().to_string_lossy().into_owned();
            candidates += 1;
            report.push_str(&format!("Device Index: {}\n", candidates - 1));
            report.push_str(&format!("Device Path: {}\n", path));

            if let Some(filter) = path_filter {
                if !path.contains(filter) {
                    report.push_str("Status: Path filter mismatch\n");
                    continue;
                }
            }

            match info.open_device(&api) {
                Ok(device) => {
                    report.push_str("Status: OK\n");
                    debug!(%path, "hid probe admitted");
                    hardware.push(Box::new(HidTempSensor::new(
                        hardware.len(),
                        device,
                        path,
                        observers.clone(),
                    )));
                }
                Err(e) => {
                    report.push_str(&format!("Open Status: {}\n", e));
                }
            }
        }

        if candidates == 0 {
            report.push_str("Status: No matching HID devices found\n");
        }

        HidSensorGroup { hardware, report }
    }
}

impl Group for HidSensorGroup {
    fn hardware(&self) -> Vec<&dyn Hardware> {
        self.hardware.iter().map(|h| h.as_ref() as &dyn Hardware).collect()
    }

    fn hardware_mut(&mut self) -> Vec<&mut dyn Hardware> {
        self.hardware.iter_mut().map(|h| h.as_mut() as &mut dyn Hardware).collect()
    }

    fn report(&self) -> String {
        let mut r = String::from("HID Temperature Probes\n\n");
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
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_decode_report_big_endian_channels() {
        // Report ID 1, channel 0 = 0x09C4 (25.00), channel 1 = 0x0BB8 (30.00).
        let data = [0x01, 0x09, 0xC4, 0x0B, 0xB8];
        let channels = decode_report(&data).unwrap();
        assert_eq!(channels[0], 25.0);
        assert_eq!(channels[1], 30.0);
    }

    #[test]
    fn test_decode_report_too_short() {
        assert!(decode_report(&[0x01, 0x09]).is_none());
        assert!(decode_report(&[]).is_none());
    }

    /// Transport that yields one fixed report per read and counts reads.
    struct ScriptedTransport {
        report: [u8; REPORT_LENGTH],
        reads: Arc<AtomicUsize>,
    }

    impl HidTransport for ScriptedTransport {
        fn read_report(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            buf[..REPORT_LENGTH].copy_from_slice(&self.report);
            // Pace the loop a little so the test thread can observe it.
            std::thread::sleep(Duration::from_millis(5));
            Ok(REPORT_LENGTH)
        }
    }

    fn scripted_sensor(report: [u8; REPORT_LENGTH]) -> (HidTempSensor, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let transport = ScriptedTransport {
            report,
            reads: reads.clone(),
        };
        let sensor = HidTempSensor::new(0, transport, "fake-path".to_string(), Observers::new());
        (sensor, reads)
    }

    #[test]
    fn test_update_copies_latest_snapshot() {
        let (mut sensor, _reads) = scripted_sensor([0x01, 0x09, 0xC4, 0x0B, 0xB8]);
        // Give the reader thread time to decode at least one report.
        std::thread::sleep(Duration::from_millis(100));
        sensor.update();
        let active = sensor.sensors();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].value(), Some(25.0));
        assert_eq!(active[1].value(), Some(30.0));
        sensor.close();
    }

    #[test]
    fn test_update_before_first_report_shows_nothing() {
        let mut transport = MockHidTransport::new();
        transport.expect_read_report().returning(|_, _| Ok(0));
        let mut sensor = HidTempSensor::new(0, transport, "fake".to_string(), Observers::new());
        sensor.update();
        assert!(sensor.sensors().is_empty());
        sensor.close();
    }

    #[test]
    fn test_close_stops_reader_within_one_interval() {
        let (mut sensor, reads) = scripted_sensor([0x01, 0x00, 0x64, 0x00, 0xC8]);
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        sensor.close();
        assert!(start.elapsed() < READ_TIMEOUT + Duration::from_millis(100));

        // No further reads (and so no further snapshot writes) happen
        // once close has returned.
        let after_close = reads.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reads.load(Ordering::SeqCst), after_close);

        // Idempotent.
        sensor.close();
    }

    #[test]
    fn test_close_bounded_while_reads_keep_failing() {
        let mut transport = MockHidTransport::new();
        transport
            .expect_read_report()
            .returning(|_, _| Err(crate::error::RingmonError::Hid("unplugged".to_string())));
        let mut sensor = HidTempSensor::new(0, transport, "fake".to_string(), Observers::new());
        // Land inside the failure backoff, then close: the join must
        // still complete within one wait interval.
        std::thread::sleep(Duration::from_millis(60));
        let start = Instant::now();
        sensor.close();
        assert!(start.elapsed() < READ_TIMEOUT + Duration::from_millis(100));
    }

    #[test]
    fn test_snapshot_survives_reader_errors() {
        let mut transport = MockHidTransport::new();
        let mut sent = false;
        transport.expect_read_report().returning(move |buf, _| {
            if !sent {
                sent = true;
                buf[..REPORT_LENGTH].copy_from_slice(&[0x01, 0x09, 0xC4, 0x0B, 0xB8]);
                Ok(REPORT_LENGTH)
            } else {
                Err(crate::error::RingmonError::Hid("unplugged".to_string()))
            }
        });
        let mut sensor = HidTempSensor::new(0, transport, "fake".to_string(), Observers::new());
        std::thread::sleep(Duration::from_millis(100));
        sensor.update();
        assert_eq!(sensor.sensors().len(), 2);
        sensor.close();
    }
}

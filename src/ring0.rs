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

//! Privileged register access: MSRs, PCI configuration space, I/O ports.
//!
//! This is the only module that touches privileged hardware registers.
//! On Linux the "driver" is the msr/port device node family:
//! `/dev/cpu/N/msr` for per-processor MSR reads, the PCI config files
//! under `/sys/bus/pci/devices` and `/dev/port` for legacy I/O ports.
//! The handle bundle is opened lazily on first use; once opening has
//! definitively failed the gateway stays in a degraded mode for the rest
//! of the process and never retries.
//!
//! MSR reads are issued with the calling thread pinned to the target
//! logical processor. The pin/read/restore sequence is not reentrant, so
//! the whole sequence runs under the gateway mutex.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::affinity::AffinityGuard;
use crate::error::{Result, RingmonError};

/// A PCI bus/device/function triple packed into one word, or an MSR-free
/// value type for addressing configuration space. No identity, no lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress(u32);

impl PciAddress {
    pub fn new(bus: u8, device: u8, function: u8) -> PciAddress {
        PciAddress((u32::from(bus) << 8) | (u32::from(device & 0x1F) << 3) | u32::from(function & 7))
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xFF) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1F) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 7) as u8
    }

    /// Sysfs path of the config-space file for this address (domain 0).
    fn config_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/sys/bus/pci/devices/0000:{:02x}:{:02x}.{}/config",
            self.bus(),
            self.device(),
            self.function()
        ))
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus(), self.device(), self.function())
    }
}

struct Driver {
    /// `/dev/port`, byte-addressed legacy I/O port space.
    port: Option<File>,
    /// Per-processor msr device handles, opened on demand.
    msr: HashMap<usize, File>,
}

impl Driver {
    fn msr_handle(&mut self, cpu: usize) -> Option<&File> {
        if !self.msr.contains_key(&cpu) {
            match File::open(format!("/dev/cpu/{}/msr", cpu)) {
                Ok(f) => {
                    self.msr.insert(cpu, f);
                }
                Err(e) => {
                    debug!(cpu, error = %e, "msr device open failed");
                    return None;
                }
            }
        }
        self.msr.get(&cpu)
    }
}

enum DriverState {
    Closed,
    Open(Driver),
    Failed,
}

struct Inner {
    state: DriverState,
    report: String,
}

impl Inner {
    /// Lazily open the handle bundle. A definitive failure is sticky.
    fn driver(&mut self) -> Option<&mut Driver> {
        if let DriverState::Closed = self.state {
            let port = OpenOptions::new().read(true).write(true).open("/dev/port");
            let msr_probe = File::open("/dev/cpu/0/msr");

            match (&port, &msr_probe) {
                (Err(pe), Err(me)) => {
                    let _ = writeln!(self.report, "Status: opening driver failed");
                    let _ = writeln!(self.report, "Port device: {}", pe);
                    let _ = writeln!(self.report, "MSR device: {}", me);
                    warn!(port = %pe, msr = %me, "privileged register access unavailable");
                    self.state = DriverState::Failed;
                }
                _ => {
                    let mut msr = HashMap::new();
                    if let Ok(f) = msr_probe {
                        msr.insert(0, f);
                    }
                    self.state = DriverState::Open(Driver {
                        port: port.ok(),
                        msr,
                    });
                    debug!("privileged register access opened");
                }
            }
        }

        match self.state {
            DriverState::Open(ref mut driver) => Some(driver),
            _ => None,
        }
    }
}

/// Process-wide gateway to privileged registers. Cheap to clone; all
/// clones share one driver handle bundle and one serialization mutex.
#[derive(Clone)]
pub struct Ring0 {
    inner: Arc<Mutex<Inner>>,
}

lazy_static! {
    static ref SHARED: Ring0 = Ring0::new();
}

impl Default for Ring0 {
    fn default() -> Self {
        Ring0::new()
    }
}

impl Ring0 {
    pub fn new() -> Ring0 {
        Ring0 {
            inner: Arc::new(Mutex::new(Inner {
                state: DriverState::Closed,
                report: String::new(),
            })),
        }
    }

    /// The process-wide instance backends are normally handed.
    pub fn shared() -> Ring0 {
        SHARED.clone()
    }

    /// Idempotent. Returns whether the driver is usable.
    pub fn open(&self) -> bool {
        self.inner.lock().driver().is_some()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, DriverState::Open(_))
    }

    /// Release all native handles. A later `open` starts from scratch.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let DriverState::Open(_) = inner.state {
            inner.state = DriverState::Closed;
        }
    }

    /// Read a model-specific register on one specific logical processor.
    ///
    /// The calling thread is pinned to `cpu` for the duration of the read
    /// and its previous affinity mask is restored on every exit path. The
    /// gateway mutex is held across the pin, so concurrent callers are
    /// serialized around the affinity change. Returns `(eax, edx)`.
    pub fn read_msr(&self, index: u32, cpu: usize) -> Option<(u32, u32)> {
        let mut inner = self.inner.lock();
        let driver = inner.driver()?;

        let _guard = match AffinityGuard::pin(cpu) {
            Ok(g) => g,
            Err(e) => {
                debug!(cpu, error = %e, "affinity pin failed, skipping msr read");
                return None;
            }
        };

        let file = driver.msr_handle(cpu)?;
        let mut buf = [0u8; 8];
        if let Err(e) = file.read_exact_at(&mut buf, u64::from(index)) {
            debug!(index, cpu, error = %e, "msr read failed");
            return None;
        }
        let value = u64::from_le_bytes(buf);
        Some((value as u32, (value >> 32) as u32))
    }

    /// Read a 4-byte PCI configuration register.
    ///
    /// A misaligned offset is rejected before any hardware is touched.
    pub fn read_pci_config(&self, address: PciAddress, offset: u32) -> Option<u32> {
        match self.try_read_pci_config(address, offset) {
            Ok(v) => Some(v),
            Err(RingmonError::MisalignedOffset(_)) | Err(RingmonError::DriverNotOpen) => None,
            Err(e) => {
                debug!(%address, offset, error = %e, "pci config read failed");
                None
            }
        }
    }

    /// As `read_pci_config`, but keeps the failure reason.
    pub fn try_read_pci_config(&self, address: PciAddress, offset: u32) -> Result<u32> {
        if offset & 3 != 0 {
            return Err(RingmonError::MisalignedOffset(offset));
        }
        let mut inner = self.inner.lock();
        if inner.driver().is_none() {
            return Err(RingmonError::DriverNotOpen);
        }
        let file = File::open(address.config_path())?;
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, u64::from(offset))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a 4-byte PCI configuration register. Same alignment contract
    /// as the read side. Returns whether the write went through.
    pub fn write_pci_config(&self, address: PciAddress, offset: u32, value: u32) -> bool {
        match self.try_write_pci_config(address, offset, value) {
            Ok(()) => true,
            Err(e) => {
                debug!(%address, offset, error = %e, "pci config write failed");
                false
            }
        }
    }

    pub fn try_write_pci_config(&self, address: PciAddress, offset: u32, value: u32) -> Result<()> {
        if offset & 3 != 0 {
            return Err(RingmonError::MisalignedOffset(offset));
        }
        let mut inner = self.inner.lock();
        if inner.driver().is_none() {
            return Err(RingmonError::DriverNotOpen);
        }
        let file = OpenOptions::new().write(true).open(address.config_path())?;
        file.write_all_at(&value.to_le_bytes(), u64::from(offset))?;
        Ok(())
    }

    /// Read one byte from a legacy I/O port. Returns 0 when the driver
    /// is unavailable; port telemetry degrades silently by design of the
    /// callers, which treat 0 as "nothing there".
    pub fn read_io_port(&self, port: u16) -> u8 {
        let mut inner = self.inner.lock();
        let Some(driver) = inner.driver() else {
            return 0;
        };
        let Some(file) = driver.port.as_mut() else {
            return 0;
        };
        let mut buf = [0u8; 1];
        if file.seek(SeekFrom::Start(u64::from(port))).is_err() {
            return 0;
        }
        match file.read_exact(&mut buf) {
            Ok(()) => buf[0],
            Err(_) => 0,
        }
    }

    /// Write one byte to a legacy I/O port. No-op when unavailable.
    pub fn write_io_port(&self, port: u16, value: u8) {
        let mut inner = self.inner.lock();
        let Some(driver) = inner.driver() else {
            return;
        };
        let Some(file) = driver.port.as_mut() else {
            return;
        };
        if file.seek(SeekFrom::Start(u64::from(port))).is_ok() {
            let _ = file.write_all(&[value]);
        }
    }

    /// Human-readable status of the gateway, empty when nothing notable
    /// happened.
    pub fn report(&self) -> String {
        let inner = self.inner.lock();
        if inner.report.is_empty() {
            return String::new();
        }
        let mut r = String::from("Register Access\n\n");
        r.push_str(&inner.report);
        r.push('\n');
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity;
    use serial_test::serial;

    #[test]
    fn test_pci_address_packing() {
        let addr = PciAddress::new(0, 0x18, 3);
        assert_eq!(addr.bus(), 0);
        assert_eq!(addr.device(), 0x18);
        assert_eq!(addr.function(), 3);
        assert_eq!(addr.to_string(), "00:18.3");
    }

    #[test]
    fn test_pci_address_masks_out_of_range() {
        let addr = PciAddress::new(1, 0xFF, 0xFF);
        assert_eq!(addr.bus(), 1);
        assert_eq!(addr.device(), 0x1F);
        assert_eq!(addr.function(), 7);
    }

    #[test]
    fn test_misaligned_pci_read_rejected_before_hardware() {
        let ring0 = Ring0::new();
        // Checked before the driver state, so this must fail with the
        // alignment reason even though the driver was never opened.
        let err = ring0
            .try_read_pci_config(PciAddress::new(0, 0, 0), 0xE5)
            .unwrap_err();
        assert!(matches!(err, RingmonError::MisalignedOffset(0xE5)));
        assert!(!ring0.is_open());
    }

    #[test]
    fn test_misaligned_pci_write_rejected() {
        let ring0 = Ring0::new();
        let err = ring0
            .try_write_pci_config(PciAddress::new(0, 0, 0), 0x2, 0)
            .unwrap_err();
        assert!(matches!(err, RingmonError::MisalignedOffset(0x2)));
    }

    #[test]
    #[serial]
    fn test_read_msr_restores_affinity() {
        let before = affinity::current_mask().unwrap();
        let ring0 = Ring0::new();
        // Succeeds or fails depending on privileges; either way the
        // caller's affinity mask must be back where it was.
        let _ = ring0.read_msr(0xC001_0042, before[0]);
        assert_eq!(affinity::current_mask().unwrap(), before);
    }

    #[test]
    fn test_open_is_idempotent() {
        let ring0 = Ring0::new();
        let first = ring0.open();
        assert_eq!(ring0.open(), first);
        assert_eq!(ring0.is_open(), first);
    }

    #[test]
    fn test_io_port_degrades_to_zero_without_driver() {
        let ring0 = Ring0::new();
        if !ring0.open() {
            assert_eq!(ring0.read_io_port(0x2E), 0);
            ring0.write_io_port(0x2E, 0x55);
        }
    }

    #[test]
    fn test_shared_is_one_instance() {
        let a = Ring0::shared();
        let b = Ring0::shared();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}

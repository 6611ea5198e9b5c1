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

use std::io;

/// Result type alias using RingmonError
pub type Result<T> = std::result::Result<T, RingmonError>;

/// Unified error type for all Ringmon operations
#[derive(thiserror::Error, Debug)]
pub enum RingmonError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("privileged driver not open")]
    DriverNotOpen,

    #[error("misaligned register offset: 0x{0:X} (must be 4-byte aligned)")]
    MisalignedOffset(u32),

    #[error("failed to pin thread affinity to cpu {cpu}: {source}")]
    AffinityPin {
        cpu: usize,
        source: io::Error,
    },

    #[error("serial link error: {0}")]
    Serial(String),

    #[error("HID error: {0}")]
    Hid(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("{0}")]
    Generic(String),
}

impl RingmonError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}

impl From<serialport::Error> for RingmonError {
    fn from(e: serialport::Error) -> Self {
        Self::Serial(e.to_string())
    }
}

impl From<hidapi::HidError> for RingmonError {
    fn from(e: hidapi::HidError) -> Self {
        Self::Hid(e.to_string())
    }
}

impl From<String> for RingmonError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for RingmonError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

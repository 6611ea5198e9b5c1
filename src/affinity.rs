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

//! Scoped thread-affinity pinning.
//!
//! MSR reads only make sense when issued from the logical processor that
//! owns the register, so the calling thread has to be pinned for the
//! duration of the read. The guard saves the thread's affinity mask on
//! construction and restores it on drop, so the mask is put back on every
//! exit path including panics. Pinning is a process-global, non-reentrant
//! OS property: callers must serialize around the pin/read/restore
//! sequence (see `ring0`).

use std::io;
use std::mem;

/// Restores the saved thread affinity mask when dropped.
pub struct AffinityGuard {
    previous: libc::cpu_set_t,
}

impl AffinityGuard {
    /// Pin the calling thread to a single logical processor.
    pub fn pin(cpu: usize) -> io::Result<AffinityGuard> {
        unsafe {
            let mut previous: libc::cpu_set_t = mem::zeroed();
            if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut previous) != 0 {
                return Err(io::Error::last_os_error());
            }

            let mut target: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut target);
            libc::CPU_SET(cpu, &mut target);
            if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &target) != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(AffinityGuard { previous })
        }
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        // Nothing sensible to do if the restore fails; the thread keeps
        // running on the pinned processor.
        unsafe {
            let _ = libc::sched_setaffinity(
                0,
                mem::size_of::<libc::cpu_set_t>(),
                &self.previous,
            );
        }
    }
}

/// The set of logical processors the calling thread may currently run on.
pub fn current_mask() -> io::Result<Vec<usize>> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut cpus = Vec::new();
        for cpu in 0..libc::CPU_SETSIZE as usize {
            if libc::CPU_ISSET(cpu, &set) {
                cpus.push(cpu);
            }
        }
        Ok(cpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_pin_restores_mask_on_drop() {
        let before = current_mask().unwrap();
        {
            let _guard = AffinityGuard::pin(before[0]).unwrap();
            assert_eq!(current_mask().unwrap(), vec![before[0]]);
        }
        assert_eq!(current_mask().unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_pin_restores_mask_on_panic() {
        let before = current_mask().unwrap();
        let cpu = before[0];
        let result = std::panic::catch_unwind(move || {
            let _guard = AffinityGuard::pin(cpu).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(current_mask().unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_failed_pin_leaves_mask_unchanged() {
        let before = current_mask().unwrap();
        // A processor index past the end of the set cannot be pinned.
        let _ = AffinityGuard::pin(libc::CPU_SETSIZE as usize - 1);
        assert_eq!(current_mask().unwrap(), before);
    }

    #[test]
    fn test_current_mask_not_empty() {
        assert!(!current_mask().unwrap().is_empty());
    }
}

/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

/// Boot-time configuration of the memory-management core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UvmConfig {
    /// How many physical segments can be registered at most
    pub max_segments: usize,

    /// Longest run of contiguous frames a single allocation may request
    pub max_run_frames: usize,

    /// Fill freed frames with [`POISON_BYTE`] so stale accesses stand out
    pub poison_freed_frames: bool,
}

/// Byte written to freed frames if [`UvmConfig::poison_freed_frames`] is set
pub const POISON_BYTE: u8 = 0xA5;

impl Default for UvmConfig {
    fn default() -> Self {
        Self {
            max_segments: 16,
            max_run_frames: 1024,
            poison_freed_frames: false,
        }
    }
}

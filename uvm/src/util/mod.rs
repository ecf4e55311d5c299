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

use crate::page::PAGE_SIZE;

/// efficient way to calculate: ceil(x / y)
pub(crate) fn ceil_div(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

pub(crate) fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub(crate) fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE as u64 - 1) == 0
}

/// Number of whole pages in `length` bytes
pub(crate) fn pages_in(length: usize) -> usize {
    length / PAGE_SIZE
}

/// Turns a leak that was already logged into a test failure
#[cfg(test)]
pub(crate) fn fail_on_leak(message: &str) {
    if !std::thread::panicking() {
        panic!("{}", message);
    }
}

#[cfg(not(test))]
pub(crate) fn fail_on_leak(_message: &str) {}

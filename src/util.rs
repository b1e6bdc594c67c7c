/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! This module implements utility functions.

use std::mem::size_of;
use std::slice;

/// Reinterprets the given reference as a slice of bytes.
pub fn reinterpret<T>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const _ as *const u8, size_of::<T>()) }
}

/// Reads a `T` from the beginning of the given byte slice.
///
/// The structure's fields are read verbatim, so `T` must be a packed on-disk
/// structure whose fields match the image's byte order.
///
/// If the slice is too short, the function returns `None`.
pub fn from_bytes<T: Copy>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    Some(unsafe { (buf.as_ptr() as *const T).read_unaligned() })
}

/// Performs a division of the given numbers, rounding the result up.
pub fn ceil_division(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Formats a Unix timestamp the way `ctime(3)` does, without the trailing
/// newline.
///
/// Timestamps in inodes are 32 bit, so no date before 1970 or after 2106 can
/// appear.
pub fn ctime(ts: u32) -> String {
    let mut tm = unsafe { std::mem::zeroed() };
    let t = ts as libc::time_t;
    let mut buf = [0i8; 32];
    unsafe {
        libc::localtime_r(&t, &mut tm);
        libc::strftime(
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            b"%a %b %e %H:%M:%S %Y\0".as_ptr() as *const _,
            &tm,
        );
        std::ffi::CStr::from_ptr(buf.as_ptr() as *const _)
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ceil() {
        assert_eq!(ceil_division(0, 4), 0);
        assert_eq!(ceil_division(1, 4), 1);
        assert_eq!(ceil_division(4, 4), 1);
        assert_eq!(ceil_division(5, 4), 2);
    }

    #[test]
    fn round_trip() {
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(C, packed)]
        struct S {
            a: u32,
            b: u16,
        }
        let s = S { a: 0x12345678, b: 0xabcd };
        let buf = reinterpret(&s).to_vec();
        let s2: S = from_bytes(&buf).unwrap();
        assert_eq!(s, s2);
        assert!(from_bytes::<S>(&buf[..4]).is_none());
    }
}

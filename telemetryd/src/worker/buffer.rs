//! Zero-copy-to-scripts packet buffer.
//!
//! A worker owns exactly one `SharedBuffer`. Each received chunk is copied
//! into it once (the unavoidable hop from the transport into process
//! memory); every parser and byte reader invoked for that packet then
//! operates on slices of the same buffer, with no further copies per read
//! or per parser attempt.

use std::sync::{Arc, Mutex};

use rhai::{EvalAltResult, Position};

pub struct SharedBuffer {
    bytes: Mutex<Vec<u8>>,
    capacity: usize,
}

impl SharedBuffer {
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        })
    }

    /// Copies `data` into the buffer, truncating to the buffer's capacity.
    /// Returns the number of bytes actually stored.
    pub fn fill(&self, data: &[u8]) -> usize {
        let n = data.len().min(self.capacity);
        let mut guard = self.bytes.lock().expect("shared buffer mutex poisoned");
        guard.clear();
        guard.extend_from_slice(&data[..n]);
        n
    }

    pub fn view(self: &Arc<Self>, len: usize) -> PacketView {
        PacketView {
            buffer: self.clone(),
            len,
        }
    }
}

/// A script-visible, bounds-checked window over the current packet.
/// Registered with the rhai engine as a custom type; every accessor takes
/// an explicit little-endian flag except the single-byte readers.
#[derive(Clone)]
pub struct PacketView {
    buffer: Arc<SharedBuffer>,
    len: usize,
}

fn bounds_error(offset: i64, size: usize, len: usize) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        format!("byte read out of bounds: offset {offset} + size {size} > len {len}").into(),
        Position::NONE,
    ))
}

impl PacketView {
    pub fn len(&mut self) -> i64 {
        self.len as i64
    }

    fn with_slice<T>(&self, offset: i64, size: usize, f: impl FnOnce(&[u8]) -> T) -> Result<T, Box<EvalAltResult>> {
        if offset < 0 {
            return Err(bounds_error(offset, size, self.len));
        }
        let offset = offset as usize;
        if offset + size > self.len {
            return Err(bounds_error(offset as i64, size, self.len));
        }
        let guard = self.buffer.bytes.lock().expect("shared buffer mutex poisoned");
        Ok(f(&guard[offset..offset + size]))
    }

    pub fn read_u8(&mut self, offset: i64) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 1, |b| b[0] as i64)
    }

    pub fn read_i8(&mut self, offset: i64) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 1, |b| b[0] as i8 as i64)
    }

    pub fn read_u16(&mut self, offset: i64, little_endian: bool) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 2, |b| {
            let arr: [u8; 2] = b.try_into().unwrap();
            (if little_endian { u16::from_le_bytes(arr) } else { u16::from_be_bytes(arr) }) as i64
        })
    }

    pub fn read_i16(&mut self, offset: i64, little_endian: bool) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 2, |b| {
            let arr: [u8; 2] = b.try_into().unwrap();
            (if little_endian { i16::from_le_bytes(arr) } else { i16::from_be_bytes(arr) }) as i64
        })
    }

    pub fn read_u32(&mut self, offset: i64, little_endian: bool) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 4, |b| {
            let arr: [u8; 4] = b.try_into().unwrap();
            (if little_endian { u32::from_le_bytes(arr) } else { u32::from_be_bytes(arr) }) as i64
        })
    }

    pub fn read_i32(&mut self, offset: i64, little_endian: bool) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 4, |b| {
            let arr: [u8; 4] = b.try_into().unwrap();
            (if little_endian { i32::from_le_bytes(arr) } else { i32::from_be_bytes(arr) }) as i64
        })
    }

    pub fn read_u64(&mut self, offset: i64, little_endian: bool) -> Result<i64, Box<EvalAltResult>> {
        self.with_slice(offset, 8, |b| {
            let arr: [u8; 8] = b.try_into().unwrap();
            (if little_endian { u64::from_le_bytes(arr) } else { u64::from_be_bytes(arr) }) as i64
        })
    }

    pub fn read_float(&mut self, offset: i64, little_endian: bool) -> Result<f64, Box<EvalAltResult>> {
        self.with_slice(offset, 4, |b| {
            let arr: [u8; 4] = b.try_into().unwrap();
            (if little_endian { f32::from_le_bytes(arr) } else { f32::from_be_bytes(arr) }) as f64
        })
    }

    pub fn read_double(&mut self, offset: i64, little_endian: bool) -> Result<f64, Box<EvalAltResult>> {
        self.with_slice(offset, 8, |b| {
            let arr: [u8; 8] = b.try_into().unwrap();
            if little_endian { f64::from_le_bytes(arr) } else { f64::from_be_bytes(arr) }
        })
    }

    pub fn read_string(&mut self, offset: i64, len: i64) -> Result<String, Box<EvalAltResult>> {
        let len = len.max(0) as usize;
        self.with_slice(offset, len, |b| String::from_utf8_lossy(b).into_owned())
    }

    /// Reads a NUL-terminated string starting at `offset`. Returns the
    /// empty string if no terminator is found before the packet's end.
    pub fn read_cstring(&mut self, offset: i64) -> Result<String, Box<EvalAltResult>> {
        if offset < 0 || offset as usize > self.len {
            return Err(bounds_error(offset, 0, self.len));
        }
        let offset = offset as usize;
        let guard = self.buffer.bytes.lock().expect("shared buffer mutex poisoned");
        let slice = &guard[offset..self.len];
        let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
    }
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_at_exact_boundary_succeeds() {
        let buf = SharedBuffer::with_capacity(16);
        buf.fill(&[1, 2, 3, 4]);
        let mut view = buf.view(4);
        assert_eq!(view.read_u8(3).unwrap(), 4);
    }

    #[test]
    fn read_past_boundary_errors() {
        let buf = SharedBuffer::with_capacity(16);
        buf.fill(&[1, 2, 3, 4]);
        let mut view = buf.view(4);
        assert!(view.read_u32(1, true).is_err());
    }

    #[test]
    fn little_and_big_endian_differ() {
        let buf = SharedBuffer::with_capacity(16);
        buf.fill(&[0x00, 0x01]);
        let mut view = buf.view(2);
        assert_eq!(view.read_u16(0, true).unwrap(), 0x0100);
        assert_eq!(view.read_u16(0, false).unwrap(), 0x0001);
    }

    #[test]
    fn cstring_stops_at_nul() {
        let buf = SharedBuffer::with_capacity(16);
        buf.fill(b"IMU\0trailing");
        let mut view = buf.view(12);
        assert_eq!(view.read_cstring(0).unwrap(), "IMU");
    }

    #[test]
    fn fill_truncates_to_capacity() {
        let buf = SharedBuffer::with_capacity(2);
        let n = buf.fill(&[1, 2, 3, 4]);
        assert_eq!(n, 2);
    }

    #[test]
    fn bytes_to_hex_formats_lowercase() {
        assert_eq!(bytes_to_hex(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    }
}

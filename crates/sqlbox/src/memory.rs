//! Typed access to the sandbox's linear memory.
//!
//! Everything here works on the byte slice for the *current* memory. The
//! slice must be fetched again after any call into the engine, which may
//! grow (and so move) the memory.

use crate::error::{Error, Result};
use crate::handle::SandboxPtr;

fn out_of_bounds(ptr: SandboxPtr, len: usize) -> Error {
    Error::OutOfBounds { ptr: ptr.0, len }
}

/// Borrow `len` bytes at `ptr`.
pub(crate) fn bytes(mem: &[u8], ptr: SandboxPtr, len: usize) -> Result<&[u8]> {
    let start = ptr.offset();
    start
        .checked_add(len)
        .and_then(|end| mem.get(start..end))
        .ok_or_else(|| out_of_bounds(ptr, len))
}

/// Mutably borrow `len` bytes at `ptr`.
pub(crate) fn bytes_mut(mem: &mut [u8], ptr: SandboxPtr, len: usize) -> Result<&mut [u8]> {
    let start = ptr.offset();
    start
        .checked_add(len)
        .and_then(|end| mem.get_mut(start..end))
        .ok_or_else(|| out_of_bounds(ptr, len))
}

/// Copy `data` into memory at `ptr`.
pub(crate) fn write_bytes(mem: &mut [u8], ptr: SandboxPtr, data: &[u8]) -> Result<()> {
    bytes_mut(mem, ptr, data.len())?.copy_from_slice(data);
    Ok(())
}

/// Read the zero-terminated string starting at `ptr`.
///
/// Invalid UTF-8 is replaced rather than rejected; the engine controls the
/// bytes and the terminator. A string that runs off the end of memory is
/// an error.
pub(crate) fn read_c_str(mem: &[u8], ptr: SandboxPtr) -> Result<String> {
    let tail = mem
        .get(ptr.offset()..)
        .ok_or_else(|| out_of_bounds(ptr, 1))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| out_of_bounds(ptr, tail.len() + 1))?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

/// Like [`read_c_str`], but a null pointer reads as `None`.
pub(crate) fn read_opt_c_str(mem: &[u8], ptr: SandboxPtr) -> Result<Option<String>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        read_c_str(mem, ptr).map(Some)
    }
}

/// Write `s` followed by a zero terminator at `ptr`. The destination must
/// hold `s.len() + 1` bytes.
pub(crate) fn write_c_str(mem: &mut [u8], ptr: SandboxPtr, s: &str) -> Result<()> {
    let dst = bytes_mut(mem, ptr, s.len() + 1)?;
    dst[..s.len()].copy_from_slice(s.as_bytes());
    dst[s.len()] = 0;
    Ok(())
}

fn read_array<const N: usize>(mem: &[u8], ptr: SandboxPtr) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes(mem, ptr, N)?);
    Ok(out)
}

pub(crate) fn read_u32(mem: &[u8], ptr: SandboxPtr) -> Result<u32> {
    read_array(mem, ptr).map(u32::from_le_bytes)
}

pub(crate) fn read_i32(mem: &[u8], ptr: SandboxPtr) -> Result<i32> {
    read_array(mem, ptr).map(i32::from_le_bytes)
}

pub(crate) fn read_i64(mem: &[u8], ptr: SandboxPtr) -> Result<i64> {
    read_array(mem, ptr).map(i64::from_le_bytes)
}

pub(crate) fn read_f64(mem: &[u8], ptr: SandboxPtr) -> Result<f64> {
    read_array(mem, ptr).map(f64::from_le_bytes)
}

/// Read a pointer-sized slot (wasm32 pointers are four bytes).
pub(crate) fn read_ptr(mem: &[u8], ptr: SandboxPtr) -> Result<SandboxPtr> {
    read_u32(mem, ptr).map(SandboxPtr)
}

pub(crate) fn write_i32(mem: &mut [u8], ptr: SandboxPtr, value: i32) -> Result<()> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

pub(crate) fn write_u32(mem: &mut [u8], ptr: SandboxPtr, value: u32) -> Result<()> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

pub(crate) fn write_f64(mem: &mut [u8], ptr: SandboxPtr, value: f64) -> Result<()> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

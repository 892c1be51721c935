use crc::{CRC_32_ISO_HDLC, Crc};
use nalgebra::{Quaternion, Vector3};

/// CRC-32 (ISO HDLC / zip / ethernet), the checksum the firmware's CRC32 library produces.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the CRC-32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Computes the CRC-32 of several slices as if they were one contiguous buffer.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut digest = CRC32.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// Reads N bytes from `bytes` at `idx` and advances the index.
fn take<const N: usize>(bytes: &[u8], idx: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[*idx..*idx + N]);
    *idx += N;
    out
}

pub fn read_u8(bytes: &[u8], idx: &mut usize) -> u8 {
    take::<1>(bytes, idx)[0]
}

pub fn read_u32(bytes: &[u8], idx: &mut usize) -> u32 {
    u32::from_le_bytes(take(bytes, idx))
}

pub fn read_i32(bytes: &[u8], idx: &mut usize) -> i32 {
    i32::from_le_bytes(take(bytes, idx))
}

pub fn read_u64(bytes: &[u8], idx: &mut usize) -> u64 {
    u64::from_le_bytes(take(bytes, idx))
}

pub fn read_f32(bytes: &[u8], idx: &mut usize) -> f32 {
    f32::from_le_bytes(take(bytes, idx))
}

pub fn read_vec3(bytes: &[u8], idx: &mut usize) -> Vector3<f32> {
    let x = read_f32(bytes, idx);
    let y = read_f32(bytes, idx);
    let z = read_f32(bytes, idx);
    Vector3::new(x, y, z)
}

/// Reads a quaternion stored as `x, y, z, w`, the layout the firmware uses.
pub fn read_quat(bytes: &[u8], idx: &mut usize) -> Quaternion<f32> {
    let x = read_f32(bytes, idx);
    let y = read_f32(bytes, idx);
    let z = read_f32(bytes, idx);
    let w = read_f32(bytes, idx);
    Quaternion::new(w, x, y, z)
}

pub fn put_vec3(out: &mut Vec<u8>, v: &Vector3<f32>) {
    out.extend_from_slice(&v.x.to_le_bytes());
    out.extend_from_slice(&v.y.to_le_bytes());
    out.extend_from_slice(&v.z.to_le_bytes());
}

pub fn put_quat(out: &mut Vec<u8>, q: &Quaternion<f32>) {
    out.extend_from_slice(&q.i.to_le_bytes());
    out.extend_from_slice(&q.j.to_le_bytes());
    out.extend_from_slice(&q.k.to_le_bytes());
    out.extend_from_slice(&q.w.to_le_bytes());
}

/// Zero-pads `out` up to `size` bytes.
pub fn pad_to(out: &mut Vec<u8>, size: usize) {
    debug_assert!(out.len() <= size);
    out.resize(size, 0);
}

/// Decodes bytes as UTF-8, replacing invalid sequences and NUL characters so the result is
/// always printable.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', " ")
}

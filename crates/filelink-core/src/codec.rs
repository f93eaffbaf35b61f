//! 小端定宽整数编解码
//!
//! 所有读取都做越界检查，越界返回 [`DecodeError::OutOfRange`]，绝不补零。
//! 编码按目标宽度截断，与外设固件的线格式一致。

use crate::error::DecodeError;

fn take<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], DecodeError> {
    offset
        .checked_add(N)
        .and_then(|end| bytes.get(offset..end))
        .and_then(|slice| slice.try_into().ok())
        .ok_or(DecodeError::OutOfRange {
            offset,
            width: N,
            len: bytes.len(),
        })
}

pub fn read_u8(bytes: &[u8], offset: usize) -> Result<u8, DecodeError> {
    take::<1>(bytes, offset).map(|b| b[0])
}

pub fn read_u16_le(bytes: &[u8], offset: usize) -> Result<u16, DecodeError> {
    take(bytes, offset).map(u16::from_le_bytes)
}

pub fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32, DecodeError> {
    take(bytes, offset).map(u32::from_le_bytes)
}

pub fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64, DecodeError> {
    take(bytes, offset).map(u64::from_le_bytes)
}

#[allow(clippy::cast_possible_truncation)]
pub fn to_bytes_16(value: u64) -> [u8; 2] {
    (value as u16).to_le_bytes()
}

#[allow(clippy::cast_possible_truncation)]
pub fn to_bytes_32(value: u64) -> [u8; 4] {
    (value as u32).to_le_bytes()
}

pub fn to_bytes_64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// 小写十六进制，每字节两位，无分隔符。仅用于日志诊断。
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_little_endian() {
        let buf = [0x34, 0x12, 0x78, 0x56, 0x00, 0x00, 0x00, 0x80];
        assert_eq!(read_u16_le(&buf, 0).unwrap(), 0x1234);
        assert_eq!(read_u32_le(&buf, 0).unwrap(), 0x5678_1234);
        assert_eq!(read_u16_le(&buf, 6).unwrap(), 0x8000);
        assert_eq!(read_u64_le(&buf, 0).unwrap(), 0x8000_0000_5678_1234);
    }

    #[test]
    fn test_read_out_of_range() {
        let buf = [1, 2, 3];
        assert_eq!(
            read_u32_le(&buf, 0),
            Err(DecodeError::OutOfRange {
                offset: 0,
                width: 4,
                len: 3
            })
        );
        assert!(read_u16_le(&buf, 2).is_err());
        assert!(read_u16_le(&buf, usize::MAX).is_err());
        assert!(read_u8(&[], 0).is_err());
        assert_eq!(read_u16_le(&buf, 1).unwrap(), 0x0302);
    }

    #[test]
    fn test_encode_truncates() {
        assert_eq!(to_bytes_16(0x1_2345), [0x45, 0x23]);
        assert_eq!(to_bytes_32(0x1_0000_0001), [0x01, 0, 0, 0]);
        assert_eq!(to_bytes_64(1), [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_roundtrip_law() {
        for v in [0u64, 1, 0xff, 0xffff, 0x1_0000, 0xdead_beef, u64::MAX] {
            assert_eq!(u64::from(read_u16_le(&to_bytes_16(v), 0).unwrap()), v & 0xffff);
            assert_eq!(
                u64::from(read_u32_le(&to_bytes_32(v), 0).unwrap()),
                v & 0xffff_ffff
            );
            assert_eq!(read_u64_le(&to_bytes_64(v), 0).unwrap(), v);
        }
    }

    #[test]
    fn test_hex() {
        assert_eq!(to_hex(&[]), "");
        let s = to_hex(&[0x00, 0x0a, 0xff, 0x5c]);
        assert_eq!(s, "000aff5c");
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}

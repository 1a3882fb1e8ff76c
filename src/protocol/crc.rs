//! Checksums for framed payloads.

/// CRC-16/MODBUS reflected polynomial.
const CRC_POLYNOMIAL: u16 = 0xA001;

/// Initial CRC value
const CRC_INITIAL: u16 = 0xFFFF;

/// Calculate the 8-bit additive checksum used as the frame trailer.
///
/// The sum of all bytes, modulo 256.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Calculate CRC-16/MODBUS.
///
/// Reflected polynomial 0xA001, initial value 0xFFFF, no final XOR.
///
/// # Example
///
/// ```
/// use blue_manager::protocol::crc16_modbus;
///
/// assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
/// ```
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = CRC_INITIAL;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

//! Sum-based CRC validation.
//!
//! Deliberately **not** a polynomial CRC: CRC16 here is a cumulative 16-bit sum, not
//! CRC16-IBM/CCITT/Modbus. A device speaking one of those will not interoperate with a pattern
//! relying on this validator. See the design notes in `SPEC_FULL.md` §4.2/§9.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::codec::FieldKind;

/// The shape a last-field-is-a-CRC check expects: the algorithm plus the byte order used to read
/// the CRC field itself (only meaningful for CRC16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcKind {
    Crc8,
    Crc16Le,
    Crc16Be,
}

impl CrcKind {
    /// Map a terminal field's kind to the CRC algorithm it implies, if any.
    pub fn from_field_kind(kind: FieldKind) -> Option<CrcKind> {
        match kind {
            FieldKind::U8 => Some(CrcKind::Crc8),
            FieldKind::U16Le => Some(CrcKind::Crc16Le),
            FieldKind::U16Be => Some(CrcKind::Crc16Be),
            _ => None,
        }
    }
}

/// Result of validating a packet's trailing CRC field.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// No candidate CRC field was present at the terminal position.
    NotChecked,
    Valid,
    /// Carries a human-readable expected/actual mismatch description.
    Invalid(String),
}

impl Verdict {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Verdict::Invalid(_))
    }
}

/// Validate `packet[..offset + width]` against a CRC field found at byte `offset`.
///
/// `kind` is `None` when the last decoded field isn't a CRC candidate, in which case validation
/// is vacuously true ([`Verdict::NotChecked`]).
pub fn validate(packet: &[u8], offset: usize, kind: Option<CrcKind>) -> Verdict {
    let kind = match kind {
        Some(k) => k,
        None => return Verdict::NotChecked,
    };

    match kind {
        CrcKind::Crc8 => {
            if offset >= packet.len() {
                return Verdict::NotChecked;
            }
            let expected = sum8(&packet[..offset]);
            let actual = packet[offset];
            if expected == actual {
                Verdict::Valid
            } else {
                Verdict::Invalid(format!(
                    "crc8 mismatch: expected {expected:#04x}, got {actual:#04x}"
                ))
            }
        }
        CrcKind::Crc16Le | CrcKind::Crc16Be => {
            if offset + 2 > packet.len() {
                return Verdict::NotChecked;
            }
            let expected = sum16(&packet[..offset]);
            let actual = match kind {
                CrcKind::Crc16Le => LittleEndian::read_u16(&packet[offset..offset + 2]),
                CrcKind::Crc16Be => BigEndian::read_u16(&packet[offset..offset + 2]),
                CrcKind::Crc8 => unreachable!(),
            };
            if expected == actual {
                Verdict::Valid
            } else {
                Verdict::Invalid(format!(
                    "crc16 mismatch: expected {expected:#06x}, got {actual:#06x}"
                ))
            }
        }
    }
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn sum16(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_matches_byte_sum() {
        let packet = [0xAA, 0x01, 0x02, 0xAD]; // 0xAA+0x01+0x02 = 0xAD
        assert_eq!(
            validate(&packet, 3, Some(CrcKind::Crc8)),
            Verdict::Valid
        );
    }

    #[test]
    fn crc8_mutated_prefix_is_invalid() {
        let packet = [0xAB, 0x01, 0x02, 0xAD];
        assert!(validate(&packet, 3, Some(CrcKind::Crc8)).is_invalid());
    }

    #[test]
    fn crc16_le_cumulative_sum() {
        // sum = 0xAA + 0x00 + 0x08 + 0x00 + 0x05 + 0x01 = 0xB8
        let packet = [0xAA, 0x00, 0x08, 0x00, 0x05, 0x01, 0xB8, 0x00];
        assert_eq!(
            validate(&packet, 6, Some(CrcKind::Crc16Le)),
            Verdict::Valid
        );
    }

    #[test]
    fn no_candidate_field_is_vacuously_true() {
        assert_eq!(validate(&[1, 2, 3], 2, None), Verdict::NotChecked);
    }

    #[test]
    fn from_field_kind_maps_crc_candidates_only() {
        assert_eq!(CrcKind::from_field_kind(FieldKind::U8), Some(CrcKind::Crc8));
        assert_eq!(
            CrcKind::from_field_kind(FieldKind::U16Le),
            Some(CrcKind::Crc16Le)
        );
        assert_eq!(CrcKind::from_field_kind(FieldKind::U32Le), None);
    }
}

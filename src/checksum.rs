//! CRC32C (Castagnoli) checksums.
//!
//! This crate treats the CRC32C primitive itself as a black box (spec.md §1
//! scope note) and consumes the `crc32c` crate for it — `crc32fast` computes
//! CRC-32/IEEE rather than CRC-32C/Castagnoli and does not reproduce the
//! vectors in [`tests::crc_standard_vectors`].
//!
//! On top of the raw checksum we add the same `Mask`/`Unmask` transform
//! every LevelDB-family format uses before persisting a checksum: storing a
//! masked CRC avoids accidentally computing the CRC of data that already
//! contains a CRC of itself.

/// Delta applied by [`mask`], chosen (as in the LevelDB family of formats)
/// so that masking a valid CRC never yields a small, easily-colliding value.
const MASK_DELTA: u32 = 0xa282_ead8;

/// Computes the CRC32C of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Extends a previously computed CRC32C (as returned by [`crc32c`]) with
/// additional bytes, equivalent to (but cheaper than) recomputing the CRC
/// of the whole concatenation.
pub fn extend(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Masks a CRC32C value for storage.
///
/// Rotate right by 15 bits and add a constant; this is the standard
/// transform used so that a masked CRC is never equal to the unmasked CRC
/// for any input, and so that encoding a CRC inside data whose CRC is in
/// turn computed does not produce a fixed point.
pub fn mask(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Reverses [`mask`].
pub fn unmask(masked_crc: u32) -> u32 {
    let rot = masked_crc.wrapping_sub(MASK_DELTA);
    rot.rotate_left(15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // RFC 3720 §B.4 standard CRC32C test vectors.
    #[test]
    fn crc_standard_vectors() {
        assert_eq!(crc32c(&[0u8; 32]), 0x8a91_36aa);
        assert_eq!(crc32c(&[0xffu8; 32]), 0x62a8_ab43);

        let ascending: Vec<u8> = (0..32).collect();
        assert_eq!(crc32c(&ascending), 0x46dd_794e);

        let descending: Vec<u8> = (0..32).rev().collect();
        assert_eq!(crc32c(&descending), 0x113f_db5c);

        let iscsi: [u8; 48] = [
            0x01, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00,
            0x00, 0x14, 0x00, 0x00, 0x00, 0x18,
        ];
        assert_eq!(crc32c(&iscsi), 0xd996_3a56);
    }

    #[test]
    fn extend_matches_whole_buffer_crc() {
        let whole = crc32c(b"hello world");
        let extended = extend(crc32c(b"hello "), b"world");
        assert_eq!(whole, extended);
    }

    #[test]
    fn mask_unmask_round_trip() {
        for c in [0u32, 1, 0xffff_ffff, 0x1234_5678] {
            assert_eq!(unmask(mask(c)), c);
        }
    }

    proptest! {
        #[test]
        fn mask_never_fixed_point(c in any::<u32>()) {
            prop_assert_ne!(mask(c), c);
        }

        #[test]
        fn mask_unmask_round_trips_for_any_u32(c in any::<u32>()) {
            prop_assert_eq!(unmask(mask(c)), c);
        }
    }
}

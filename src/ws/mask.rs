//! Payload masking.

/// XOR the buffer with the 4-byte mask key.
///
/// Each payload byte at index `i` is combined with `mask[i % 4]`. The
/// operation is its own inverse, so it serves both masking and unmasking.
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_roundtrip() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let unmasked = vec![
            0xf3, 0x00, 0x01, 0x02, 0x03, 0x80, 0x81, 0x82, 0xff, 0xfe, 0x00, 0x17, 0x74,
            0xf9, 0x12, 0x03,
        ];

        let mut masked = unmasked.clone();
        apply_mask(&mut masked, mask);
        assert_ne!(masked, unmasked);

        apply_mask(&mut masked, mask);
        assert_eq!(masked, unmasked);
    }

    #[test]
    fn mask_not_multiple_of_four() {
        let mask = [1, 2, 3, 4];
        let mut buf = vec![0u8; 7];
        apply_mask(&mut buf, mask);
        assert_eq!(buf, vec![1, 2, 3, 4, 1, 2, 3]);
    }
}

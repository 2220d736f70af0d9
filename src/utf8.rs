//! UTF-8 validation for text payloads
//!
//! An ASCII prefix is skipped eight bytes at a time; the remainder goes
//! through the scalar validator, which enforces the full RFC 3629 rules
//! (no overlong encodings, no surrogates, nothing above U+10FFFF).

const ASCII_HIGH_BITS: u64 = 0x8080_8080_8080_8080;

/// Validate that the input is well-formed UTF-8.
///
/// The fast path stops at the first 8-byte chunk containing a non-ASCII byte;
/// since an ASCII prefix never splits a multi-byte sequence, validating the
/// remainder alone is equivalent to validating the whole input.
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    let mut i = 0;

    while i + 8 <= data.len() {
        let chunk: [u8; 8] = data[i..i + 8].try_into().expect("8-byte chunk");
        if u64::from_ne_bytes(chunk) & ASCII_HIGH_BITS != 0 {
            break;
        }
        i += 8;
    }

    std::str::from_utf8(&data[i..]).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ascii() {
        assert!(validate_utf8(b""));
        assert!(validate_utf8(b"Hello, World!"));
        assert!(validate_utf8(&b"x".repeat(1000)));
    }

    #[test]
    fn valid_multibyte() {
        assert!(validate_utf8("κόσμε".as_bytes()));
        assert!(validate_utf8("日本語".as_bytes()));
        assert!(validate_utf8("🎉🎉🎉".as_bytes()));
        // Boundary codepoints: U+007F, U+0080, U+07FF, U+0800, U+FFFF, U+10000, U+10FFFF
        assert!(validate_utf8("\u{7f}\u{80}\u{7ff}\u{800}\u{ffff}\u{10000}\u{10ffff}".as_bytes()));
        // Smallest legal lead sequences around the surrogate gap
        assert!(validate_utf8(&[0xed, 0x9f, 0xbf])); // U+D7FF
        assert!(validate_utf8(&[0xee, 0x80, 0x80])); // U+E000
    }

    #[test]
    fn rejects_overlong_encodings() {
        assert!(!validate_utf8(&[0xc0, 0x80])); // overlong NUL
        assert!(!validate_utf8(&[0xc0, 0x81]));
        assert!(!validate_utf8(&[0xc1, 0xbf]));
        assert!(!validate_utf8(&[0xe0, 0x80, 0x80]));
        assert!(!validate_utf8(&[0xe0, 0x9f, 0xbf]));
        assert!(!validate_utf8(&[0xf0, 0x80, 0x80, 0x80]));
        assert!(!validate_utf8(&[0xf0, 0x8f, 0xbf, 0xbf]));
    }

    #[test]
    fn rejects_surrogates() {
        assert!(!validate_utf8(&[0xed, 0xa0, 0x80])); // U+D800
        assert!(!validate_utf8(&[0xed, 0xad, 0xbf]));
        assert!(!validate_utf8(&[0xed, 0xbf, 0xbf])); // U+DFFF
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(!validate_utf8(&[0xf4, 0x90, 0x80, 0x80])); // U+110000
        assert!(!validate_utf8(&[0xf5, 0x80, 0x80, 0x80]));
        assert!(!validate_utf8(&[0xfe]));
        assert!(!validate_utf8(&[0xff]));
    }

    #[test]
    fn rejects_truncated_sequences() {
        assert!(!validate_utf8(&[0xc2]));
        assert!(!validate_utf8(&[0xe4, 0xb8]));
        assert!(!validate_utf8(&[0xf0, 0x9f, 0x8e]));
        assert!(!validate_utf8(&[0x80])); // bare continuation byte
    }

    #[test]
    fn hostile_input_straddling_chunk_boundary() {
        // Multi-byte sequences that begin inside, at, and across the 8-byte
        // fast-path boundary must behave exactly like the scalar validator.
        for pad in 0..16 {
            let mut good = b"a".repeat(pad);
            good.extend_from_slice("日本語".as_bytes());
            assert!(validate_utf8(&good), "valid input failed at pad {}", pad);

            let mut truncated = b"a".repeat(pad);
            truncated.extend_from_slice(&[0xe4, 0xb8]); // missing third byte
            assert!(!validate_utf8(&truncated), "truncated passed at pad {}", pad);

            let mut surrogate = b"a".repeat(pad);
            surrogate.extend_from_slice(&[0xed, 0xa0, 0x80]);
            assert!(!validate_utf8(&surrogate), "surrogate passed at pad {}", pad);
        }
    }
}

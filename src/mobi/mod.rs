//! Mobi/KF8 container primitives: headers, EXTH metadata, compression,
//! INDX decoding, rawML assembly.

pub mod exth;
pub mod headers;
pub mod huffcdic;
pub mod index;
pub mod palmdoc;
pub mod rawml;

pub use headers::{Codec, Compression, MobiHeader, NULL_INDEX};

const BASE32_DIGITS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Encode a number in Kindle base32 (digits 0-9A-V), zero-padded to
/// `npad` digits. Used for `kindle:pos:fid` round-trips.
pub fn to_base32(value: u64, npad: usize) -> String {
    let mut digits = Vec::new();
    let mut current = value;
    while current != 0 {
        digits.push(BASE32_DIGITS[(current % 32) as usize]);
        current /= 32;
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    while digits.len() < npad {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap()
}

/// Decode Kindle base32 (0-9A-V, lowercase tolerated) to a number.
/// Used for `kindle:` URI references like `kindle:embed:XXXX`.
pub fn from_base32(s: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in s {
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as u64,
            b'A'..=b'V' => (b - b'A') as u64 + 10,
            b'a'..=b'v' => (b - b'a') as u64 + 10,
            _ => continue,
        };
        value = value.wrapping_mul(32).wrapping_add(digit);
    }
    value
}

/// Decode record bytes to a string with the container's codec.
pub fn decode_text(codec: Codec, bytes: &[u8]) -> String {
    match codec {
        Codec::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Codec::Windows1252 => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// Mobipocket language table: `(lang_id, default, &[(sublang_id, tag)])`.
///
/// Only sublanguages that map to a distinct IANA tag are listed; anything
/// else falls back to the bare language tag.
#[rustfmt::skip]
const MOBI_LANGUAGES: &[(u8, &str, &[(u8, &str)])] = &[
    (1,  "ar", &[(5, "ar-dz"), (15, "ar-bh"), (3, "ar-eg"), (2, "ar-iq"), (11, "ar-jo"),
                 (13, "ar-kw"), (12, "ar-lb"), (4, "ar-ly"), (6, "ar-ma"), (8, "ar-om"),
                 (16, "ar-qa"), (1, "ar-sa"), (10, "ar-sy"), (7, "ar-tn"), (14, "ar-ae"),
                 (9, "ar-ye")]),
    (2,  "bg", &[]),
    (3,  "ca", &[]),
    (4,  "zh", &[(3, "zh-hk"), (2, "zh-cn"), (4, "zh-sg"), (1, "zh-tw")]),
    (5,  "cs", &[]),
    (6,  "da", &[]),
    (7,  "de", &[(3, "de-at"), (5, "de-li"), (4, "de-lu"), (2, "de-ch")]),
    (8,  "el", &[]),
    (9,  "en", &[(3, "en-au"), (40, "en-bz"), (4, "en-ca"), (6, "en-ie"), (8, "en-jm"),
                 (5, "en-nz"), (13, "en-ph"), (7, "en-za"), (11, "en-tt"), (2, "en-gb"),
                 (1, "en-us"), (12, "en-zw")]),
    (10, "es", &[(44, "es-ar"), (64, "es-bo"), (52, "es-cl"), (36, "es-co"), (20, "es-cr"),
                 (28, "es-do"), (48, "es-ec"), (68, "es-sv"), (16, "es-gt"), (72, "es-hn"),
                 (8, "es-mx"), (76, "es-ni"), (24, "es-pa"), (60, "es-py"), (40, "es-pe"),
                 (80, "es-pr"), (56, "es-uy"), (32, "es-ve")]),
    (11, "fi", &[]),
    (12, "fr", &[(2, "fr-be"), (3, "fr-ca"), (5, "fr-lu"), (6, "fr-mc"), (4, "fr-ch")]),
    (13, "he", &[]),
    (14, "hu", &[]),
    (15, "is", &[]),
    (16, "it", &[(2, "it-ch")]),
    (17, "ja", &[]),
    (18, "ko", &[]),
    (19, "nl", &[(2, "nl-be")]),
    (20, "no", &[]),
    (21, "pl", &[]),
    (22, "pt", &[(1, "pt-br")]),
    (23, "rm", &[]),
    (24, "ro", &[]),
    (25, "ru", &[]),
    (26, "hr", &[(3, "sr")]),
    (27, "sk", &[]),
    (28, "sq", &[]),
    (29, "sv", &[(8, "sv-fi")]),
    (30, "th", &[]),
    (31, "tr", &[]),
    (32, "ur", &[]),
    (33, "id", &[]),
    (34, "uk", &[]),
    (35, "be", &[]),
    (36, "sl", &[]),
    (37, "et", &[]),
    (38, "lv", &[]),
    (39, "lt", &[]),
    (41, "fa", &[]),
    (42, "vi", &[]),
    (43, "hy", &[]),
    (44, "az", &[]),
    (45, "eu", &[]),
    (46, "sb", &[]),
    (47, "mk", &[]),
    (48, "sx", &[]),
    (49, "ts", &[]),
    (50, "tn", &[]),
    (52, "xh", &[]),
    (53, "zu", &[]),
    (54, "af", &[]),
    (55, "ka", &[]),
    (56, "fo", &[]),
    (57, "hi", &[]),
    (58, "mt", &[]),
    (59, "sz", &[]),
    (62, "ms", &[]),
    (63, "kk", &[]),
    (65, "sw", &[]),
    (67, "uz", &[]),
    (68, "tt", &[]),
    (69, "bn", &[]),
    (70, "pa", &[]),
    (71, "gu", &[]),
    (72, "or", &[]),
    (73, "ta", &[]),
    (74, "te", &[]),
    (75, "kn", &[]),
    (76, "ml", &[]),
    (77, "as", &[]),
    (78, "mr", &[]),
    (79, "sa", &[]),
    (87, "x-kok", &[]),
    (97, "ne", &[]),
];

/// Map a Mobipocket language/sublanguage id pair to an IANA tag,
/// defaulting to `en`.
pub fn language_tag(lang_id: u8, sublang_id: u8) -> &'static str {
    for &(id, base, subs) in MOBI_LANGUAGES {
        if id == lang_id {
            for &(sub, tag) in subs {
                if sub == sublang_id {
                    return tag;
                }
            }
            return base;
        }
    }
    "en"
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_base32_encode() {
        assert_eq!(to_base32(0, 4), "0000");
        assert_eq!(to_base32(1, 4), "0001");
        assert_eq!(to_base32(31, 4), "000V");
        assert_eq!(to_base32(32, 4), "0010");
        assert_eq!(to_base32(1, 10), "0000000001");
        // no truncation when the value needs more digits than the pad
        assert_eq!(to_base32(32 * 32 * 32, 2), "1000");
    }

    #[test]
    fn test_base32_decode() {
        assert_eq!(from_base32(b"0000"), 0);
        assert_eq!(from_base32(b"000V"), 31);
        assert_eq!(from_base32(b"0010"), 32);
        assert_eq!(from_base32(b"00v"), 31);
    }

    proptest! {
        #[test]
        fn base32_roundtrip(n in 0u64..(1 << 40), pad in 0usize..12) {
            prop_assert_eq!(from_base32(to_base32(n, pad).as_bytes()), n);
        }
    }

    #[test]
    fn test_language_tag() {
        assert_eq!(language_tag(9, 0), "en");
        assert_eq!(language_tag(9, 2), "en-gb");
        assert_eq!(language_tag(12, 3), "fr-ca");
        assert_eq!(language_tag(12, 99), "fr");
        assert_eq!(language_tag(0, 0), "en");
    }

    #[test]
    fn test_decode_text_cp1252() {
        assert_eq!(decode_text(Codec::Windows1252, &[0x93, 0x41, 0x94]), "\u{201c}A\u{201d}");
        assert_eq!(decode_text(Codec::Utf8, "caf\u{e9}".as_bytes()), "caf\u{e9}");
    }
}

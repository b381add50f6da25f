//! Incremental text-stream safety checks: trailing UTF-8 completeness and
//! stop-string detection over raw generated bytes.
//!
//! Generated text accumulates as bytes because a single sampled token may
//! decode to a partial multi-byte character; only a verified prefix is ever
//! flushed to the caller.

/// Length of the longest prefix of `bytes` that does not end in a cut-off
/// multi-byte UTF-8 sequence.
///
/// Looks back at most 4 bytes and classifies lead bytes by their high-bit
/// pattern. A lead byte whose continuation bytes have not all arrived marks
/// the cut point; everything before it is safe to flush.
pub fn utf8_valid_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in 1..=len.min(4) {
        let c = bytes[len - i];
        if c & 0xE0 == 0xC0 {
            // 110xxxxx: lead of a 2-byte sequence
            if i < 2 {
                return len - i;
            }
        } else if c & 0xF0 == 0xE0 {
            // 1110xxxx: lead of a 3-byte sequence
            if i < 3 {
                return len - i;
            }
        } else if c & 0xF8 == 0xF0 {
            // 11110xxx: lead of a 4-byte sequence
            if i < 4 {
                return len - i;
            }
        }
    }
    len
}

/// First occurrence of `needle` in `haystack` at or after `from`.
pub fn find_bytes_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Position where a suffix of `text` forms a proper prefix of `stop`, if any.
///
/// Used to decide how much trailing text must be withheld from streaming: the
/// stop string may still be completed by tokens that have not been sampled yet.
pub fn find_partial_stop(stop: &[u8], text: &[u8]) -> Option<usize> {
    if text.is_empty() || stop.is_empty() {
        return None;
    }
    let last = *text.last().unwrap();
    for ci in (0..stop.len()).rev() {
        if stop[ci] == last {
            let partial = &stop[..=ci];
            if text.ends_with(partial) {
                return Some(text.len() - ci - 1);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_ascii() {
        assert_eq!(utf8_valid_prefix_len(b"hello"), 5);
        assert_eq!(utf8_valid_prefix_len(b""), 0);
    }

    #[test]
    fn test_complete_multibyte() {
        let s = "日本語".as_bytes();
        assert_eq!(utf8_valid_prefix_len(s), s.len());
    }

    #[test]
    fn test_cut_two_byte() {
        // "é" = 0xC3 0xA9; drop the continuation byte
        let mut v = b"ok".to_vec();
        v.push(0xC3);
        assert_eq!(utf8_valid_prefix_len(&v), 2);
    }

    #[test]
    fn test_cut_three_byte() {
        // "日" = 0xE6 0x97 0xA5
        let mut v = b"a".to_vec();
        v.extend_from_slice(&[0xE6, 0x97]);
        assert_eq!(utf8_valid_prefix_len(&v), 1);
    }

    #[test]
    fn test_cut_four_byte() {
        // U+1F600 = 0xF0 0x9F 0x98 0x80
        let mut v = Vec::new();
        v.extend_from_slice(&[0xF0, 0x9F, 0x98]);
        assert_eq!(utf8_valid_prefix_len(&v), 0);
    }

    #[test]
    fn test_find_bytes_from() {
        assert_eq!(find_bytes_from(b"abcabc", b"bc", 0), Some(1));
        assert_eq!(find_bytes_from(b"abcabc", b"bc", 2), Some(4));
        assert_eq!(find_bytes_from(b"abcabc", b"xy", 0), None);
        assert_eq!(find_bytes_from(b"abc", b"", 0), None);
    }

    #[test]
    fn test_partial_stop_suffix() {
        // "</" is a prefix of "</s>" sitting at the end of the text
        assert_eq!(find_partial_stop(b"</s>", b"hello</"), Some(5));
        assert_eq!(find_partial_stop(b"</s>", b"hello<"), Some(5));
        assert_eq!(find_partial_stop(b"</s>", b"hello</s"), Some(5));
    }

    #[test]
    fn test_partial_stop_absent() {
        assert_eq!(find_partial_stop(b"</s>", b"hello"), None);
        assert_eq!(find_partial_stop(b"</s>", b""), None);
    }
}

use std::cmp::Ordering;

/// Orders the keys of an index tree.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Interprets keys as big-endian signed integers of up to eight bytes.
/// Longer keys are ordered by their first eight bytes, then bytewise.
pub struct IntegerComparator;

impl IntegerComparator {
    fn value(key: &[u8]) -> i64 {
        let len = key.len().min(8);
        let mut raw = [0u8; 8];
        raw[8 - len..].copy_from_slice(&key[..len]);
        // sign-extend short keys
        if len > 0 && len < 8 && key[0] & 0x80 != 0 {
            raw[..8 - len].fill(0xff);
        }
        i64::from_be_bytes(raw)
    }

    /// Encodes `value` as a key this comparator orders numerically.
    pub fn key(value: i64) -> Vec<u8> {
        value.to_be_bytes().to_vec()
    }
}

impl KeyComparator for IntegerComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::value(a)
            .cmp(&Self::value(b))
            .then_with(|| a.get(8..).unwrap_or(&[]).cmp(b.get(8..).unwrap_or(&[])))
    }
}

/// Orders keys with `memcmp` semantics.
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_comparator_orders_numerically() {
        let cmp = IntegerComparator;
        let keys = [-300i64, -1, 0, 7, 256, i64::MAX];
        for pair in keys.windows(2) {
            assert_eq!(
                cmp.compare(&IntegerComparator::key(pair[0]), &IntegerComparator::key(pair[1])),
                Ordering::Less
            );
        }
        // short keys are sign-extended
        assert_eq!(cmp.compare(&[0xff], &IntegerComparator::key(-1)), Ordering::Equal);
        assert_eq!(cmp.compare(&[0x01, 0x00], &IntegerComparator::key(256)), Ordering::Equal);

        // bytes past the eighth break ties
        let mut long = IntegerComparator::key(1);
        long.push(5);
        assert_eq!(cmp.compare(&long, &IntegerComparator::key(1)), Ordering::Greater);
        assert_eq!(cmp.compare(&IntegerComparator::key(2), &long), Ordering::Greater);
        assert_eq!(cmp.compare(&[], &[0x00]), Ordering::Equal);
    }

    #[test]
    fn test_bytewise_comparator() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(cmp.compare(b"ab", b"abc"), Ordering::Less);
        assert_eq!(cmp.compare(b"b", b"abc"), Ordering::Greater);
    }
}

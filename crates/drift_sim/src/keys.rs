//! Synthetic key generation and split-key computation.
//!
//! Two key families are used by scenarios:
//! - random lowercase keys for plain range layouts
//! - table/row keys in the memcomparable ("mvcc") byte encoding
//!
//! The memcomparable encoding splits a key into 8-byte groups, pads the last
//! group with zeros and appends a marker `0xFF - pad` to every group, so the
//! encoded bytes sort exactly like the raw bytes.

use std::collections::BTreeSet;

use rand::Rng;

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xFF;
const SIGN_MASK: u64 = 1 << 63;
const TABLE_PREFIX: &[u8] = b"t";
const RECORD_PREFIX_SEP: &[u8] = b"_r";
/// Length of keys from [`generate_keys`].
pub const KEY_LEN: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("malformed encoded key at byte {offset}")]
    MalformedKey { offset: usize },
    #[error("empty key range")]
    EmptyRange,
}

/// `n` distinct random keys over `[a-z]`, sorted.
pub fn generate_keys<R: Rng>(rng: &mut R, n: usize) -> Vec<Vec<u8>> {
    let mut keys = BTreeSet::new();
    while keys.len() < n {
        let key: Vec<u8> = (0..KEY_LEN).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        keys.insert(key);
    }
    keys.into_iter().collect()
}

/// Big-endian encoding with the sign bit flipped so negative values sort first.
fn encode_int(v: i64) -> [u8; 8] {
    ((v as u64) ^ SIGN_MASK).to_be_bytes()
}

/// Raw row key of `row` in `table`.
pub fn table_row_key(table: i64, row: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(19);
    key.extend_from_slice(TABLE_PREFIX);
    key.extend_from_slice(&encode_int(table));
    key.extend_from_slice(RECORD_PREFIX_SEP);
    key.extend_from_slice(&encode_int(row));
    key
}

/// Encoded row key with the trailing `0xFF` table-suffix delimiter.
pub fn generate_table_key(table: i64, row: i64) -> Vec<u8> {
    let mut key = table_row_key(table, row);
    key.push(0xFF);
    encode_bytes(&key)
}

/// `size` encoded table keys in ascending order, tables `1..=tables`.
pub fn generate_table_keys(tables: usize, size: usize) -> Vec<Vec<u8>> {
    let per_table = (size / tables.max(1)).max(1);
    (0..size)
        .map(|i| generate_table_key((i / per_table) as i64 + 1, (i % per_table) as i64))
        .collect()
}

/// Memcomparable encoding of `data`.
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let groups = data.len() / ENC_GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (ENC_GROUP_SIZE + 1));
    for chunk_start in (0..=data.len()).step_by(ENC_GROUP_SIZE) {
        let chunk = &data[chunk_start..(chunk_start + ENC_GROUP_SIZE).min(data.len())];
        let pad = ENC_GROUP_SIZE - chunk.len();
        out.extend_from_slice(chunk);
        out.extend(std::iter::repeat(0).take(pad));
        out.push(ENC_MARKER - pad as u8);
    }
    out
}

/// Inverse of [`encode_bytes`]. The whole input must be consumed.
pub fn decode_bytes(data: &[u8]) -> Result<Vec<u8>, KeyError> {
    let mut out = Vec::with_capacity(data.len());
    let mut offset = 0;
    loop {
        let group = data
            .get(offset..offset + ENC_GROUP_SIZE + 1)
            .ok_or(KeyError::MalformedKey { offset })?;
        let marker = group[ENC_GROUP_SIZE];
        let pad = usize::from(ENC_MARKER - marker);
        if pad > ENC_GROUP_SIZE {
            return Err(KeyError::MalformedKey {
                offset: offset + ENC_GROUP_SIZE,
            });
        }
        let used = ENC_GROUP_SIZE - pad;
        if group[used..ENC_GROUP_SIZE].iter().any(|b| *b != 0) {
            return Err(KeyError::MalformedKey { offset: offset + used });
        }
        out.extend_from_slice(&group[..used]);
        offset += ENC_GROUP_SIZE + 1;
        if pad > 0 {
            break;
        }
    }
    if offset != data.len() {
        return Err(KeyError::MalformedKey { offset });
    }
    Ok(out)
}

/// `start < key < end`, with an empty `end` unbounded.
fn strictly_between(start: &[u8], key: &[u8], end: &[u8]) -> bool {
    start < key && (end.is_empty() || key < end)
}

/// Key strictly between `start` and `end` (empty `end` = unbounded).
///
/// Keys are read as base-256 fractions and the midpoint is taken with one
/// extra digit of precision. Fails with [`KeyError::EmptyRange`] when no key
/// lies strictly between the bounds.
pub fn generate_split_key(start: &[u8], end: &[u8]) -> Result<Vec<u8>, KeyError> {
    if !end.is_empty() && start >= end {
        return Err(KeyError::EmptyRange);
    }
    let len = start.len().max(end.len()) + 1;
    let mut digits = vec![0u32; len];
    for (i, b) in start.iter().enumerate() {
        digits[i] += u32::from(*b);
    }
    for (i, b) in end.iter().enumerate() {
        digits[i] += u32::from(*b);
    }
    // An open end counts as 1.0.
    let mut whole = u32::from(end.is_empty());
    for i in (0..len).rev() {
        let carry = digits[i] >> 8;
        digits[i] &= 0xFF;
        if i == 0 {
            whole += carry;
        } else {
            digits[i - 1] += carry;
        }
    }

    let mut rem = whole;
    let mut mid = Vec::with_capacity(len);
    for d in digits {
        let cur = (rem << 8) | d;
        mid.push((cur >> 1) as u8);
        rem = cur & 1;
    }
    while mid.last() == Some(&0) {
        mid.pop();
    }
    if strictly_between(start, &mid, end) {
        return Ok(mid);
    }

    // Numerically equal bounds: `end` is `start` followed by zeros.
    let mut succ = start.to_vec();
    succ.push(0);
    if strictly_between(start, &succ, end) {
        return Ok(succ);
    }
    Err(KeyError::EmptyRange)
}

/// Split key for memcomparable-encoded bounds; the result is encoded too.
pub fn generate_encoded_split_key(start: &[u8], end: &[u8]) -> Result<Vec<u8>, KeyError> {
    if start.is_empty() && end.is_empty() {
        return Ok(generate_table_key(0, 0));
    }
    let mut lo = if start.is_empty() {
        Vec::new()
    } else {
        decode_bytes(start)?
    };
    if end.is_empty() {
        lo.push(0xFF);
        return Ok(encode_bytes(&lo));
    }
    let mut hi = decode_bytes(end)?;

    let width = lo.len().max(hi.len());
    lo.resize(width, 0);
    hi.resize(width, 0);
    if lo >= hi {
        return Err(KeyError::EmptyRange);
    }

    // hi - 1 as a big-endian integer; cannot underflow since hi > lo >= 0.
    for b in hi.iter_mut().rev() {
        if *b > 0 {
            *b -= 1;
            break;
        }
        *b = 0xFF;
    }
    if hi == lo {
        hi.push(0xFF);
    }
    Ok(encode_bytes(&hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn random_keys_are_sorted_and_distinct() {
        let mut rng = SmallRng::seed_from_u64(7);
        let keys = generate_keys(&mut rng, 200);
        assert_eq!(keys.len(), 200);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(keys
            .iter()
            .all(|k| k.len() == KEY_LEN && k.iter().all(u8::is_ascii_lowercase)));
    }

    #[test]
    fn encoding_pads_full_groups() {
        assert_eq!(encode_bytes(b""), vec![0, 0, 0, 0, 0, 0, 0, 0, 0xF7]);
        let enc = encode_bytes(b"12345678");
        assert_eq!(enc.len(), 18);
        assert_eq!(enc[8], 0xFF);
        assert_eq!(enc[17], 0xF7);
        assert_eq!(decode_bytes(&enc).unwrap(), b"12345678");
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut enc = encode_bytes(b"abc");
        enc.push(1);
        assert_eq!(decode_bytes(&enc), Err(KeyError::MalformedKey { offset: 9 }));
        assert!(decode_bytes(&enc[..5]).is_err());
    }

    #[test]
    fn table_keys_are_ordered() {
        let keys = generate_table_keys(10, 40);
        assert_eq!(keys.len(), 40);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys[4], generate_table_key(2, 0));
        let raw = decode_bytes(&keys[0]).unwrap();
        assert_eq!(raw.last(), Some(&0xFF));
        assert_eq!(&raw[..raw.len() - 1], table_row_key(1, 0).as_slice());
    }

    #[test]
    fn split_key_of_open_range() {
        assert_eq!(generate_split_key(b"", b""), Ok(vec![0x80]));
        assert_eq!(generate_split_key(b"a", b"c"), Ok(b"b".to_vec()));
        let k = generate_split_key(b"zzz", b"").unwrap();
        assert!(k.as_slice() > b"zzz".as_slice());
    }

    #[test]
    fn split_key_of_adjacent_bounds() {
        assert_eq!(generate_split_key(b"a", b"a\0\0"), Ok(b"a\0".to_vec()));
        // Nothing exists between a key and its immediate successor.
        assert_eq!(generate_split_key(b"a", b"a\0"), Err(KeyError::EmptyRange));
    }

    #[test]
    fn split_key_rejects_empty_and_inverted_ranges() {
        assert_eq!(generate_split_key(b"abc", b"abc"), Err(KeyError::EmptyRange));
        assert_eq!(generate_split_key(b"b", b"a"), Err(KeyError::EmptyRange));
        assert_eq!(generate_split_key(b"", b"\0"), Err(KeyError::EmptyRange));
    }

    #[test]
    fn encoded_split_key_stays_inside() {
        let start = generate_table_key(3, 0);
        let end = generate_table_key(3, 1);
        let mid = generate_encoded_split_key(&start, &end).unwrap();
        assert!(start < mid && mid < end);
        assert!(decode_bytes(&mid).is_ok());

        let open = generate_encoded_split_key(&end, b"").unwrap();
        assert!(open > end);
        assert_eq!(
            generate_encoded_split_key(b"", b"").unwrap(),
            generate_table_key(0, 0)
        );
    }

    #[test]
    fn encoded_split_key_rejects_inverted_range() {
        let a = generate_table_key(3, 0);
        assert_eq!(
            generate_encoded_split_key(&a, &a),
            Err(KeyError::EmptyRange)
        );
        assert!(matches!(
            generate_encoded_split_key(b"junk", &a),
            Err(KeyError::MalformedKey { .. })
        ));
    }

    proptest! {
        #[test]
        fn encoding_preserves_order(
            a in proptest::collection::vec(any::<u8>(), 0..24),
            b in proptest::collection::vec(any::<u8>(), 0..24),
        ) {
            let (ea, eb) = (encode_bytes(&a), encode_bytes(&b));
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
            prop_assert_eq!(decode_bytes(&ea).unwrap(), a);
        }

        #[test]
        fn split_key_is_strictly_inside(
            a in proptest::collection::vec(any::<u8>(), 0..6),
            b in proptest::collection::vec(any::<u8>(), 0..6),
        ) {
            let (start, end) = if a < b { (a, b) } else { (b, a) };
            prop_assume!(start != end);
            let mut succ = start.clone();
            succ.push(0);
            prop_assume!(end != succ);
            let k = generate_split_key(&start, &end).unwrap();
            prop_assert!(start < k && k < end, "{:?} {:?} {:?}", start, k, end);
        }

        #[test]
        fn repeated_splitting_never_inverts(
            start in proptest::collection::vec(any::<u8>(), 0..4),
        ) {
            let mut end: Vec<u8> = Vec::new();
            for _ in 0..64 {
                let Ok(k) = generate_split_key(&start, &end) else {
                    // Bounds are adjacent.
                    let mut succ = start.clone();
                    succ.push(0);
                    prop_assert_eq!(&end, &succ);
                    break;
                };
                prop_assert!(k > start);
                prop_assert!(end.is_empty() || k < end);
                end = k;
            }
        }

        #[test]
        fn encoded_split_key_preserves_order(
            t1 in 1i64..20, r1 in 0i64..1000,
            t2 in 1i64..20, r2 in 0i64..1000,
        ) {
            let a = generate_table_key(t1, r1);
            let b = generate_table_key(t2, r2);
            prop_assume!(a != b);
            let (start, end) = if a < b { (a, b) } else { (b, a) };
            let mid = generate_encoded_split_key(&start, &end).unwrap();
            prop_assert!(start < mid && mid < end);
            let raw = decode_bytes(&mid).unwrap();
            prop_assert!(decode_bytes(&start).unwrap() < raw);
            prop_assert!(raw < decode_bytes(&end).unwrap());
        }
    }
}

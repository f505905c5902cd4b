use fixedbitset::FixedBitSet;

/// Bitset holding `2^width` positions, all clear.
pub fn create_bitset(width: u32) -> FixedBitSet {
    FixedBitSet::with_capacity(1usize << width)
}

/// Lowest set position at or after `from`.
pub fn next_set(b: &FixedBitSet, from: usize) -> Option<usize> {
    b.ones().find(|&i| i >= from)
}

/// Lowest clear position at or after `from`, bounded by the bitset length.
pub fn next_clear(b: &FixedBitSet, from: usize) -> Option<usize> {
    b.zeroes().find(|&i| i >= from)
}

/// Sets `idx`, growing the bitset when needed.
pub fn set_grow(b: &mut FixedBitSet, idx: usize) {
    if idx >= b.len() {
        b.grow(idx + 1);
    }
    b.insert(idx);
}

/// Clears `idx` if it is inside the bitset.
pub fn clear_bit(b: &mut FixedBitSet, idx: usize) {
    if idx < b.len() {
        b.set(idx, false);
    }
}

/// Marks the network and broadcast host ids of a subnet as taken.
pub fn init_subnet_bitset(b: &mut FixedBitSet, subnet_len: u32) {
    let max = (1usize << (32 - subnet_len)) - 1;
    set_grow(b, max);
    set_grow(b, 0);
}

/// Inverse of [`init_subnet_bitset`].
pub fn clear_reserved_entries(b: &mut FixedBitSet, subnet_len: u32) {
    let max = (1usize << (32 - subnet_len)) - 1;
    clear_bit(b, max);
    clear_bit(b, 0);
}

fn range_print(start: usize, end: usize) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// Compresses the set positions into `"a-b, c"` form, shifting every
/// printed value by `offset`. Returns the number of set positions too.
pub fn compress_runs(b: &FixedBitSet, offset: usize) -> (usize, String) {
    let mut runs: Vec<String> = Vec::new();
    let mut count = 0;
    let mut current: Option<(usize, usize)> = None;

    for i in b.ones() {
        count += 1;
        current = match current {
            Some((s, e)) if e + 1 == i => Some((s, i)),
            Some((s, e)) => {
                runs.push(range_print(s + offset, e + offset));
                Some((i, i))
            }
            None => Some((i, i)),
        };
    }
    if let Some((s, e)) = current {
        runs.push(range_print(s + offset, e + offset));
    }

    (count, runs.join(", "))
}

/// Persisted form of a bitset: its length and the set positions.
///
/// Use with `#[serde(with = "libresource::bitset::serde_bits")]` on every
/// stored `FixedBitSet`.
pub mod serde_bits {
    use fixedbitset::FixedBitSet;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Bits {
        len: usize,
        ones: Vec<usize>,
    }

    pub fn serialize<S: Serializer>(b: &FixedBitSet, s: S) -> Result<S::Ok, S::Error> {
        Bits {
            len: b.len(),
            ones: b.ones().collect(),
        }
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FixedBitSet, D::Error> {
        let bits = Bits::deserialize(d)?;
        let mut b = FixedBitSet::with_capacity(bits.len);
        for i in bits.ones {
            if i >= bits.len {
                return Err(serde::de::Error::custom(format!(
                    "bit {i} outside bitset of length {}",
                    bits.len
                )));
            }
            b.insert(i);
        }
        Ok(b)
    }
}

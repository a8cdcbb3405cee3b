//! Elias-Fano encoding of strictly increasing integer sequences.
//!
//! Each key in an inverted-index segment stores the sorted set of
//! transaction numbers that touched it as one of these sequences. Values
//! split into `l` low bits, stored packed, and high bits, stored as a unary
//! bit vector; `l` is derived from the count and the largest value so both
//! sides stay near the information-theoretic minimum.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

fn floor_log2(x: u64) -> u32 {
    63 - x.leading_zeros()
}

fn read_bits(words: &[u64], bit_pos: u64, width: u32) -> u64 {
    if width == 0 {
        return 0;
    }
    let word = (bit_pos / 64) as usize;
    let off = (bit_pos % 64) as u32;
    let mut v = words[word] >> off;
    if off + width > 64 {
        v |= words[word + 1] << (64 - off);
    }
    if width == 64 {
        v
    } else {
        v & ((1u64 << width) - 1)
    }
}

fn write_bits(words: &mut [u64], bit_pos: u64, width: u32, value: u64) {
    if width == 0 {
        return;
    }
    let word = (bit_pos / 64) as usize;
    let off = (bit_pos % 64) as u32;
    words[word] |= value << off;
    if off + width > 64 {
        words[word + 1] |= value >> (64 - off);
    }
}

fn set_bit(words: &mut [u64], pos: u64) {
    words[(pos / 64) as usize] |= 1u64 << (pos % 64);
}

/// Derived layout parameters shared by builder and reader. `None` when the
/// declared bounds overflow the word counts, which only a forged header can
/// produce.
fn layout(count: u64, max: u64) -> Option<(u32, usize, usize)> {
    let universe = max.saturating_add(1);
    let l = if count == 0 || universe <= count {
        0
    } else {
        floor_log2(universe / count)
    };
    let lower_bits = count.checked_mul(u64::from(l))?;
    let lower_words = usize::try_from((lower_bits.checked_add(63)?) / 64).ok()?;
    let upper_bits = count.checked_add(max >> l)?.checked_add(1)?;
    let upper_words = usize::try_from((upper_bits.checked_add(63)?) / 64).ok()?;
    Some((l, lower_words, upper_words))
}

pub struct EliasFanoBuilder {
    count: u64,
    max: u64,
    l: u32,
    lower: Vec<u64>,
    upper: Vec<u64>,
    pushed: u64,
    last: Option<u64>,
}

impl EliasFanoBuilder {
    /// `count` values in `[0, max]` will be pushed, strictly increasing.
    pub fn new(count: u64, max: u64) -> Result<Self> {
        let (l, lower_words, upper_words) = layout(count, max).ok_or_else(|| {
            Error::InvalidState(format!(
                "elias-fano bounds (count {}, max {}) overflow the word layout",
                count, max
            ))
        })?;
        Ok(Self {
            count,
            max,
            l,
            lower: vec![0; lower_words],
            upper: vec![0; upper_words],
            pushed: 0,
            last: None,
        })
    }

    pub fn push(&mut self, value: u64) -> Result<()> {
        if self.pushed == self.count {
            return Err(Error::InvalidState(
                "elias-fano builder received more values than declared".into(),
            ));
        }
        if value > self.max || self.last.is_some_and(|prev| value <= prev) {
            return Err(Error::InvalidState(format!(
                "elias-fano values must be strictly increasing and within bound, got {}",
                value
            )));
        }
        let i = self.pushed;
        write_bits(
            &mut self.lower,
            i * u64::from(self.l),
            self.l,
            value & low_mask(self.l),
        );
        set_bit(&mut self.upper, (value >> self.l) + i);
        self.pushed += 1;
        self.last = Some(value);
        Ok(())
    }

    pub fn build(self) -> Result<EliasFano> {
        if self.pushed != self.count {
            return Err(Error::InvalidState(format!(
                "elias-fano builder expected {} values, got {}",
                self.count, self.pushed
            )));
        }
        Ok(EliasFano::assemble(
            self.count, self.max, self.l, self.lower, self.upper,
        ))
    }
}

fn low_mask(l: u32) -> u64 {
    if l == 0 {
        0
    } else if l == 64 {
        u64::MAX
    } else {
        (1u64 << l) - 1
    }
}

pub struct EliasFano {
    count: u64,
    max: u64,
    l: u32,
    lower: Vec<u64>,
    upper: Vec<u64>,
    // Cumulative set-bit count per upper word, rebuilt on load.
    jump: Vec<u64>,
}

impl EliasFano {
    fn assemble(count: u64, max: u64, l: u32, lower: Vec<u64>, upper: Vec<u64>) -> Self {
        let mut jump = Vec::with_capacity(upper.len());
        let mut ones = 0u64;
        for word in &upper {
            ones += u64::from(word.count_ones());
            jump.push(ones);
        }
        Self {
            count,
            max,
            l,
            lower,
            upper,
            jump,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Value at index `i`; `i` must be below `count`.
    pub fn get(&self, i: u64) -> u64 {
        let low = read_bits(&self.lower, i * u64::from(self.l), self.l);
        let high = self.select1(i) - i;
        (high << self.l) | low
    }

    /// Bit position of the (i+1)-th set bit in the upper vector.
    fn select1(&self, i: u64) -> u64 {
        let target = i + 1;
        let word = self.jump.partition_point(|&ones| ones < target);
        let before = if word == 0 { 0 } else { self.jump[word - 1] };
        let mut remaining = target - before;
        let mut bits = self.upper[word];
        loop {
            let tz = bits.trailing_zeros() as u64;
            remaining -= 1;
            if remaining == 0 {
                return word as u64 * 64 + tz;
            }
            bits &= bits - 1;
        }
    }

    /// Smallest stored value `>= v`, if any.
    pub fn search(&self, v: u64) -> Option<u64> {
        if self.count == 0 || v > self.max {
            return None;
        }
        let mut lo = 0u64;
        let mut hi = self.count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.get(mid) < v {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == self.count {
            None
        } else {
            Some(self.get(lo))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.count).map(|i| self.get(i))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 16 + 8 * (self.lower.len() + self.upper.len())];
        BigEndian::write_u64(&mut out[0..8], self.count);
        BigEndian::write_u64(&mut out[8..16], self.max);
        let mut at = 16;
        for word in self.lower.iter().chain(self.upper.iter()) {
            BigEndian::write_u64(&mut out[at..at + 8], *word);
            at += 8;
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<EliasFano> {
        if bytes.len() < 16 {
            return Err(Error::Corruption("elias-fano blob shorter than header".into()));
        }
        let count = BigEndian::read_u64(&bytes[0..8]);
        let max = BigEndian::read_u64(&bytes[8..16]);
        // Header bounds are validated before any word count is derived or
        // any buffer sized from them.
        let (l, lower_words, upper_words) = layout(count, max).ok_or_else(|| {
            Error::Corruption(format!(
                "elias-fano header declares impossible bounds (count {}, max {})",
                count, max
            ))
        })?;
        let expect = lower_words
            .checked_add(upper_words)
            .and_then(|words| words.checked_mul(8))
            .and_then(|body| body.checked_add(16))
            .ok_or_else(|| {
                Error::Corruption("elias-fano header declares impossible bounds".into())
            })?;
        if bytes.len() != expect {
            return Err(Error::Corruption(format!(
                "elias-fano blob length {} does not match header (want {})",
                bytes.len(),
                expect
            )));
        }
        let mut at = 16;
        let mut read_words = |n: usize| {
            let mut words = Vec::with_capacity(n);
            for _ in 0..n {
                words.push(BigEndian::read_u64(&bytes[at..at + 8]));
                at += 8;
            }
            words
        };
        let lower = read_words(lower_words);
        let upper = read_words(upper_words);
        Ok(EliasFano::assemble(count, max, l, lower, upper))
    }
}

/// Union of two sequences as a fresh sequence bounded by the combined max.
pub fn union(a: &EliasFano, b: &EliasFano) -> Result<EliasFano> {
    let mut merged = Vec::with_capacity((a.count() + b.count()) as usize);
    let mut ia = a.iter().peekable();
    let mut ib = b.iter().peekable();
    loop {
        let next = match (ia.peek(), ib.peek()) {
            (Some(&x), Some(&y)) => {
                if x < y {
                    ia.next()
                } else if y < x {
                    ib.next()
                } else {
                    ib.next();
                    ia.next()
                }
            }
            (Some(_), None) => ia.next(),
            (None, Some(_)) => ib.next(),
            (None, None) => break,
        };
        if let Some(v) = next {
            merged.push(v);
        }
    }
    let max = merged.last().copied().unwrap_or(0);
    let mut builder = EliasFanoBuilder::new(merged.len() as u64, max)?;
    for v in merged {
        builder.push(v)?;
    }
    builder.build()
}

/// Union directly over serialized blobs, for the merge path.
pub fn union_bytes(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    let merged = union(&EliasFano::from_bytes(a)?, &EliasFano::from_bytes(b)?)?;
    Ok(merged.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[u64]) -> EliasFano {
        let max = values.last().copied().unwrap_or(0);
        let mut builder = EliasFanoBuilder::new(values.len() as u64, max).unwrap();
        for &v in values {
            builder.push(v).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_get_roundtrip() {
        let values = [1u64, 4, 6, 8, 41, 979, 100_000, 1_000_001];
        let ef = encode(&values);
        assert_eq!(ef.count(), values.len() as u64);
        assert_eq!(ef.max(), 1_000_001);
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(ef.get(i as u64), v);
        }
        assert_eq!(ef.iter().collect::<Vec<_>>(), values);
    }

    #[test]
    fn test_dense_sequence() {
        let values: Vec<u64> = (10..500).collect();
        let ef = encode(&values);
        assert_eq!(ef.iter().collect::<Vec<_>>(), values);
    }

    #[test]
    fn test_search() {
        let ef = encode(&[3, 7, 9, 40]);
        assert_eq!(ef.search(0), Some(3));
        assert_eq!(ef.search(3), Some(3));
        assert_eq!(ef.search(4), Some(7));
        assert_eq!(ef.search(9), Some(9));
        assert_eq!(ef.search(10), Some(40));
        assert_eq!(ef.search(40), Some(40));
        assert_eq!(ef.search(41), None);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let values = [0u64, 5, 17, 4096, 1 << 40];
        let ef = encode(&values);
        let restored = EliasFano::from_bytes(&ef.to_bytes()).unwrap();
        assert_eq!(restored.iter().collect::<Vec<_>>(), values);
    }

    #[test]
    fn test_from_bytes_rejects_hostile_header() {
        // Forged headers must be rejected, never sized from.
        let mut blob = vec![0u8; 24];
        BigEndian::write_u64(&mut blob[0..8], 0);
        BigEndian::write_u64(&mut blob[8..16], u64::MAX);
        assert!(matches!(
            EliasFano::from_bytes(&blob),
            Err(Error::Corruption(_))
        ));

        BigEndian::write_u64(&mut blob[0..8], u64::MAX);
        BigEndian::write_u64(&mut blob[8..16], u64::MAX);
        assert!(matches!(
            EliasFano::from_bytes(&blob),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        let blob = encode(&[1, 2, 3]).to_bytes();
        assert!(EliasFano::from_bytes(&blob[..blob.len() - 1]).is_err());
        assert!(EliasFano::from_bytes(&blob[..8]).is_err());
    }

    #[test]
    fn test_builder_rejects_disorder() {
        let mut builder = EliasFanoBuilder::new(3, 10).unwrap();
        builder.push(5).unwrap();
        assert!(builder.push(5).is_err());
        assert!(builder.push(4).is_err());
    }

    #[test]
    fn test_union() {
        let merged = union(&encode(&[1, 5, 9]), &encode(&[2, 5, 100])).unwrap();
        assert_eq!(merged.iter().collect::<Vec<_>>(), vec![1, 2, 5, 9, 100]);
    }

    #[test]
    fn test_union_associative() {
        let a = [1u64, 8, 30];
        let b = [2u64, 8, 512];
        let c = [3u64, 30, 512, 7777];

        let ab_c = union(&union(&encode(&a), &encode(&b)).unwrap(), &encode(&c)).unwrap();
        let a_bc = union(&encode(&a), &union(&encode(&b), &encode(&c)).unwrap()).unwrap();

        let mut all: Vec<u64> = a.iter().chain(&b).chain(&c).copied().collect();
        all.sort_unstable();
        all.dedup();

        assert_eq!(ab_c.iter().collect::<Vec<_>>(), all);
        assert_eq!(a_bc.iter().collect::<Vec<_>>(), all);
    }
}

//! Minimal perfect hash index over the keys of a sealed segment.
//!
//! Built offline from (key, offset) pairs and opened read-only through a
//! memory mapping. Construction is probabilistic: keys are salted into
//! buckets and each bucket searches for a displacement that lands its keys
//! on free slots. A collision (identical salted hashes, or a bucket that
//! cannot be displaced) restarts the whole build with the next seed from a
//! fixed list; that retry is internal and never surfaces as an error.
//! Looking up a key that was never inserted returns some resident key's
//! offset, so callers pair the lookup with a key match on the data file.

use std::fs::File;
use std::hash::Hasher as _;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use fnv::FnvHasher;
use memmap2::Mmap;

use crate::error::{Error, Result};

const INDEX_MAGIC: u32 = 0x5354_5249; // "STRI"
const HEADER_LEN: usize = 28; // magic + salt + key_count + bucket_count

/// Average keys per bucket; small buckets keep displacement search cheap.
const BUCKET_SIZE: u64 = 4;
const MAX_DISPLACEMENT: u32 = 1 << 16;

/// Seeds tried in order before construction is declared failed.
const SEEDS: [u64; 20] = [
    0x106393c187cae21a,
    0x6453cec3f7376937,
    0x643e521ddbd2be98,
    0x3740c6412f6572cb,
    0x717d47562f1ce470,
    0x4cd6eb4c63befb7c,
    0x9bfd8c5e18c8da73,
    0x082f20e10092a9a3,
    0x2ada2ce68d21defc,
    0xe33cb4f3e7c6466b,
    0x3980be458c509c59,
    0xc466fd9584828e8c,
    0x45f0aabe1a61ede6,
    0xf6e7b8b33ad9b98d,
    0x4ef95e25f4b4983d,
    0x81175195173b92d3,
    0x4e50927d8dd15978,
    0x1ea2099d1fafae7f,
    0x425c8a06fbaaa815,
    0xcd4216006c74052a,
];

fn mix64(mut z: u64) -> u64 {
    z ^= z >> 30;
    z = z.wrapping_mul(0xbf58476d1ce4e5b9);
    z ^= z >> 27;
    z = z.wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

fn salted_hash(key: &[u8], salt: u64) -> u64 {
    let mut hasher = FnvHasher::with_key(salt);
    hasher.write(key);
    mix64(hasher.finish())
}

/// Map a uniformly distributed `x` onto `[0, n)`.
fn remap(x: u64, n: u64) -> u64 {
    ((u128::from(x) * u128::from(n)) >> 64) as u64
}

fn slot_for(hash: u64, displacement: u32, slot_count: u64) -> u64 {
    remap(
        mix64(hash ^ u64::from(displacement).wrapping_mul(0x9e3779b97f4a7c15)),
        slot_count,
    )
}

/// One failed construction attempt; retried with the next seed.
struct Collision;

pub struct HashIndexBuilder {
    pairs: Vec<(Vec<u8>, u64)>,
}

impl HashIndexBuilder {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn add(&mut self, key: &[u8], offset: u64) {
        self.pairs.push((key.to_vec(), offset));
    }

    pub fn key_count(&self) -> u64 {
        self.pairs.len() as u64
    }

    /// Build and write the index file, retrying across the seed list.
    pub fn build(&self, path: &Path) -> Result<()> {
        if self.pairs.is_empty() {
            return write_index(path, SEEDS[0], 0, &[], &[]);
        }
        for &salt in &SEEDS {
            match self.try_layout(salt) {
                Ok((displacements, slots)) => {
                    return write_index(
                        path,
                        salt,
                        self.pairs.len() as u64,
                        &displacements,
                        &slots,
                    );
                }
                Err(Collision) => {
                    tracing::debug!(salt, path = %path.display(), "hash collision, retrying with next seed");
                }
            }
        }
        Err(Error::IndexBuild(format!(
            "every seed collided building {}; key set may contain duplicates",
            path.display()
        )))
    }

    fn try_layout(&self, salt: u64) -> std::result::Result<(Vec<u32>, Vec<u64>), Collision> {
        let n = self.pairs.len() as u64;
        let bucket_count = (n + BUCKET_SIZE - 1) / BUCKET_SIZE;

        let mut buckets: Vec<Vec<(u64, u64)>> = vec![Vec::new(); bucket_count as usize];
        for (key, offset) in &self.pairs {
            let hash = salted_hash(key, salt);
            buckets[remap(hash, bucket_count) as usize].push((hash, *offset));
        }
        for bucket in &mut buckets {
            bucket.sort_unstable_by_key(|&(hash, _)| hash);
            if bucket.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(Collision);
            }
        }

        let mut order: Vec<usize> = (0..buckets.len()).collect();
        order.sort_unstable_by_key(|&b| std::cmp::Reverse(buckets[b].len()));

        let mut taken = vec![false; n as usize];
        let mut slots = vec![0u64; n as usize];
        let mut displacements = vec![0u32; bucket_count as usize];
        let mut scratch = Vec::with_capacity(BUCKET_SIZE as usize * 2);

        for &b in &order {
            let bucket = &buckets[b];
            if bucket.is_empty() {
                continue;
            }
            let mut placed = false;
            'displacement: for d in 0..MAX_DISPLACEMENT {
                scratch.clear();
                for &(hash, _) in bucket {
                    let slot = slot_for(hash, d, n);
                    if taken[slot as usize] || scratch.contains(&slot) {
                        continue 'displacement;
                    }
                    scratch.push(slot);
                }
                for (&(_, offset), &slot) in bucket.iter().zip(scratch.iter()) {
                    taken[slot as usize] = true;
                    slots[slot as usize] = offset;
                }
                displacements[b] = d;
                placed = true;
                break;
            }
            if !placed {
                return Err(Collision);
            }
        }
        Ok((displacements, slots))
    }
}

impl Default for HashIndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_index(
    path: &Path,
    salt: u64,
    key_count: u64,
    displacements: &[u32],
    slots: &[u64],
) -> Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    out.write_u32::<BigEndian>(INDEX_MAGIC)?;
    out.write_u64::<BigEndian>(salt)?;
    out.write_u64::<BigEndian>(key_count)?;
    out.write_u64::<BigEndian>(displacements.len() as u64)?;
    for &d in displacements {
        out.write_u32::<BigEndian>(d)?;
    }
    for &offset in slots {
        out.write_u64::<BigEndian>(offset)?;
    }
    out.flush()?;
    out.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_all()?;
    Ok(())
}

/// Read side: memory-mapped, immutable.
pub struct HashIndex {
    mmap: Mmap,
    salt: u64,
    key_count: u64,
    bucket_count: u64,
    path: PathBuf,
}

impl HashIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN {
            return Err(Error::Corruption(format!(
                "hash index {} too short for header",
                path.display()
            )));
        }
        if BigEndian::read_u32(&mmap[0..4]) != INDEX_MAGIC {
            return Err(Error::Corruption(format!(
                "hash index {} has bad magic",
                path.display()
            )));
        }
        let salt = BigEndian::read_u64(&mmap[4..12]);
        let key_count = BigEndian::read_u64(&mmap[12..20]);
        let bucket_count = BigEndian::read_u64(&mmap[20..28]);
        let expect = HEADER_LEN as u64 + 4 * bucket_count + 8 * key_count;
        if mmap.len() as u64 != expect {
            return Err(Error::Corruption(format!(
                "hash index {} length disagrees with header",
                path.display()
            )));
        }
        Ok(Self {
            mmap,
            salt,
            key_count,
            bucket_count,
            path: path.to_path_buf(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset recorded for `key`. `None` only for an empty index; for a key
    /// never inserted this may be another key's offset, so callers must
    /// verify the key at the returned data offset.
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if self.key_count == 0 {
            return None;
        }
        let hash = salted_hash(key, self.salt);
        let bucket = remap(hash, self.bucket_count) as usize;
        let disp_at = HEADER_LEN + 4 * bucket;
        let displacement = BigEndian::read_u32(&self.mmap[disp_at..disp_at + 4]);
        let slot = slot_for(hash, displacement, self.key_count) as usize;
        let slot_at = HEADER_LEN + 4 * self.bucket_count as usize + 8 * slot;
        Some(BigEndian::read_u64(&self.mmap[slot_at..slot_at + 8]))
    }
}

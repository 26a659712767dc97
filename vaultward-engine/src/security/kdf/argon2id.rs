//! Argon2id (RFC 9106, version 0x13) built on the Blake2b primitive.
//!
//! Memory is a matrix of 1 KiB blocks: `p` lanes of `4 * segment_length`
//! columns. The first two slices of the first pass use data-independent
//! addressing; everything after that derives reference positions from the
//! previous block. The work buffer is zeroized on every exit path.

use std::ops::BitXorAssign;

use zeroize::{Zeroize, Zeroizing};

use super::blake2b_long::{blake2b, blake2b_long, BLAKE2B_OUTBYTES};
use super::params::{KdfParams, SYNC_POINTS};
use crate::error::{SecurityError, SecurityResult};

/// Argon2 version 1.3.
pub const ARGON2_VERSION: u32 = 0x13;

/// Type tag for Argon2id.
const ARGON2ID_TYPE: u32 = 2;

const BLOCK_WORDS: usize = 128;
const BLOCK_BYTES: usize = BLOCK_WORDS * 8;
const ADDRESSES_IN_BLOCK: u32 = BLOCK_WORDS as u32;
const MIN_SALT_LEN: usize = 8;

#[derive(Clone, Copy)]
struct Block([u64; BLOCK_WORDS]);

impl Block {
    const ZERO: Block = Block([0u64; BLOCK_WORDS]);

    fn from_bytes(bytes: &[u8; BLOCK_BYTES]) -> Self {
        let mut block = Block::ZERO;
        for (word, chunk) in block.0.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            *word = u64::from_le_bytes(le);
        }
        block
    }

    fn write_bytes(&self, out: &mut [u8; BLOCK_BYTES]) {
        for (word, chunk) in self.0.iter().zip(out.chunks_exact_mut(8)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}

impl BitXorAssign<&Block> for Block {
    fn bitxor_assign(&mut self, rhs: &Block) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl Zeroize for Block {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// The work buffer. Dropping it zeroizes every block.
struct Memory {
    blocks: Vec<Block>,
}

impl Memory {
    fn allocate(count: usize) -> SecurityResult<Self> {
        let mut blocks = Vec::new();
        blocks.try_reserve_exact(count).map_err(|_| {
            SecurityError::CryptographicFailure(format!(
                "cannot allocate {} KiB for key derivation",
                count
            ))
        })?;
        blocks.resize(count, Block::ZERO);
        Ok(Self { blocks })
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        for block in self.blocks.iter_mut() {
            block.zeroize();
        }
    }
}

/// Multiply-hardened addition: `a + b + 2 * lo32(a) * lo32(b)`.
#[inline(always)]
fn blamka(a: u64, b: u64) -> u64 {
    let lo = (a & 0xFFFF_FFFF).wrapping_mul(b & 0xFFFF_FFFF);
    a.wrapping_add(b).wrapping_add(lo.wrapping_mul(2))
}

#[inline(always)]
fn mix(v: &mut [u64; BLOCK_WORDS], a: usize, b: usize, c: usize, d: usize) {
    v[a] = blamka(v[a], v[b]);
    v[d] = (v[d] ^ v[a]).rotate_right(32);
    v[c] = blamka(v[c], v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(24);
    v[a] = blamka(v[a], v[b]);
    v[d] = (v[d] ^ v[a]).rotate_right(16);
    v[c] = blamka(v[c], v[d]);
    v[b] = (v[b] ^ v[c]).rotate_right(63);
}

/// One Blake2b round (column mix then diagonal mix) over 16 words.
fn round(v: &mut [u64; BLOCK_WORDS], i: &[usize; 16]) {
    mix(v, i[0], i[4], i[8], i[12]);
    mix(v, i[1], i[5], i[9], i[13]);
    mix(v, i[2], i[6], i[10], i[14]);
    mix(v, i[3], i[7], i[11], i[15]);

    mix(v, i[0], i[5], i[10], i[15]);
    mix(v, i[1], i[6], i[11], i[12]);
    mix(v, i[2], i[7], i[8], i[13]);
    mix(v, i[3], i[4], i[9], i[14]);
}

/// Eight rounds over the 16-word rows, then eight over the interleaved columns.
fn permute(block: &mut Block) {
    let v = &mut block.0;
    for r in 0..8 {
        let base = 16 * r;
        let idx: [usize; 16] = std::array::from_fn(|k| base + k);
        round(v, &idx);
    }
    for c in 0..8 {
        let base = 2 * c;
        let idx: [usize; 16] = std::array::from_fn(|k| base + (k / 2) * 16 + (k % 2));
        round(v, &idx);
    }
}

/// Compression `G(x, y) = P(x ^ y) ^ x ^ y`.
fn compress(x: &Block, y: &Block) -> Block {
    let mut r = *x;
    r ^= y;
    let mut out = r;
    permute(&mut r);
    out ^= &r;
    r.zeroize();
    out
}

#[derive(Clone, Copy)]
struct Geometry {
    passes: u32,
    lanes: u32,
    segment_length: u32,
    lane_length: u32,
    block_count: u32,
}

impl Geometry {
    fn new(params: &KdfParams) -> Self {
        Self {
            passes: params.iterations,
            lanes: params.parallelism,
            segment_length: params.segment_length(),
            lane_length: params.lane_length(),
            block_count: params.block_count(),
        }
    }
}

/// Position of the block being filled.
#[derive(Clone, Copy)]
struct Position {
    pass: u32,
    slice: u32,
    index: u32,
}

/// Map a 32-bit pseudo-random value to a column in the reference lane.
///
/// The reference area covers every finished block the current one may see.
/// Squaring the random value skews the choice towards recent blocks.
fn reference_index(geo: &Geometry, pos: &Position, pseudo_rand: u64, same_lane: bool) -> u64 {
    let seg = geo.segment_length as u64;
    let lane_len = geo.lane_length as u64;
    let slice = pos.slice as u64;
    let index = pos.index as u64;

    let area_size = if pos.pass == 0 {
        if pos.slice == 0 {
            index - 1
        } else if same_lane {
            slice * seg + index - 1
        } else if index == 0 {
            slice * seg - 1
        } else {
            slice * seg
        }
    } else if same_lane {
        lane_len - seg + index - 1
    } else if index == 0 {
        lane_len - seg - 1
    } else {
        lane_len - seg
    };

    let mut relative = pseudo_rand & 0xFFFF_FFFF;
    relative = (relative * relative) >> 32;
    relative = area_size - 1 - ((area_size * relative) >> 32);

    let start = if pos.pass != 0 && pos.slice != SYNC_POINTS - 1 {
        (slice + 1) * seg
    } else {
        0
    };

    (start + relative) % lane_len
}

/// Refresh the data-independent address block.
fn next_addresses(address: &mut Block, input: &mut Block) {
    input.0[6] += 1;
    let first = compress(&Block::ZERO, input);
    *address = compress(&Block::ZERO, &first);
}

fn fill_segment(memory: &mut [Block], geo: &Geometry, pass: u32, slice: u32, lane: u32) {
    let data_independent = pass == 0 && slice < SYNC_POINTS / 2;

    let mut input = Block::ZERO;
    let mut address = Block::ZERO;
    if data_independent {
        input.0[0] = pass as u64;
        input.0[1] = lane as u64;
        input.0[2] = slice as u64;
        input.0[3] = geo.block_count as u64;
        input.0[4] = geo.passes as u64;
        input.0[5] = ARGON2ID_TYPE as u64;
    }

    let mut start = 0u32;
    if pass == 0 && slice == 0 {
        // Blocks 0 and 1 are seeded from H0.
        start = 2;
        if data_independent {
            next_addresses(&mut address, &mut input);
        }
    }

    let lane_len = geo.lane_length as usize;
    let mut current = lane as usize * lane_len + (slice * geo.segment_length + start) as usize;
    let mut previous = if current % lane_len == 0 {
        current + lane_len - 1
    } else {
        current - 1
    };

    for index in start..geo.segment_length {
        if current % lane_len == 1 {
            previous = current - 1;
        }

        let pseudo_rand = if data_independent {
            if index % ADDRESSES_IN_BLOCK == 0 {
                next_addresses(&mut address, &mut input);
            }
            address.0[(index % ADDRESSES_IN_BLOCK) as usize]
        } else {
            memory[previous].0[0]
        };

        let ref_lane = if pass == 0 && slice == 0 {
            lane as u64
        } else {
            (pseudo_rand >> 32) % geo.lanes as u64
        };

        let pos = Position {
            pass,
            slice,
            index,
        };
        let ref_index = reference_index(geo, &pos, pseudo_rand, ref_lane == lane as u64);
        let reference = ref_lane as usize * lane_len + ref_index as usize;

        let mut next = compress(&memory[previous], &memory[reference]);
        if pass != 0 {
            // Later passes fold into the existing block instead of replacing it.
            next ^= &memory[current];
        }
        memory[current] = next;
        next.zeroize();

        current += 1;
        previous += 1;
    }

    address.zeroize();
}

fn le32(value: usize) -> SecurityResult<[u8; 4]> {
    u32::try_from(value)
        .map(u32::to_le_bytes)
        .map_err(|_| SecurityError::InvalidInput("KDF input too long".into()))
}

/// Argon2id instance bound to a set of cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct Argon2id {
    params: KdfParams,
}

impl Argon2id {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Derive `params.output_len` bytes from `password` and `salt`.
    pub fn derive(&self, password: &[u8], salt: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.derive_keyed(password, salt, &[], &[])
    }

    /// Derive with the optional secret (`K`) and associated data (`X`) inputs.
    pub fn derive_keyed(
        &self,
        password: &[u8],
        salt: &[u8],
        secret: &[u8],
        associated: &[u8],
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(vec![0u8; self.params.output_len]);
        self.derive_into(password, salt, secret, associated, &mut out)?;
        Ok(out)
    }

    fn derive_into(
        &self,
        password: &[u8],
        salt: &[u8],
        secret: &[u8],
        associated: &[u8],
        out: &mut [u8],
    ) -> SecurityResult<()> {
        let params = &self.params;
        params.validate()?;
        if salt.len() < MIN_SALT_LEN {
            return Err(SecurityError::InvalidInput(format!(
                "salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }

        let geo = Geometry::new(params);

        let mut h0 = Zeroizing::new([0u8; BLAKE2B_OUTBYTES]);
        blake2b(
            &mut h0[..],
            &[
                &params.parallelism.to_le_bytes()[..],
                &le32(params.output_len)?[..],
                &params.memory_kib.to_le_bytes()[..],
                &params.iterations.to_le_bytes()[..],
                &ARGON2_VERSION.to_le_bytes()[..],
                &ARGON2ID_TYPE.to_le_bytes()[..],
                &le32(password.len())?[..],
                password,
                &le32(salt.len())?[..],
                salt,
                &le32(secret.len())?[..],
                secret,
                &le32(associated.len())?[..],
                associated,
            ],
        )?;

        let mut memory = Memory::allocate(geo.block_count as usize)?;
        let lane_len = geo.lane_length as usize;

        let mut seed = Zeroizing::new([0u8; BLOCK_BYTES]);
        for lane in 0..geo.lanes {
            for column in 0..2u32 {
                blake2b_long(
                    &mut seed[..],
                    &[&h0[..], &column.to_le_bytes()[..], &lane.to_le_bytes()[..]],
                )?;
                memory.blocks[lane as usize * lane_len + column as usize] =
                    Block::from_bytes(&seed);
            }
        }

        for pass in 0..geo.passes {
            for slice in 0..SYNC_POINTS {
                for lane in 0..geo.lanes {
                    fill_segment(&mut memory.blocks, &geo, pass, slice, lane);
                }
            }
        }

        let mut last = memory.blocks[lane_len - 1];
        for lane in 1..geo.lanes as usize {
            last ^= &memory.blocks[lane * lane_len + lane_len - 1];
        }

        let mut last_bytes = Zeroizing::new([0u8; BLOCK_BYTES]);
        last.write_bytes(&mut last_bytes);
        last.zeroize();

        blake2b_long(out, &[&last_bytes[..]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc9106_argon2id_vector() {
        let params = KdfParams {
            iterations: 3,
            memory_kib: 32,
            parallelism: 4,
            output_len: 32,
        };
        let tag = Argon2id::new(params)
            .derive_keyed(&[0x01; 32], &[0x02; 16], &[0x03; 8], &[0x04; 12])
            .unwrap();
        assert_eq!(
            hex::encode(&tag[..]),
            "0d640df58d78766c08c037a34a8b53c9d01ef0452d75b65eb52520e96b01e659"
        );
    }

    #[test]
    fn test_matches_argon2_crate() {
        let cases = [(1u32, 64u32, 1u32), (2, 256, 2), (3, 1024, 4)];
        for (t, m, p) in cases {
            let params = KdfParams {
                iterations: t,
                memory_kib: m,
                parallelism: p,
                output_len: 32,
            };
            let ours = Argon2id::new(params)
                .derive(b"correct horse battery staple", b"saltsaltsaltsalt")
                .unwrap();

            let reference = argon2::Argon2::new(
                argon2::Algorithm::Argon2id,
                argon2::Version::V0x13,
                argon2::Params::new(m, t, p, Some(32)).unwrap(),
            );
            let mut expected = [0u8; 32];
            reference
                .hash_password_into(
                    b"correct horse battery staple",
                    b"saltsaltsaltsalt",
                    &mut expected,
                )
                .unwrap();

            assert_eq!(&ours[..], &expected[..], "mismatch for t={} m={} p={}", t, m, p);
        }
    }

    #[test]
    fn test_long_output() {
        let params = KdfParams {
            output_len: 100,
            ..KdfParams::insecure_for_tests()
        };
        let ours = Argon2id::new(params).derive(b"pw", b"somesalt").unwrap();

        let reference = argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(64, 1, 1, Some(100)).unwrap(),
        );
        let mut expected = [0u8; 100];
        reference
            .hash_password_into(b"pw", b"somesalt", &mut expected)
            .unwrap();
        assert_eq!(&ours[..], &expected[..]);
    }

    #[test]
    fn test_short_salt_rejected() {
        let kdf = Argon2id::new(KdfParams::insecure_for_tests());
        assert!(matches!(
            kdf.derive(b"pw", b"short"),
            Err(SecurityError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_invalid_params_rejected_before_allocation() {
        let params = KdfParams {
            iterations: 1,
            memory_kib: 4,
            parallelism: 4,
            output_len: 32,
        };
        assert!(matches!(
            Argon2id::new(params).derive(b"pw", b"somesalt"),
            Err(SecurityError::InvalidInput(_))
        ));
    }
}

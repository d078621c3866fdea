//! Keyed pseudo-random function for stateless response validation.
//!
//! Every outgoing probe encodes `PRF_K(saddr, daddr, dport)` into fields a
//! response must echo back. The receiver recomputes the same function from
//! the captured packet and compares — no per-probe state is stored anywhere.
//!
//! Implementation: AES-128 in single-block ECB mode. The 128-bit key is
//! generated once at process start from the OS CSPRNG (`/dev/urandom`) and
//! is never written to disk or logged.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use std::io::Read;
use std::net::{Ipv4Addr, Ipv6Addr};

/// 128-bit process-wide validation key.
#[derive(Clone)]
pub struct PrfKey([u8; 16]);

impl PrfKey {
    /// Generate a fresh key from the OS CSPRNG. Called once at scan startup.
    pub fn generate() -> anyhow::Result<Self> {
        let mut buf = [0u8; 16];
        std::fs::File::open("/dev/urandom")
            .and_then(|mut f| f.read_exact(&mut buf))
            .map_err(|e| anyhow::anyhow!("failed to read /dev/urandom for PRF key: {}", e))?;
        Ok(Self(buf))
    }

    /// Build a key from raw bytes. Exposed for tests and for shard
    /// coordination across machines that must agree on one key out of band.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Four 32-bit validation words derived from a probe's addressing tuple.
/// Meanings are assigned per probe module (see `probe` module docs).
pub type ValidationWords = [u32; 4];

/// Encode `(saddr, daddr, dport, probe_num)` into a single AES block and
/// encrypt it under `key`. The four ciphertext words are the validation
/// material; `probe_num` (also called `probe_stream` elsewhere) lets the
/// same target produce distinct, still-verifiable validation words per
/// probe stream.
pub fn prf(key: &PrfKey, saddr: u32, daddr: u32, dport: u16, probe_num: u8) -> ValidationWords {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&saddr.to_be_bytes());
    block[4..8].copy_from_slice(&daddr.to_be_bytes());
    block[8..10].copy_from_slice(&dport.to_be_bytes());
    block[10] = probe_num;
    // bytes 11..16 stay zero: fixed padding of the single-block input.
    let ga = GenericArray::from_mut_slice(&mut block);
    cipher.encrypt_block(ga);

    [
        u32::from_be_bytes(block[0..4].try_into().unwrap()),
        u32::from_be_bytes(block[4..8].try_into().unwrap()),
        u32::from_be_bytes(block[8..12].try_into().unwrap()),
        u32::from_be_bytes(block[12..16].try_into().unwrap()),
    ]
}

/// Same contract as [`prf`] but for an IPv6 `(saddr, daddr, dport)` tuple.
/// The 256 bits of address material don't fit in one AES block alongside
/// the port and probe number, so the two addresses are folded with XOR
/// before encoding — collision resistance degrades gracefully (still keyed,
/// still requires recovering the AES key to forge), which is an accepted
/// trade-off for v6's much larger, typically file-enumerated target space
/// (see the IPv6 sharding open question in `DESIGN.md`).
pub fn prf_v6(key: &PrfKey, saddr: &Ipv6Addr, daddr: &Ipv6Addr, dport: u16, probe_num: u8) -> ValidationWords {
    let mut folded_src = [0u8; 4];
    let mut folded_dst = [0u8; 4];
    for (i, b) in saddr.octets().iter().enumerate() {
        folded_src[i % 4] ^= b;
    }
    for (i, b) in daddr.octets().iter().enumerate() {
        folded_dst[i % 4] ^= b;
    }
    prf(
        key,
        u32::from_be_bytes(folded_src),
        u32::from_be_bytes(folded_dst),
        dport,
        probe_num,
    )
}

/// Convenience wrapper for the common IPv4 case taking `Ipv4Addr` directly.
pub fn prf_v4(key: &PrfKey, saddr: Ipv4Addr, daddr: Ipv4Addr, dport: u16, probe_num: u8) -> ValidationWords {
    prf(key, u32::from(saddr), u32::from(daddr), dport, probe_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> PrfKey {
        PrfKey::from_bytes([0x42; 16])
    }

    #[test]
    fn deterministic_for_same_input() {
        let key = test_key();
        let a = prf_v4(&key, "1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 443, 0);
        let b = prf_v4(&key, "1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 443, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn differs_for_different_key() {
        let a = prf_v4(&test_key(), "1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 443, 0);
        let other = PrfKey::from_bytes([0x24; 16]);
        let b = prf_v4(&other, "1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 443, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn differs_for_different_probe_num() {
        let key = test_key();
        let a = prf_v4(&key, "1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 443, 0);
        let b = prf_v4(&key, "1.2.3.4".parse().unwrap(), "5.6.7.8".parse().unwrap(), 443, 1);
        assert_ne!(a, b);
    }

    /// Flipping any input byte should change the output with overwhelming
    /// probability (AES diffuses a single bit across the whole block).
    #[test]
    fn single_bit_flip_changes_output() {
        let key = test_key();
        let base = prf_v4(&key, "10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), 80, 0);
        let flipped = prf_v4(&key, "10.0.0.1".parse().unwrap(), "10.0.0.3".parse().unwrap(), 80, 0);
        assert_ne!(base, flipped);
    }

    #[test]
    fn generate_produces_distinct_keys() {
        let a = PrfKey::generate().unwrap();
        let b = PrfKey::generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn v6_prf_is_deterministic() {
        let key = test_key();
        let s: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let d: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let a = prf_v6(&key, &s, &d, 53, 0);
        let b = prf_v6(&key, &s, &d, 53, 0);
        assert_eq!(a, b);
    }
}

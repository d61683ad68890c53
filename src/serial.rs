//! Serial number allocation
//!
//! Serials are positive integers drawn uniformly from `[1, 2^bits)` using the
//! secure random source. Two policies are available:
//!
//! - [`SerialPolicy::Random`]: every draw is independent. Collisions are
//!   possible in principle (probability ~ n²/2^(bits+1) for n issued
//!   certificates) and nothing is remembered between calls.
//! - [`SerialPolicy::Recorded`]: the allocator remembers every serial it has
//!   handed out and redraws on collision, so serials from one allocator are
//!   exactly unique. The record is guarded by a mutex and the allocator can be
//!   shared between threads issuing from the same authority.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use openssl::asn1::Asn1Integer;
use openssl::bn::BigNum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PkiError, Result};

/// Default serial width (2^128 range)
pub const DEFAULT_SERIAL_BITS: u32 = 128;
/// Lower bound on serial entropy
pub const MIN_SERIAL_BITS: u32 = 64;
/// RFC 5280 caps serials at 20 octets and they must stay positive
pub const MAX_SERIAL_BITS: u32 = 159;

const MAX_DRAW_ATTEMPTS: usize = 16;

/// Source of cryptographically secure random bytes
pub trait RandomSource: Send + Sync {
    /// Fill `buf` entirely or fail with [`PkiError::InsufficientEntropy`]
    fn fill(&self, buf: &mut [u8]) -> Result<()>;
}

/// OpenSSL's CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) -> Result<()> {
        openssl::rand::rand_bytes(buf).map_err(|e| PkiError::InsufficientEntropy(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialPolicy {
    #[default]
    Random,
    Recorded,
}

/// Certificate serial number as a minimal big-endian unsigned magnitude
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    /// Build from big-endian bytes, dropping any leading zero octets
    /// (including the sign octet DER adds when the top bit is set)
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        SerialNumber(bytes[start..].to_vec())
    }

    /// Parse the hex form produced by `Display`
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| PkiError::InvalidParameter(format!("invalid serial {:?}: {}", text, e)))?;
        Ok(Self::from_be_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_asn1_integer(&self) -> Result<Asn1Integer> {
        let bn = BigNum::from_slice(&self.0)?;
        Ok(bn.to_asn1_integer()?)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("00");
        }
        f.write_str(&hex::encode(&self.0))
    }
}

/// Hands out serial numbers for one issuing authority
pub struct SerialAllocator {
    policy: SerialPolicy,
    bits: u32,
    issued: Mutex<HashSet<SerialNumber>>,
}

impl SerialAllocator {
    pub fn new(policy: SerialPolicy, bits: u32) -> Result<Self> {
        if !(MIN_SERIAL_BITS..=MAX_SERIAL_BITS).contains(&bits) {
            return Err(PkiError::InvalidParameter(format!(
                "serial width must be between {} and {} bits, got {}",
                MIN_SERIAL_BITS, MAX_SERIAL_BITS, bits
            )));
        }
        Ok(Self {
            policy,
            bits,
            issued: Mutex::new(HashSet::new()),
        })
    }

    pub fn policy(&self) -> SerialPolicy {
        self.policy
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Draw a fresh serial according to the configured policy
    pub fn allocate(&self, source: &dyn RandomSource) -> Result<SerialNumber> {
        match self.policy {
            SerialPolicy::Random => draw_serial(source, self.bits),
            SerialPolicy::Recorded => {
                let mut issued = self
                    .issued
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                for _ in 0..MAX_DRAW_ATTEMPTS {
                    let serial = draw_serial(source, self.bits)?;
                    if issued.insert(serial.clone()) {
                        return Ok(serial);
                    }
                    debug!(%serial, "serial collision, redrawing");
                }
                Err(PkiError::SerialSpaceExhausted {
                    attempts: MAX_DRAW_ATTEMPTS,
                })
            }
        }
    }

    /// Mark a serial allocated elsewhere (e.g. the authority's own) as used.
    /// Has no effect under the random policy.
    pub fn record(&self, serial: &SerialNumber) {
        if self.policy == SerialPolicy::Recorded {
            self.issued
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(serial.clone());
        }
    }

    pub fn issued_count(&self) -> usize {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl fmt::Debug for SerialAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialAllocator")
            .field("policy", &self.policy)
            .field("bits", &self.bits)
            .field("issued", &self.issued_count())
            .finish()
    }
}

/// Uniform draw from `[1, 2^bits)`; zero is redrawn
pub fn draw_serial(source: &dyn RandomSource, bits: u32) -> Result<SerialNumber> {
    let len = bits.div_ceil(8) as usize;
    let excess = (len as u32) * 8 - bits;
    let mut buf = vec![0u8; len];
    for _ in 0..MAX_DRAW_ATTEMPTS {
        source.fill(&mut buf)?;
        buf[0] &= 0xffu8 >> excess;
        let serial = SerialNumber::from_be_bytes(&buf);
        if !serial.is_zero() {
            return Ok(serial);
        }
    }
    Err(PkiError::SerialSpaceExhausted {
        attempts: MAX_DRAW_ATTEMPTS,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    /// Source that always fails, standing in for a starved entropy pool
    pub(crate) struct StarvedRandom;

    impl RandomSource for StarvedRandom {
        fn fill(&self, _buf: &mut [u8]) -> Result<()> {
            Err(PkiError::InsufficientEntropy("entropy pool empty".into()))
        }
    }

    /// Source that repeats one byte value per call, cycling through a short sequence
    struct CyclingRandom {
        next: AtomicU8,
        period: u8,
    }

    impl RandomSource for CyclingRandom {
        fn fill(&self, buf: &mut [u8]) -> Result<()> {
            let value = self.next.fetch_add(1, Ordering::SeqCst) % self.period;
            buf.fill(value);
            Ok(())
        }
    }

    #[test]
    fn test_serial_strips_leading_zeros() {
        let serial = SerialNumber::from_be_bytes(&[0x00, 0x00, 0x8f, 0x01]);
        assert_eq!(serial.as_bytes(), &[0x8f, 0x01]);
        assert_eq!(serial.to_string(), "8f01");
        assert!(SerialNumber::from_be_bytes(&[0, 0]).is_zero());
    }

    #[test]
    fn test_serial_hex_form() {
        let serial = SerialNumber::from_be_bytes(&[0x8f, 0x01]);
        assert_eq!(SerialNumber::from_hex(&serial.to_string()).unwrap(), serial);
        assert_eq!(SerialNumber::from_hex("00ff").unwrap().as_bytes(), &[0xff]);
        assert!(SerialNumber::from_hex("xyz").is_err());
        assert!(SerialNumber::from_hex("abc").is_err());
    }

    #[test]
    fn test_draw_respects_width() {
        for _ in 0..64 {
            let serial = draw_serial(&OsRandom, 65).unwrap();
            assert!(!serial.is_zero());
            let bytes = serial.as_bytes();
            assert!(bytes.len() <= 9);
            if bytes.len() == 9 {
                assert!(bytes[0] <= 1);
            }
        }
    }

    #[test]
    fn test_zero_draw_is_redrawn() {
        let source = CyclingRandom {
            next: AtomicU8::new(0),
            period: 3,
        };
        let serial = draw_serial(&source, 64).unwrap();
        assert_eq!(serial.as_bytes(), &[1u8; 8]);
    }

    #[test]
    fn test_width_out_of_range_rejected() {
        assert!(matches!(
            SerialAllocator::new(SerialPolicy::Random, 32),
            Err(PkiError::InvalidParameter(_))
        ));
        assert!(matches!(
            SerialAllocator::new(SerialPolicy::Random, 160),
            Err(PkiError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_starved_source_is_insufficient_entropy() {
        let allocator = SerialAllocator::new(SerialPolicy::Random, 128).unwrap();
        let err = allocator.allocate(&StarvedRandom).unwrap_err();
        assert!(matches!(err, PkiError::InsufficientEntropy(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_recorded_policy_redraws_collisions() {
        // Source cycles 1, 2, 0 and zero is redrawn, so only two serials exist
        let source = CyclingRandom {
            next: AtomicU8::new(1),
            period: 3,
        };
        let allocator = SerialAllocator::new(SerialPolicy::Recorded, 64).unwrap();
        let first = allocator.allocate(&source).unwrap();
        let second = allocator.allocate(&source).unwrap();
        assert_ne!(first, second);
        assert_eq!(allocator.issued_count(), 2);

        // Every non-zero value of this tiny space is now taken
        let err = allocator.allocate(&source).unwrap_err();
        assert!(matches!(err, PkiError::SerialSpaceExhausted { .. }));
    }

    #[test]
    fn test_record_only_applies_to_recorded_policy() {
        let serial = SerialNumber::from_be_bytes(&[7]);
        let random = SerialAllocator::new(SerialPolicy::Random, 128).unwrap();
        random.record(&serial);
        assert_eq!(random.issued_count(), 0);

        let recorded = SerialAllocator::new(SerialPolicy::Recorded, 128).unwrap();
        recorded.record(&serial);
        assert_eq!(recorded.issued_count(), 1);
    }

    #[test]
    fn test_recorded_allocator_across_threads() {
        let allocator = Arc::new(SerialAllocator::new(SerialPolicy::Recorded, 128).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.allocate(&OsRandom).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for serial in handle.join().unwrap() {
                assert!(all.insert(serial));
            }
        }
        assert_eq!(all.len(), 100);
        assert_eq!(allocator.issued_count(), 100);
    }
}

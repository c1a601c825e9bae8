use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

/// Payload generation strategies for exercise data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    /// Incompressible pseudo-random bytes from a fixed seed.
    Random { seed: u64 },
    /// Highly repetitive text that compresses well.
    Compressible,
}

impl Generator {
    pub fn generate(&self, size: usize) -> Vec<u8> {
        match self {
            Generator::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let mut payload = vec![0u8; size];
                rng.fill_bytes(&mut payload);
                payload
            }
            Generator::Compressible => {
                let sentence: &[u8] = b"This is a highly repetitive sentence that is designed \
                    to test the compression efficiency of the aggregation pipeline. ";
                let mut payload = Vec::with_capacity(size);
                while payload.len() < size {
                    let take = sentence.len().min(size - payload.len());
                    payload.extend_from_slice(&sentence[..take]);
                }
                payload
            }
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_generation_is_deterministic() {
        let a = Generator::Random { seed: 42 }.generate(1024);
        let b = Generator::Random { seed: 42 }.generate(1024);
        let c = Generator::Random { seed: 43 }.generate(1024);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 1024);
    }

    #[test]
    fn compressible_generation_fills_exactly() {
        let payload = Generator::Compressible.generate(1000);
        assert_eq!(payload.len(), 1000);
    }

    #[test]
    fn empty_payload_has_the_well_known_digest() {
        assert_eq!(
            sha256_hex(&Generator::Compressible.generate(0)),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

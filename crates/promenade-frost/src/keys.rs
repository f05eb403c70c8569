//! Trusted key dealing and the shard types it produces.

use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;

use crate::curve::{
    decode_point, encode_point, has_odd_y, reduce_scalar, scalar_bytes, validate_point,
};
use crate::error::FrostError;

/// Hard limit on group size, matching the registration codec's bounds.
pub const MAX_SIGNERS: u16 = 20;

/// The public half of a participant's shard.
///
/// `vss_commitment[0]` is the aggregated group public key, equal across
/// every shard of the same dealing.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKeyShard {
    /// Participant identifier in `[1, max_signers]`; zero is reserved.
    pub id: u16,
    /// The public key matching this participant's secret shard.
    pub public_key: ProjectivePoint,
    /// Feldman commitment to the dealing polynomial's coefficients.
    pub vss_commitment: Vec<ProjectivePoint>,
}

impl PublicKeyShard {
    /// Byte layout: `u16 id LE | u32 vss_len LE | point(33) | vss_len * point(33)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 33 + 33 * self.vss_commitment.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.vss_commitment.len() as u32).to_le_bytes());
        out.extend_from_slice(&encode_point(&self.public_key));
        for commitment in &self.vss_commitment {
            out.extend_from_slice(&encode_point(commitment));
        }
        out
    }

    /// Decodes a shard, returning it along with the number of bytes consumed.
    pub fn decode(input: &[u8]) -> Result<(Self, usize), FrostError> {
        if input.len() < 6 + 33 {
            return Err(FrostError::TooSmall);
        }
        let id = u16::from_le_bytes([input[0], input[1]]);
        let vss_len = u32::from_le_bytes([input[2], input[3], input[4], input[5]]) as usize;
        let public_key = decode_point(&input[6..6 + 33])?;

        let full_length = 6 + 33 + vss_len * 33;
        if input.len() < full_length {
            return Err(FrostError::TooSmall);
        }
        let mut vss_commitment = Vec::with_capacity(vss_len);
        for i in 0..vss_len {
            let start = 6 + 33 + i * 33;
            vss_commitment.push(decode_point(&input[start..start + 33])?);
        }

        Ok((
            PublicKeyShard {
                id,
                public_key,
                vss_commitment,
            },
            full_length,
        ))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode_hex(input: &str) -> Result<Self, FrostError> {
        let bytes = hex::decode(input)?;
        Self::decode(&bytes).map(|(shard, _)| shard)
    }

    /// The group public key committed to by the dealing, when present.
    pub fn group_public_key(&self) -> Option<&ProjectivePoint> {
        self.vss_commitment.first()
    }

    /// Feldman check: the shard public key must equal the VSS polynomial
    /// evaluated in the exponent at this participant's id.
    pub fn consistent_with_vss(&self) -> bool {
        if self.vss_commitment.is_empty() {
            return false;
        }
        let x = Scalar::from(self.id as u64);
        let mut expected = ProjectivePoint::IDENTITY;
        let mut x_power = Scalar::ONE;
        for commitment in &self.vss_commitment {
            expected += *commitment * x_power;
            x_power *= x;
        }
        expected == self.public_key
    }
}

/// A participant's full shard: the public part plus the secret evaluation
/// of the dealing polynomial.
#[derive(Clone)]
pub struct KeyShard {
    pub public: PublicKeyShard,
    /// The secret polynomial evaluation `p(id)`.
    pub secret: Scalar,
    /// The group public key, kept alongside for convenience.
    pub group_public_key: ProjectivePoint,
}

impl KeyShard {
    /// Byte layout: `<PublicKeyShard> | scalar(32) | point(33)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.public.encode();
        out.extend_from_slice(&scalar_bytes(&self.secret));
        out.extend_from_slice(&encode_point(&self.group_public_key));
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, FrostError> {
        let (public, consumed) = PublicKeyShard::decode(input)?;
        if input.len() < consumed + 32 + 33 {
            return Err(FrostError::TooSmall);
        }
        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&input[consumed..consumed + 32]);
        let secret = reduce_scalar(&secret_bytes);
        let group_public_key = decode_point(&input[consumed + 32..consumed + 32 + 33])?;
        Ok(KeyShard {
            public,
            secret,
            group_public_key,
        })
    }

    pub fn hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode_hex(input: &str) -> Result<Self, FrostError> {
        Self::decode(&hex::decode(input)?)
    }

    /// Invariant check: `secret * G == public.public_key`, secret nonzero.
    pub fn validate(&self) -> Result<(), FrostError> {
        if bool::from(self.secret.is_zero()) {
            return Err(FrostError::ZeroSecret);
        }
        if ProjectivePoint::GENERATOR * self.secret != self.public.public_key {
            return Err(FrostError::SecretMismatch);
        }
        validate_point(&self.group_public_key)
    }

    /// Overwrite the secret material. Call before discarding a shard that
    /// is not going back to durable storage.
    pub fn wipe(&mut self) {
        self.secret = Scalar::ZERO;
    }
}

impl std::fmt::Debug for KeyShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShard")
            .field("id", &self.public.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Dealing polynomial; the constant term is the (normalized) master secret.
struct Polynomial(Vec<Scalar>);

impl Polynomial {
    fn generate(secret: Scalar, threshold: u16) -> Self {
        let mut coefficients = Vec::with_capacity(threshold as usize);
        coefficients.push(secret);
        for _ in 1..threshold {
            coefficients.push(Scalar::random(&mut OsRng));
        }
        Polynomial(coefficients)
    }

    /// Horner evaluation at `x`.
    fn evaluate(&self, x: &Scalar) -> Scalar {
        let mut value = self.0[self.0.len() - 1];
        for coefficient in self.0.iter().rev().skip(1) {
            value = value * x + coefficient;
        }
        value
    }

    fn vss_commit(&self) -> Vec<ProjectivePoint> {
        self.0
            .iter()
            .map(|coefficient| ProjectivePoint::GENERATOR * coefficient)
            .collect()
    }
}

impl Drop for Polynomial {
    fn drop(&mut self) {
        for coefficient in self.0.iter_mut() {
            *coefficient = Scalar::ZERO;
        }
    }
}

/// Split `secret` into `max_signers` shards with threshold `threshold`.
///
/// If `secret * G` has an odd Y coordinate the secret is negated first,
/// so that every signature later produced by the group verifies against
/// the x-only form of the returned aggregate key. Returns the shards, the
/// normalized aggregate public key and the VSS commitment vector.
pub fn trusted_deal(
    secret: &Scalar,
    threshold: u16,
    max_signers: u16,
) -> Result<(Vec<KeyShard>, ProjectivePoint, Vec<ProjectivePoint>), FrostError> {
    if threshold == 0 || threshold > max_signers {
        return Err(FrostError::InvalidThreshold {
            threshold,
            max_signers,
        });
    }
    if max_signers > MAX_SIGNERS {
        return Err(FrostError::TooManySigners(max_signers));
    }
    if bool::from(secret.is_zero()) {
        return Err(FrostError::ZeroSecret);
    }

    // BIP-340 normalization: the group key must have even Y.
    let mut normalized = *secret;
    let mut aggregate = ProjectivePoint::GENERATOR * normalized;
    if has_odd_y(&aggregate) {
        normalized = -normalized;
        aggregate = ProjectivePoint::GENERATOR * normalized;
    }

    let polynomial = Polynomial::generate(normalized, threshold);
    let vss_commitment = polynomial.vss_commit();

    let mut shards = Vec::with_capacity(max_signers as usize);
    for id in 1..=max_signers {
        let secret_share = polynomial.evaluate(&Scalar::from(id as u64));
        shards.push(KeyShard {
            public: PublicKeyShard {
                id,
                public_key: ProjectivePoint::GENERATOR * secret_share,
                vss_commitment: vss_commitment.clone(),
            },
            secret: secret_share,
            group_public_key: aggregate,
        });
    }

    normalized = Scalar::ZERO;
    let _ = normalized;

    Ok((shards, aggregate, vss_commitment))
}

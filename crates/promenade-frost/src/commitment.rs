//! One-shot nonce commitments exchanged in the first signing round.

use k256::{ProjectivePoint, Scalar};
use rand::RngCore;

use crate::curve::{decode_point, encode_point, reduce_scalar, scalar_bytes, tagged_hash};
use crate::error::FrostError;

/// A signer's public binonce: `D` hides, `E` binds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinoncePublic {
    /// Hiding nonce commitment `D = d·G`.
    pub hiding: ProjectivePoint,
    /// Binding nonce commitment `E = e·G`.
    pub binding: ProjectivePoint,
}

impl BinoncePublic {
    /// Byte layout: `point(33) D | point(33) E`.
    pub fn encode(&self) -> [u8; 66] {
        let mut out = [0u8; 66];
        out[..33].copy_from_slice(&encode_point(&self.hiding));
        out[33..].copy_from_slice(&encode_point(&self.binding));
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, FrostError> {
        if input.len() < 66 {
            return Err(FrostError::TooSmall);
        }
        Ok(BinoncePublic {
            hiding: decode_point(&input[..33])?,
            binding: decode_point(&input[33..66])?,
        })
    }

    pub fn hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode_hex(input: &str) -> Result<Self, FrostError> {
        Self::decode(&hex::decode(input)?)
    }
}

/// The secret scalars behind a [`BinoncePublic`]. Lives only for the
/// duration of one signing session and is wiped on drop.
pub struct BinonceSecret {
    pub(crate) d: Scalar,
    pub(crate) e: Scalar,
}

impl Drop for BinonceSecret {
    fn drop(&mut self) {
        self.d = Scalar::ZERO;
        self.e = Scalar::ZERO;
    }
}

impl std::fmt::Debug for BinonceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BinonceSecret([REDACTED])")
    }
}

/// A participant's round-1 message: its id plus its public binonce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Commitment {
    pub signer_id: u16,
    pub binonce: BinoncePublic,
}

impl Commitment {
    /// Byte layout: `u16 id LE | point(33) D | point(33) E`.
    pub fn encode(&self) -> [u8; 68] {
        let mut out = [0u8; 68];
        out[..2].copy_from_slice(&self.signer_id.to_le_bytes());
        out[2..].copy_from_slice(&self.binonce.encode());
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, FrostError> {
        if input.len() < 68 {
            return Err(FrostError::TooSmall);
        }
        Ok(Commitment {
            signer_id: u16::from_le_bytes([input[0], input[1]]),
            binonce: BinoncePublic::decode(&input[2..68])?,
        })
    }

    pub fn hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode_hex(input: &str) -> Result<Self, FrostError> {
        Self::decode(&hex::decode(input)?)
    }
}

/// Derive the session binonce for `session_id`.
///
/// A fresh 32-byte random prefix is hashed under `frost/aux` and mixed
/// with the secret shard; each nonce then commits to the group key and
/// the session id (suffixed `"h"` for the hiding nonce, `"b"` for the
/// binding one). Secret nonces are never persisted and never reused:
/// sessions must use unique session ids.
pub(crate) fn generate_binonce(
    session_id: &str,
    secret_share: &Scalar,
    group_public_key: &ProjectivePoint,
) -> (BinonceSecret, BinoncePublic) {
    let mut random = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut random);

    let aux = tagged_hash("frost/aux", &[&random]);
    let mut secret_bytes = scalar_bytes(secret_share);
    let mut seed = [0u8; 32];
    for i in 0..32 {
        seed[i] = aux[i] ^ secret_bytes[i];
    }

    let group_key_bytes = encode_point(group_public_key);
    let derive = |suffix: &str| -> Scalar {
        let tagged_id = format!("{session_id}{suffix}");
        let mut hash = tagged_hash(
            "frost/nonce",
            &[
                &seed,
                &group_key_bytes,
                &(tagged_id.len() as u16).to_be_bytes(),
                tagged_id.as_bytes(),
            ],
        );
        let scalar = reduce_scalar(&hash);
        hash.fill(0);
        scalar
    };

    let d = derive("h");
    let e = derive("b");

    seed.fill(0);
    secret_bytes.fill(0);

    let public = BinoncePublic {
        hiding: ProjectivePoint::GENERATOR * d,
        binding: ProjectivePoint::GENERATOR * e,
    };
    (BinonceSecret { d, e }, public)
}

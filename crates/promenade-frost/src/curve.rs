//! Point and scalar plumbing shared by the whole crate.
//!
//! Scalars serialize as 32 big-endian bytes, points as 33-byte SEC1
//! compressed form. Tagged hashes follow the BIP-340 construction:
//! `sha256(sha256(tag) || sha256(tag) || data)`.

use k256::elliptic_curve::bigint::U256;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use sha2::{Digest, Sha256};

use crate::error::FrostError;

/// BIP-340 style tagged hash over the concatenation of `chunks`.
pub fn tagged_hash(tag: &str, chunks: &[&[u8]]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// Serialize a point to 33-byte SEC1 compressed form.
///
/// The identity has no compressed encoding; callers must validate
/// aggregates with [`validate_point`] before encoding them.
pub fn encode_point(point: &ProjectivePoint) -> [u8; 33] {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut out = [0u8; 33];
    if encoded.as_bytes().len() == 33 {
        out.copy_from_slice(encoded.as_bytes());
    }
    out
}

/// Parse a 33-byte SEC1 compressed point.
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, FrostError> {
    if bytes.len() != 33 {
        return Err(FrostError::InvalidPoint);
    }
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| FrostError::InvalidPoint)?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or(FrostError::InvalidPoint)?;
    Ok(ProjectivePoint::from(affine))
}

/// The 32-byte x coordinate, i.e. the BIP-340 identity of a point.
pub fn xonly(point: &ProjectivePoint) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&encode_point(point)[1..]);
    out
}

/// Lift an x-only key to the curve point with even Y, per BIP-340.
pub fn lift_x(xonly: &[u8; 32]) -> Result<ProjectivePoint, FrostError> {
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(xonly);
    decode_point(&compressed)
}

/// Whether the affine Y coordinate of `point` is odd.
pub fn has_odd_y(point: &ProjectivePoint) -> bool {
    encode_point(point)[0] == 0x03
}

/// Interpret 32 bytes as a scalar, reducing modulo the group order.
pub fn reduce_scalar(bytes: &[u8; 32]) -> Scalar {
    let field_bytes: FieldBytes = (*bytes).into();
    <Scalar as Reduce<U256>>::reduce_bytes(&field_bytes)
}

/// Serialize a scalar to 32 big-endian bytes.
pub fn scalar_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

/// Reject the identity and the base point, which never appear in honest
/// protocol traffic.
pub fn validate_point(point: &ProjectivePoint) -> Result<(), FrostError> {
    if *point == ProjectivePoint::IDENTITY || *point == ProjectivePoint::GENERATOR {
        return Err(FrostError::InvalidPoint);
    }
    Ok(())
}

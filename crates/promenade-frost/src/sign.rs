//! Partial signatures: production, verification and aggregation.

use std::collections::HashMap;

use k256::{ProjectivePoint, Scalar};

use crate::commitment::{generate_binonce, BinoncePublic, BinonceSecret, Commitment};
use crate::configuration::Configuration;
use crate::curve::{has_odd_y, reduce_scalar, scalar_bytes, tagged_hash, xonly};
use crate::error::FrostError;
use crate::keys::{KeyShard, PublicKeyShard};
use crate::lambda::LambdaRegistry;

/// A signer's share of the final signature scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialSignature {
    pub signer_id: u16,
    pub value: Scalar,
}

impl PartialSignature {
    /// Byte layout: `u16 id LE | scalar(32)`.
    pub fn encode(&self) -> [u8; 34] {
        let mut out = [0u8; 34];
        out[..2].copy_from_slice(&self.signer_id.to_le_bytes());
        out[2..].copy_from_slice(&scalar_bytes(&self.value));
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, FrostError> {
        if input.len() < 34 {
            return Err(FrostError::TooSmall);
        }
        let mut value_bytes = [0u8; 32];
        value_bytes.copy_from_slice(&input[2..34]);
        Ok(PartialSignature {
            signer_id: u16::from_le_bytes([input[0], input[1]]),
            value: reduce_scalar(&value_bytes),
        })
    }

    pub fn hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode_hex(input: &str) -> Result<Self, FrostError> {
        Self::decode(&hex::decode(input)?)
    }
}

/// The aggregated round state the coordinator derives from the
/// participants' commitments: the group binonce `ρ = (D*, E*)`, the
/// binding coefficient `b`, and the final nonce `R = D* + b·E*` kept in
/// its even-Y representative with the negation recorded.
#[derive(Debug, Clone, Copy)]
pub struct GroupCommitment {
    pub binonce: BinoncePublic,
    pub binding_coefficient: Scalar,
    pub final_nonce: ProjectivePoint,
    pub negated: bool,
}

/// The BIP-340 challenge scalar `c = H(R.x || X.x || m)`.
pub fn challenge(
    final_nonce: &ProjectivePoint,
    public_key: &ProjectivePoint,
    message: &[u8; 32],
) -> Scalar {
    reduce_scalar(&tagged_hash(
        "BIP0340/challenge",
        &[&xonly(final_nonce), &xonly(public_key), message],
    ))
}

impl Configuration {
    /// The binding coefficient
    /// `b = H(X.x || |S| || S || D* || m)` under the `frost/binding` tag.
    /// The preimage layout is part of the wire contract; signer and
    /// coordinator must derive bit-identical values.
    pub fn binding_coefficient(
        &self,
        aggregate_hiding: &ProjectivePoint,
        message: &[u8; 32],
    ) -> Scalar {
        let mut id_bytes = Vec::with_capacity(32 * self.participants.len());
        for &id in &self.participants {
            id_bytes.extend_from_slice(&scalar_bytes(&Scalar::from(id as u64)));
        }
        reduce_scalar(&tagged_hash(
            "frost/binding",
            &[
                &xonly(&self.public_key),
                &(self.participants.len() as u32).to_be_bytes(),
                &id_bytes,
                &crate::curve::encode_point(aggregate_hiding),
                message,
            ],
        ))
    }

    fn validate_commitment_list(&self, commitments: &[Commitment]) -> Result<(), FrostError> {
        if commitments.len() < self.threshold as usize
            || commitments.len() > self.max_signers as usize
        {
            return Err(FrostError::InvalidCommitmentCount {
                have: commitments.len(),
                min: self.threshold as usize,
                max: self.max_signers as usize,
            });
        }
        for (i, commitment) in commitments.iter().enumerate() {
            if !self.contains(commitment.signer_id) {
                return Err(FrostError::UnknownParticipant(commitment.signer_id));
            }
            if commitments[..i]
                .iter()
                .any(|previous| previous.signer_id == commitment.signer_id)
            {
                return Err(FrostError::DuplicateParticipant(commitment.signer_id));
            }
        }
        Ok(())
    }

    /// Aggregate the round's commitments into the group binonce, binding
    /// coefficient and final nonce.
    pub fn group_commitment(
        &self,
        commitments: &[Commitment],
        message: &[u8; 32],
    ) -> Result<GroupCommitment, FrostError> {
        self.validate_commitment_list(commitments)?;

        let mut aggregate_hiding = ProjectivePoint::IDENTITY;
        let mut aggregate_binding = ProjectivePoint::IDENTITY;
        for commitment in commitments {
            aggregate_hiding += commitment.binonce.hiding;
            aggregate_binding += commitment.binonce.binding;
        }
        if aggregate_hiding == ProjectivePoint::IDENTITY
            || aggregate_binding == ProjectivePoint::IDENTITY
        {
            return Err(FrostError::DegenerateGroupCommitment);
        }

        let binding_coefficient = self.binding_coefficient(&aggregate_hiding, message);
        let raw_nonce = aggregate_hiding + aggregate_binding * binding_coefficient;
        if raw_nonce == ProjectivePoint::IDENTITY {
            return Err(FrostError::DegenerateGroupCommitment);
        }

        let negated = has_odd_y(&raw_nonce);
        Ok(GroupCommitment {
            binonce: BinoncePublic {
                hiding: aggregate_hiding,
                binding: aggregate_binding,
            },
            binding_coefficient,
            final_nonce: if negated { -raw_nonce } else { raw_nonce },
            negated,
        })
    }

    /// Check one signer's partial signature against its commitment:
    /// `σ_i·G == D_i + b·E_i + (c·λ_i)·X_i` (the commitment half negated
    /// when the final nonce was). Failure identifies the faulty signer.
    pub fn verify_partial_signature(
        &self,
        shard: &PublicKeyShard,
        binonce: &BinoncePublic,
        group: &GroupCommitment,
        partial: &PartialSignature,
        message: &[u8; 32],
        lambdas: &LambdaRegistry,
    ) -> Result<(), FrostError> {
        if bool::from(partial.value.is_zero()) {
            return Err(FrostError::InvalidSignatureShare);
        }
        if partial.signer_id == 0 || partial.signer_id != shard.id {
            return Err(FrostError::InvalidIdentifier(partial.signer_id));
        }
        if !self.contains(partial.signer_id) {
            return Err(FrostError::UnknownParticipant(partial.signer_id));
        }

        let c = challenge(&group.final_nonce, &self.public_key, message);
        let lambda = lambdas.get_or_compute(partial.signer_id, &self.participants);

        let mut commitment_share =
            binonce.hiding + binonce.binding * group.binding_coefficient;
        if group.negated {
            commitment_share = -commitment_share;
        }
        let expected = commitment_share + shard.public_key * (c * lambda);

        if ProjectivePoint::GENERATOR * partial.value != expected {
            return Err(FrostError::InvalidSignatureShare);
        }
        Ok(())
    }

    /// Sum the partial signatures into the 64-byte BIP-340 signature
    /// `(R.x, z)`. The caller should verify the result against the group
    /// key and, on failure, fall back to per-participant verification to
    /// identify the culprit.
    pub fn aggregate_signatures(
        &self,
        group: &GroupCommitment,
        partials: &[PartialSignature],
    ) -> Result<[u8; 64], FrostError> {
        let mut z = Scalar::ZERO;
        for partial in partials {
            if bool::from(partial.value.is_zero()) {
                return Err(FrostError::InvalidSignatureShare);
            }
            z += partial.value;
        }

        let mut signature = [0u8; 64];
        signature[..32].copy_from_slice(&xonly(&group.final_nonce));
        signature[32..].copy_from_slice(&scalar_bytes(&z));
        Ok(signature)
    }

    /// Standard BIP-340 verification of an aggregated signature against
    /// the x-only form of the group key.
    pub fn verify_signature(&self, signature: &[u8; 64], message: &[u8; 32]) -> bool {
        let Ok(verifying_key) = k256::schnorr::VerifyingKey::from_bytes(&xonly(&self.public_key))
        else {
            return false;
        };
        let Ok(signature) = k256::schnorr::Signature::try_from(&signature[..]) else {
            return false;
        };
        verifying_key.verify_raw(message, &signature).is_ok()
    }
}

/// A participant in a signing group, holding its shard and the secret
/// nonces of its in-flight sessions.
pub struct Signer {
    key_shard: KeyShard,
    configuration: Configuration,
    lambdas: LambdaRegistry,
    nonces: HashMap<String, (BinonceSecret, Commitment)>,
}

impl Signer {
    /// Instantiate a signer for one round. Validates the shard against
    /// the configuration's group key and participant list.
    pub fn new(configuration: Configuration, key_shard: KeyShard) -> Result<Self, FrostError> {
        configuration.validate()?;
        key_shard.validate()?;
        if key_shard.group_public_key != configuration.public_key {
            return Err(FrostError::WrongGroupKey);
        }
        if !configuration.contains(key_shard.public.id) {
            return Err(FrostError::UnknownParticipant(key_shard.public.id));
        }
        Ok(Signer {
            key_shard,
            configuration,
            lambdas: LambdaRegistry::new(),
            nonces: HashMap::new(),
        })
    }

    pub fn id(&self) -> u16 {
        self.key_shard.public.id
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Generate (or replay) this session's commitment. Commitments are
    /// memoized per session id, so calling twice within one session
    /// returns the same binonce; the secret half stays private until
    /// [`Signer::sign`] consumes it.
    pub fn commit(&mut self, session_id: &str) -> Commitment {
        if let Some((_, commitment)) = self.nonces.get(session_id) {
            return *commitment;
        }

        let (secret, public) = generate_binonce(
            session_id,
            &self.key_shard.secret,
            &self.configuration.public_key,
        );
        let commitment = Commitment {
            signer_id: self.key_shard.public.id,
            binonce: public,
        };
        self.nonces
            .insert(session_id.to_string(), (secret, commitment));
        commitment
    }

    /// Produce this signer's partial signature
    /// `σ_i = d_i + b·e_i + c·λ_i·s_i` and destroy the session nonces.
    pub fn sign(
        &mut self,
        session_id: &str,
        message: &[u8; 32],
        group_binonce: &BinoncePublic,
    ) -> Result<PartialSignature, FrostError> {
        let (secret_nonce, _) = self
            .nonces
            .remove(session_id)
            .ok_or_else(|| FrostError::UnknownSession(session_id.to_string()))?;

        let b = self
            .configuration
            .binding_coefficient(&group_binonce.hiding, message);
        let raw_nonce = group_binonce.hiding + group_binonce.binding * b;
        if raw_nonce == ProjectivePoint::IDENTITY {
            return Err(FrostError::DegenerateGroupCommitment);
        }

        let negated = has_odd_y(&raw_nonce);
        let final_nonce = if negated { -raw_nonce } else { raw_nonce };

        let (mut d, mut e) = (secret_nonce.d, secret_nonce.e);
        if negated {
            d = -d;
            e = -e;
        }

        let c = challenge(&final_nonce, &self.configuration.public_key, message);
        let lambda = self
            .lambdas
            .get_or_compute(self.key_shard.public.id, &self.configuration.participants);

        let value = d + b * e + c * lambda * self.key_shard.secret;

        d = Scalar::ZERO;
        e = Scalar::ZERO;
        let _ = (d, e);

        Ok(PartialSignature {
            signer_id: self.key_shard.public.id,
            value,
        })
    }

    /// Forget a session's nonces without signing, e.g. on session abort.
    pub fn discard_session(&mut self, session_id: &str) {
        self.nonces.remove(session_id);
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("id", &self.key_shard.public.id)
            .field("sessions", &self.nonces.len())
            .finish()
    }
}

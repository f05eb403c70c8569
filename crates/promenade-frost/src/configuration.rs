//! The coordinator's round-opening statement.

use k256::ProjectivePoint;

use crate::curve::{decode_point, encode_point, validate_point};
use crate::error::FrostError;
use crate::keys::MAX_SIGNERS;

/// Everything a participant needs to know to join a signing round:
/// threshold, group size, the aggregate key and the ids chosen for this
/// round (in the registration's declared order).
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub threshold: u16,
    pub max_signers: u16,
    /// The BIP-340-normalized (even Y) aggregate public key.
    pub public_key: ProjectivePoint,
    /// Participant ids taking part in this round.
    pub participants: Vec<u16>,
}

impl Configuration {
    /// Byte layout: `u16 thr LE | u16 max LE | u16 n_parts LE | point(33) | n_parts * u16 BE`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + 33 + 2 * self.participants.len());
        out.extend_from_slice(&self.threshold.to_le_bytes());
        out.extend_from_slice(&self.max_signers.to_le_bytes());
        out.extend_from_slice(&(self.participants.len() as u16).to_le_bytes());
        out.extend_from_slice(&encode_point(&self.public_key));
        for id in &self.participants {
            out.extend_from_slice(&id.to_be_bytes());
        }
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, FrostError> {
        if input.len() < 6 + 33 {
            return Err(FrostError::TooSmall);
        }
        let threshold = u16::from_le_bytes([input[0], input[1]]);
        let max_signers = u16::from_le_bytes([input[2], input[3]]);
        let n_participants = u16::from_le_bytes([input[4], input[5]]) as usize;
        let public_key = decode_point(&input[6..6 + 33])?;

        if input.len() < 6 + 33 + 2 * n_participants {
            return Err(FrostError::TooSmall);
        }
        let mut participants = Vec::with_capacity(n_participants);
        for i in 0..n_participants {
            let start = 6 + 33 + 2 * i;
            participants.push(u16::from_be_bytes([input[start], input[start + 1]]));
        }

        let configuration = Configuration {
            threshold,
            max_signers,
            public_key,
            participants,
        };
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn decode_hex(input: &str) -> Result<Self, FrostError> {
        Self::decode(&hex::decode(input)?)
    }

    pub fn validate(&self) -> Result<(), FrostError> {
        if self.threshold == 0 || self.threshold > self.max_signers {
            return Err(FrostError::InvalidThreshold {
                threshold: self.threshold,
                max_signers: self.max_signers,
            });
        }
        if self.max_signers > MAX_SIGNERS {
            return Err(FrostError::TooManySigners(self.max_signers));
        }
        validate_point(&self.public_key)?;

        if self.participants.len() < self.threshold as usize
            || self.participants.len() > self.max_signers as usize
        {
            return Err(FrostError::InvalidCommitmentCount {
                have: self.participants.len(),
                min: self.threshold as usize,
                max: self.max_signers as usize,
            });
        }
        for (i, &id) in self.participants.iter().enumerate() {
            if id == 0 || id > self.max_signers {
                return Err(FrostError::InvalidIdentifier(id));
            }
            if self.participants[..i].contains(&id) {
                return Err(FrostError::DuplicateParticipant(id));
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: u16) -> bool {
        self.participants.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::Scalar;

    fn test_key() -> ProjectivePoint {
        ProjectivePoint::GENERATOR * Scalar::from(1234567u64)
    }

    #[test]
    fn configuration_round_trip() {
        let configuration = Configuration {
            threshold: 3,
            max_signers: 5,
            public_key: test_key(),
            participants: vec![2, 4, 5],
        };
        let decoded = Configuration::decode_hex(&configuration.hex()).unwrap();
        assert_eq!(decoded, configuration);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let mut configuration = Configuration {
            threshold: 0,
            max_signers: 5,
            public_key: test_key(),
            participants: vec![1, 2, 3],
        };
        assert!(configuration.validate().is_err());

        configuration.threshold = 3;
        configuration.participants = vec![1, 2];
        assert!(configuration.validate().is_err());

        configuration.participants = vec![1, 2, 2];
        assert!(configuration.validate().is_err());

        configuration.participants = vec![1, 2, 6];
        assert!(configuration.validate().is_err());

        configuration.participants = vec![1, 2, 0];
        assert!(configuration.validate().is_err());

        configuration.participants = vec![1, 3, 5];
        configuration.validate().unwrap();
    }
}

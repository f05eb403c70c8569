//! The event-bus message unit: id-addressed, BIP-340 signed events.

use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::schnorr::{SigningKey, VerifyingKey};
use k256::{ProjectivePoint, Scalar};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use promenade_frost::curve::{has_odd_y, lift_x, reduce_scalar, scalar_bytes};

use crate::error::CommonError;
use crate::Result;

/// A protocol event. `id = sha256([0, pubkey, created_at, kind, tags,
/// content])` over the compact JSON encoding; `sig` is a BIP-340
/// signature over the raw id bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    pub fn new(kind: u16, content: impl Into<String>, tags: Vec<Vec<String>>) -> Self {
        Event {
            id: String::new(),
            pubkey: String::new(),
            created_at: crate::now(),
            kind,
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    /// The canonical serialization the id commits to.
    pub fn serialize_canonical(&self) -> String {
        serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ])
        .to_string()
    }

    pub fn compute_id(&self) -> String {
        let digest = Sha256::digest(self.serialize_canonical().as_bytes());
        hex::encode(digest)
    }

    /// Whether the event's id matches its contents.
    pub fn check_id(&self) -> bool {
        self.id == self.compute_id()
    }

    pub fn id_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.id)?;
        bytes.try_into().map_err(|_| CommonError::BadEventId)
    }

    /// Recompute the id and sign with `keys`, setting author, id and sig.
    pub fn sign(&mut self, keys: &Keys) -> Result<()> {
        self.pubkey = keys.public_key();
        self.id = self.compute_id();
        let id_bytes = self.id_bytes()?;

        let mut aux = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut aux);
        let signature = keys
            .signing_key()
            .sign_raw(&id_bytes, &aux)
            .map_err(|e| CommonError::Signing(e.to_string()))?;
        self.sig = hex::encode(signature.to_bytes());
        Ok(())
    }

    /// Verify id consistency and the BIP-340 signature.
    pub fn verify(&self) -> bool {
        if !self.check_id() {
            return false;
        }
        let Ok(id_bytes) = self.id_bytes() else {
            return false;
        };
        let Ok(pubkey_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&pubkey_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(signature) = k256::schnorr::Signature::try_from(&sig_bytes[..]) else {
            return false;
        };
        verifying_key.verify_raw(&id_bytes, &signature).is_ok()
    }

    /// First tag with the given name.
    pub fn find_tag(&self, name: &str) -> Option<&Vec<String>> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(|n| n == name).unwrap_or(false))
    }

    /// All tags with the given name.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(|n| n == name).unwrap_or(false))
    }

    /// Value of the first tag with this name, when it has one.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.find_tag(name)
            .and_then(|tag| tag.get(1))
            .map(|s| s.as_str())
    }

    /// Ephemeral events are relayed but never stored.
    pub fn is_ephemeral(&self) -> bool {
        (20000..30000).contains(&self.kind)
    }
}

/// A secp256k1 keypair identified by its x-only public key.
///
/// The secret scalar is normalized so that `scalar · G` is the even-Y
/// lift of the public key, which keeps ECDH symmetric between parties
/// that only know each other's x-only keys.
#[derive(Clone)]
pub struct Keys {
    scalar: Scalar,
    public_key: String,
}

impl Keys {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::from_scalar(reduce_scalar(&bytes)).expect("random scalar is nonzero")
    }

    pub fn parse(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CommonError::InvalidSecretKey)?;
        Self::from_scalar(reduce_scalar(&bytes))
    }

    fn from_scalar(mut scalar: Scalar) -> Result<Self> {
        if bool::from(scalar.is_zero()) {
            return Err(CommonError::InvalidSecretKey);
        }
        let point = ProjectivePoint::GENERATOR * scalar;
        if has_odd_y(&point) {
            scalar = -scalar;
        }
        let encoded = (ProjectivePoint::GENERATOR * scalar)
            .to_affine()
            .to_encoded_point(true);
        let public_key = hex::encode(&encoded.as_bytes()[1..]);
        Ok(Keys { scalar, public_key })
    }

    /// The x-only public key, hex encoded.
    pub fn public_key(&self) -> String {
        self.public_key.clone()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(scalar_bytes(&self.scalar))
    }

    pub fn secret_scalar(&self) -> &Scalar {
        &self.scalar
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&scalar_bytes(&self.scalar))
            .expect("normalized nonzero scalar is a valid signing key")
    }

    /// The x coordinate of the ECDH shared point with `their` x-only key.
    pub fn shared_secret(&self, their_pubkey_hex: &str) -> Result<[u8; 32]> {
        let bytes = hex::decode(their_pubkey_hex)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CommonError::InvalidPublicKey)?;
        let their_point = lift_x(&bytes).map_err(|_| CommonError::InvalidPublicKey)?;
        let shared = their_point * self.scalar;
        if shared == ProjectivePoint::IDENTITY {
            return Err(CommonError::InvalidPublicKey);
        }
        Ok(promenade_frost::curve::xonly(&shared))
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

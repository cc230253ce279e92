//! Identities and the credential store interface.
//!
//! Private keys never leave a [`SigningIdentity`]. The store only hands one
//! out in exchange for the right password.

use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

use crate::block::{BlockBuilder, SignedBlock, UnsignedBlock};
use crate::error::CredentialError;
use crate::hash::{decode_hex, encode_hex, Hash, Hasher};
use crate::transaction::Transaction;

/// An unlocked identity able to sign blocks.
#[derive(Clone)]
pub struct SigningIdentity {
    user_id: String,
    location: String,
    key: SigningKey,
}

impl SigningIdentity {
    pub fn new(user_id: impl Into<String>, location: impl Into<String>, key: SigningKey) -> Self {
        Self {
            user_id: user_id.into(),
            location: location.into(),
            key,
        }
    }

    /// Generate a fresh key pair.
    pub fn generate(user_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self::new(user_id, location, SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// A certificate binding this identity's id to its public key.
    pub fn certificate(&self) -> Transaction {
        Transaction::certificate(self.user_id.clone(), &self.public_key())
    }

    pub fn sign(&self, unsigned: UnsignedBlock) -> SignedBlock {
        unsigned.sign(&self.key)
    }

    /// Build and sign a block authored by this identity.
    pub fn issue(
        &self,
        parents: impl IntoIterator<Item = Hash>,
        transactions: impl IntoIterator<Item = Transaction>,
        timestamp: i64,
    ) -> SignedBlock {
        let unsigned = BlockBuilder::new(self.user_id.clone())
            .with_timestamp(timestamp)
            .with_location(self.location.clone())
            .with_parents(parents)
            .with_transactions(transactions)
            .build();
        self.sign(unsigned)
    }

    /// A proof-of-witness block over `parents`.
    pub fn witness(&self, parents: impl IntoIterator<Item = Hash>, timestamp: i64) -> SignedBlock {
        self.issue(
            parents,
            [Transaction::proof_of_witness(self.user_id.clone())],
            timestamp,
        )
    }

    /// A genesis block certifying this identity plus `founders`.
    pub fn genesis(&self, founders: impl IntoIterator<Item = Transaction>) -> SignedBlock {
        let unsigned = BlockBuilder::genesis(self.user_id.clone())
            .with_transaction(self.certificate())
            .with_transactions(founders)
            .build();
        self.sign(unsigned)
    }

    /// Raw secret key bytes, for export.
    pub fn secret_hex(&self) -> String {
        encode_hex(&self.key.to_bytes())
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("user_id", &self.user_id)
            .field("location", &self.location)
            .field("public_key", &public_key_hex(&self.public_key()))
            .finish()
    }
}

/// Resolves the trust anchor and unlocks local signing identities.
pub trait CredentialStore: Send + Sync {
    /// Id of the certificate authority.
    fn admin_id(&self) -> &str;

    /// Public key of the certificate authority. Admin blocks verify against it.
    fn admin_public_key(&self) -> VerifyingKey;

    /// Id of the user who owns this device, if one is enrolled.
    fn local_user_id(&self) -> Option<&str>;

    fn unlock_user(&self, password: &str) -> Result<SigningIdentity, CredentialError>;

    fn unlock_admin(&self, password: &str) -> Result<SigningIdentity, CredentialError>;
}

/// `SHA256(password || salt)`.
pub fn password_digest(password: &str, salt: &[u8]) -> Hash {
    Hasher::hash_all(&[password.as_bytes(), salt])
}

pub fn public_key_hex(key: &VerifyingKey) -> String {
    encode_hex(key.as_bytes())
}

pub fn public_key_from_hex(s: &str) -> Result<VerifyingKey, CredentialError> {
    let bytes: [u8; 32] = decode_hex(s)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CredentialError::InvalidKey(format!("expected 64 hex chars, got {:?}", s)))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CredentialError::InvalidKey(e.to_string()))
}

pub fn signing_key_from_hex(s: &str) -> Result<SigningKey, CredentialError> {
    let bytes: [u8; 32] = decode_hex(s)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CredentialError::InvalidKey("expected 64 hex chars".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

struct Sealed {
    identity: SigningIdentity,
    salt: Vec<u8>,
    digest: Hash,
}

impl Sealed {
    fn new(identity: SigningIdentity, password: &str) -> Self {
        let salt = rand::random::<[u8; 16]>().to_vec();
        let digest = password_digest(password, &salt);
        Self {
            identity,
            salt,
            digest,
        }
    }

    fn open(&self, password: &str) -> Result<SigningIdentity, CredentialError> {
        if password_digest(password, &self.salt) == self.digest {
            Ok(self.identity.clone())
        } else {
            Err(CredentialError::WrongPassword(self.identity.user_id.clone()))
        }
    }
}

/// Credential store holding password-sealed identities in memory.
pub struct MemoryCredentialStore {
    admin_id: String,
    admin_key: VerifyingKey,
    admin: Option<Sealed>,
    user: Option<Sealed>,
}

impl MemoryCredentialStore {
    /// A store that trusts `admin_key` but cannot sign as the admin.
    pub fn new(admin_id: impl Into<String>, admin_key: VerifyingKey) -> Self {
        Self {
            admin_id: admin_id.into(),
            admin_key,
            admin: None,
            user: None,
        }
    }

    /// Enroll the admin identity, replacing the trust anchor with its key.
    pub fn with_admin(mut self, identity: SigningIdentity, password: &str) -> Self {
        self.admin_id = identity.user_id.clone();
        self.admin_key = identity.public_key();
        self.admin = Some(Sealed::new(identity, password));
        self
    }

    /// Enroll the local user.
    pub fn with_user(mut self, identity: SigningIdentity, password: &str) -> Self {
        self.user = Some(Sealed::new(identity, password));
        self
    }

    /// Enroll the local user with a precomputed salt and digest.
    pub fn with_user_digest(mut self, identity: SigningIdentity, salt: Vec<u8>, digest: Hash) -> Self {
        self.user = Some(Sealed {
            identity,
            salt,
            digest,
        });
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn admin_id(&self) -> &str {
        &self.admin_id
    }

    fn admin_public_key(&self) -> VerifyingKey {
        self.admin_key
    }

    fn local_user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|s| s.identity.user_id.as_str())
    }

    fn unlock_user(&self, password: &str) -> Result<SigningIdentity, CredentialError> {
        self.user
            .as_ref()
            .ok_or_else(|| CredentialError::UnknownIdentity("local user".into()))?
            .open(password)
    }

    fn unlock_admin(&self, password: &str) -> Result<SigningIdentity, CredentialError> {
        self.admin
            .as_ref()
            .ok_or_else(|| CredentialError::UnknownIdentity(self.admin_id.clone()))?
            .open(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, seed: u8) -> SigningIdentity {
        SigningIdentity::new(name, "ward-3", SigningKey::from_bytes(&[seed; 32]))
    }

    #[test]
    fn unlock_requires_matching_password() {
        let store = MemoryCredentialStore::new("admin", identity("admin", 1).public_key())
            .with_user(identity("alice", 2), "hunter2");

        let alice = store.unlock_user("hunter2").unwrap();
        assert_eq!(alice.user_id(), "alice");
        assert_eq!(
            store.unlock_user("wrong").unwrap_err(),
            CredentialError::WrongPassword("alice".into())
        );
        assert!(matches!(
            store.unlock_admin("hunter2"),
            Err(CredentialError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn with_admin_sets_trust_anchor() {
        let admin = identity("ca", 1);
        let store = MemoryCredentialStore::new("placeholder", identity("x", 9).public_key())
            .with_admin(admin.clone(), "root");
        assert_eq!(store.admin_id(), "ca");
        assert_eq!(store.admin_public_key(), admin.public_key());
        assert_eq!(store.unlock_admin("root").unwrap().user_id(), "ca");
        assert_eq!(store.local_user_id(), None);
    }

    #[test]
    fn precomputed_digest_unlocks() {
        let salt = vec![7u8; 16];
        let digest = password_digest("pw", &salt);
        let store = MemoryCredentialStore::new("admin", identity("admin", 1).public_key())
            .with_user_digest(identity("bob", 3), salt, digest);
        assert_eq!(store.local_user_id(), Some("bob"));
        assert!(store.unlock_user("pw").is_ok());
    }

    #[test]
    fn key_hex_round_trip() {
        let id = identity("alice", 4);
        let pk = public_key_from_hex(&public_key_hex(&id.public_key())).unwrap();
        assert_eq!(pk, id.public_key());
        let sk = signing_key_from_hex(&id.secret_hex()).unwrap();
        assert_eq!(sk.verifying_key(), id.public_key());
        assert!(public_key_from_hex("abcd").is_err());
    }

    #[test]
    fn witness_block_shape() {
        let id = identity("alice", 5);
        let parent = Hasher::hash(b"root");
        let w = id.witness([parent], 99);
        assert_eq!(w.parent_hashes(), &[parent]);
        assert_eq!(w.timestamp(), 99);
        assert_eq!(w.location(), "ward-3");
        assert_eq!(w.transactions(), &[Transaction::proof_of_witness("alice")]);
        assert!(w.verify(&id.public_key()));
    }
}

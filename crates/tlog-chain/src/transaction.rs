//! Transactions carried inside blocks.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::{decode_hex, encode_hex};

/// The fixed set of transaction kinds the log understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Binds a user id (`content`) to a hex public key (`comment`). Admin-issued.
    Certificate,
    /// Permanently revokes the certificate of the user id in `content`.
    RevokeCertificate,
    /// Requests access to the record named in `content`.
    RecordRequest,
    /// Attests that the author has incorporated everything up to the block's parents.
    ProofOfWitness,
    /// Opaque record-access event, interpreted outside the log.
    RecordAccess,
}

impl TransactionKind {
    /// Stable tag used in canonical encoding. Never renumber.
    pub fn tag(self) -> u8 {
        match self {
            TransactionKind::Certificate => 1,
            TransactionKind::RevokeCertificate => 2,
            TransactionKind::RecordRequest => 3,
            TransactionKind::ProofOfWitness => 4,
            TransactionKind::RecordAccess => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Certificate => "CERTIFICATE",
            TransactionKind::RevokeCertificate => "REVOKE_CERTIFICATE",
            TransactionKind::RecordRequest => "RECORD_REQUEST",
            TransactionKind::ProofOfWitness => "PROOF_OF_WITNESS",
            TransactionKind::RecordAccess => "RECORD_ACCESS",
        }
    }
}

/// An immutable `{kind, content, comment}` triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    kind: TransactionKind,
    content: String,
    comment: String,
}

impl Transaction {
    pub fn new(kind: TransactionKind, content: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            comment: comment.into(),
        }
    }

    pub fn certificate(user_id: impl Into<String>, key: &VerifyingKey) -> Self {
        Self::new(TransactionKind::Certificate, user_id, encode_hex(key.as_bytes()))
    }

    pub fn revoke_certificate(user_id: impl Into<String>) -> Self {
        Self::new(TransactionKind::RevokeCertificate, user_id, "")
    }

    pub fn record_request(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(TransactionKind::RecordRequest, record_id, reason)
    }

    pub fn proof_of_witness(user_id: impl Into<String>) -> Self {
        Self::new(TransactionKind::ProofOfWitness, user_id, "Signed off")
    }

    pub fn record_access(record_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(TransactionKind::RecordAccess, record_id, detail)
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// The `(user_id, key)` bound by a certificate, if this is a well-formed one.
    pub fn certified_key(&self) -> Option<(&str, VerifyingKey)> {
        if self.kind != TransactionKind::Certificate {
            return None;
        }
        let bytes: [u8; 32] = decode_hex(&self.comment)?.try_into().ok()?;
        let key = VerifyingKey::from_bytes(&bytes).ok()?;
        Some((&self.content, key))
    }

    /// Whether this transaction revokes `user_id`.
    pub fn revokes(&self, user_id: &str) -> bool {
        self.kind == TransactionKind::RevokeCertificate && self.content == user_id
    }

    /// Fixed byte form used when hashing and signing blocks:
    /// kind tag, then length-prefixed content and comment.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.content.len() + self.comment.len());
        out.push(self.kind.tag());
        put_field(&mut out, self.content.as_bytes());
        put_field(&mut out, self.comment.as_bytes());
        out
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.kind.as_str(), self.content)?;
        if !self.comment.is_empty() {
            write!(f, "; {}", self.comment)?;
        }
        write!(f, ")")
    }
}

/// Append a u32 big-endian length followed by the bytes.
pub(crate) fn put_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn certificate_round_trips_key() {
        let key = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        let tx = Transaction::certificate("alice", &key);
        let (user, parsed) = tx.certified_key().unwrap();
        assert_eq!(user, "alice");
        assert_eq!(parsed, key);
        assert_eq!(tx.comment().len(), 64);
    }

    #[test]
    fn malformed_certificate_has_no_key() {
        let tx = Transaction::new(TransactionKind::Certificate, "alice", "not-hex");
        assert!(tx.certified_key().is_none());
        assert!(Transaction::revoke_certificate("alice").certified_key().is_none());
    }

    #[test]
    fn revocation_matches_user() {
        let tx = Transaction::revoke_certificate("bob");
        assert!(tx.revokes("bob"));
        assert!(!tx.revokes("alice"));
        assert!(!Transaction::record_request("bob", "").revokes("bob"));
    }

    #[test]
    fn canonical_bytes_are_unambiguous() {
        let a = Transaction::record_request("ab", "c");
        let b = Transaction::record_request("a", "bc");
        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn display_is_readable() {
        assert_eq!(
            Transaction::record_request("chart-7", "audit").to_string(),
            "RECORD_REQUEST(chart-7; audit)"
        );
        assert_eq!(Transaction::revoke_certificate("bob").to_string(), "REVOKE_CERTIFICATE(bob)");
    }
}

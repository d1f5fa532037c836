//! Certificates (spec §4.9 "Security Manager"), grounded on
//! `SecurityManager.cpp`'s CA-rooted trust model: every node holds an
//! RSA key pair, and a certificate binds a node id to its public key,
//! signed by a certificate authority every node trusts by construction.
//!
//! The original hardcodes a demonstration CA key pair in PEM; this crate
//! keeps the same shape but takes the CA key pair as a parameter rather than
//! a compiled-in constant, so tests (and real deployments) can supply their
//! own.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A certificate authority: an RSA key pair every node trusts as the root
/// of the certificate chain (`SecurityManager::ca_public_key` /
/// `ca_private_key` in the original, but supplied rather than baked in).
pub struct CertificateAuthority {
    signing_key: SigningKey<Sha256>,
}

impl CertificateAuthority {
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self {
            signing_key: SigningKey::new(private_key),
        }
    }

    /// This build's demonstration trust root: every `haggled` process
    /// derives the *same* RSA key pair from a fixed seed, so out-of-the-box
    /// nodes trust each other's certificates without any provisioning step.
    /// This is exactly as insecure as it sounds — it's a stand-in for the
    /// original's compiled-in CA PEM, suitable for a demo mesh and nothing
    /// more. A real deployment replaces this with a provisioned CA loaded
    /// from configuration.
    pub fn demo_root() -> Self {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x4861_6767_6c65); // "Haggle" in hex-ish
        let key = RsaPrivateKey::new(&mut rng, 2048).expect("demo CA key generation");
        Self::from_private_key(key)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.signing_key.as_ref().to_public_key()
    }

    /// Issue a certificate binding `subject` to `subject_key`, valid for
    /// `validity_secs` seconds from `issued_at`.
    pub fn issue(
        &self,
        subject: impl Into<String>,
        subject_key: &RsaPublicKey,
        issued_at: u64,
        validity_secs: u64,
    ) -> Result<Certificate> {
        let subject = subject.into();
        let subject_key_der = subject_key
            .to_pkcs1_der()
            .map_err(|e| Error::CertificateInvalid(e.to_string()))?
            .into_vec();
        let to_sign = signing_bytes(&subject, &subject_key_der, issued_at, validity_secs);
        let signature: Signature = self.signing_key.sign_with_rng(&mut OsRng, &to_sign);
        Ok(Certificate {
            subject,
            subject_key_der,
            issued_at,
            validity_secs,
            issuer_signature: signature.to_vec(),
        })
    }
}

fn signing_bytes(subject: &str, key_der: &[u8], issued_at: u64, validity_secs: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(subject.len() + key_der.len() + 16);
    buf.extend_from_slice(subject.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key_der);
    buf.extend_from_slice(&issued_at.to_be_bytes());
    buf.extend_from_slice(&validity_secs.to_be_bytes());
    buf
}

/// A node certificate: `(subject, public key, validity window, issuer
/// signature)`. Verifies against a `CertificateAuthority`'s public key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    subject: String,
    subject_key_der: Vec<u8>,
    issued_at: u64,
    validity_secs: u64,
    issuer_signature: Vec<u8>,
}

impl Certificate {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn subject_key(&self) -> Result<RsaPublicKey> {
        RsaPublicKey::from_pkcs1_der(&self.subject_key_der).map_err(|e| Error::CertificateInvalid(e.to_string()))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.issued_at.saturating_add(self.validity_secs)
    }

    /// Verify this certificate's issuer signature against a CA public key
    /// and confirm it hasn't expired as of `now`.
    pub fn verify(&self, ca_public_key: &RsaPublicKey, now: u64) -> Result<()> {
        if self.is_expired(now) {
            return Err(Error::CertificateInvalid(format!(
                "certificate for {} expired at {}",
                self.subject,
                self.issued_at + self.validity_secs
            )));
        }
        let verifying_key: VerifyingKey<Sha256> = VerifyingKey::new(ca_public_key.clone());
        let signature = Signature::try_from(self.issuer_signature.as_slice())
            .map_err(|e| Error::CertificateInvalid(e.to_string()))?;
        let to_verify = signing_bytes(&self.subject, &self.subject_key_der, self.issued_at, self.validity_secs);
        verifying_key
            .verify(&to_verify, &signature)
            .map_err(|e| Error::CertificateInvalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (CertificateAuthority, RsaPublicKey) {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let ca = CertificateAuthority::from_private_key(key);
        let pub_key = ca.public_key();
        (ca, pub_key)
    }

    #[test]
    fn issued_certificate_verifies() {
        let (ca, ca_pub) = test_ca();
        let subject_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap().to_public_key();
        let cert = ca.issue("node-a", &subject_key, 1000, 3600).unwrap();
        assert!(cert.verify(&ca_pub, 1500).is_ok());
    }

    #[test]
    fn expired_certificate_rejected() {
        let (ca, ca_pub) = test_ca();
        let subject_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap().to_public_key();
        let cert = ca.issue("node-a", &subject_key, 1000, 100).unwrap();
        assert!(cert.verify(&ca_pub, 2000).is_err());
    }

    #[test]
    fn tampered_subject_fails_verification() {
        let (ca, ca_pub) = test_ca();
        let subject_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap().to_public_key();
        let mut cert = ca.issue("node-a", &subject_key, 1000, 3600).unwrap();
        cert.subject = "node-b".to_string();
        assert!(cert.verify(&ca_pub, 1500).is_err());
    }
}

//! Security Manager (spec §4.9): certificate issuance and signature
//! verification gated by the configured security level.
//!
//! Grounded on `SecurityManager.cpp`'s CA-rooted trust model, adapted to
//! this crate's split between `haggle_core::certificate` (the pure
//! sign/verify algebra) and this manager (repository-backed key lifecycle,
//! event wiring). Where the original dispatches verification and signing
//! through bound callback closures posted back onto the kernel thread, this
//! manager exposes `sign_if_needed`/`attach_certificate_if_description` as
//! plain synchronous methods any other manager can call directly before
//! handing an object onward — there is no natural subscriber for "please
//! sign this outgoing object", only the caller that's about to send it, so
//! a dedicated bus event would just be a detour back to the same caller.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use haggle_core::canonical::{self, blake3_domain, Sha1Id, DOMAIN_CERTIFICATE};
use haggle_core::{Certificate, CertificateAuthority, DataObject, SignatureStatus};
use parking_lot::RwLock;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::rand_core::OsRng;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::SecurityLevel;
use crate::event::{now_unix, Event, EventKind, Phase};
use crate::kernel::KernelHandle;
use crate::store::DataStore;

const AUTHORITY: &str = "SecurityManager";
const PRIVKEY_KEY: &str = "privkey";
const CERT_VALIDITY_SECS: u64 = 365 * 24 * 3600;
const MANAGER_NAME: &str = "SecurityManager";

fn sign_id(key: &RsaPrivateKey, id: &[u8; 20]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature: Signature = signing_key.sign_with_rng(&mut OsRng, id);
    signature.to_vec()
}

fn verify_id(pub_key: &RsaPublicKey, id: &[u8; 20], sig_bytes: &[u8]) -> bool {
    let verifying_key: VerifyingKey<Sha256> = VerifyingKey::new(pub_key.clone());
    match Signature::try_from(sig_bytes) {
        Ok(signature) => verifying_key.verify(id, &signature).is_ok(),
        Err(_) => false,
    }
}

fn encode_certificate(cert: &Certificate) -> String {
    let bytes = postcard::to_allocvec(cert).expect("certificate always serializes");
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_certificate(s: &str) -> Option<Certificate> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    postcard::from_bytes(&bytes).ok()
}

/// Whether `object` needs its signature checked before anything downstream
/// may treat it as verified (spec §4.9: low never checks, medium checks
/// node descriptions only, high checks every signed object).
fn requires_verification(level: SecurityLevel, object: &DataObject) -> bool {
    if object.signature_status() == SignatureStatus::Missing {
        return false;
    }
    match level {
        SecurityLevel::Low => false,
        SecurityLevel::Medium => object.bookkeeping.is_node_description,
        SecurityLevel::High => true,
    }
}

pub struct SecurityManager {
    handle: KernelHandle,
    store: Arc<dyn DataStore>,
    level: SecurityLevel,
    ca: CertificateAuthority,
    subject: String,
    node_id: Sha1Id,
    private_key: RsaPrivateKey,
    certificate: Certificate,
    certificates: RwLock<HashMap<String, Certificate>>,
}

impl SecurityManager {
    /// Load this node's key pair and certificate store from the repository,
    /// synthesising both on first run (spec §4.9 "Startup").
    pub fn load_or_create(handle: KernelHandle, store: Arc<dyn DataStore>, level: SecurityLevel) -> anyhow::Result<Arc<Self>> {
        let ca = CertificateAuthority::demo_root();
        let entries = store.read_repository(AUTHORITY)?;

        let mut private_key = None;
        let mut certificates = HashMap::new();
        for entry in entries {
            if entry.key == PRIVKEY_KEY {
                let der = base64::engine::general_purpose::STANDARD.decode(&entry.value)?;
                private_key = Some(RsaPrivateKey::from_pkcs1_der(&der)?);
            } else if let Some(cert) = decode_certificate(&entry.value) {
                certificates.insert(entry.key, cert);
            } else {
                warn!(key = %entry.key, "security: dropping malformed repository entry");
            }
        }

        let private_key = match private_key {
            Some(k) => k,
            None => {
                info!("security: no stored key pair, generating one");
                let key = RsaPrivateKey::new(&mut OsRng, 2048)?;
                let der = key.to_pkcs1_der()?.as_bytes().to_vec();
                store.insert_repository(AUTHORITY, PRIVKEY_KEY, &base64::engine::general_purpose::STANDARD.encode(der))?;
                key
            }
        };

        let public_key = private_key.to_public_key();
        let public_key_der = public_key.to_pkcs1_der()?.into_vec();
        let subject = hex::encode(blake3_domain(DOMAIN_CERTIFICATE, &public_key_der));
        // ThisNode's stable identity (spec §4.4/§4.9: certificate subject and
        // node id both derive from the same key material, so neither churns
        // independently of the other).
        let node_id = canonical::hash_bytes_sha1(&public_key_der);

        let now = now_unix();
        let certificate = match certificates.get(&subject) {
            Some(cert) if !cert.is_expired(now) => cert.clone(),
            _ => {
                info!(subject = %subject, "security: issuing self-certificate from the demo trust root");
                let cert = ca.issue(subject.clone(), &public_key, now, CERT_VALIDITY_SECS)?;
                store.insert_repository(AUTHORITY, &subject, &encode_certificate(&cert))?;
                certificates.insert(subject.clone(), cert.clone());
                cert
            }
        };

        Ok(Arc::new(Self {
            handle,
            store,
            level,
            ca,
            subject,
            node_id,
            private_key,
            certificate,
            certificates: RwLock::new(certificates),
        }))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// `ThisNode`'s stable id: a SHA-1 hash of this node's public key,
    /// independent of its (mutable) interest set. Peer ids are never derived
    /// this way — they're carried as-is in the decoded node description.
    pub fn node_id(&self) -> Sha1Id {
        self.node_id
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Attach this node's own certificate to `object` if it's a node
    /// description, so peers can verify it against the shared CA (spec
    /// §4.9 "DATAOBJECT_SEND ... thisNode's description"). Carried as a
    /// companion field rather than an attribute so attaching it never
    /// perturbs the object's content-addressed id.
    pub fn attach_certificate_if_description(&self, object: &mut DataObject) {
        if !object.bookkeeping.is_node_description {
            return;
        }
        object.attach_certificate(self.certificate.clone());
    }

    /// Sign `object` with this node's private key if it isn't signed yet
    /// (spec §4.9: internal objects such as node descriptions, and objects
    /// submitted by a local application, get signed here rather than
    /// arriving pre-signed).
    pub fn sign_if_needed(&self, object: &mut DataObject) {
        if object.signature_status() != SignatureStatus::Missing {
            return;
        }
        let signature = sign_id(&self.private_key, object.id());
        object.set_signature(self.subject.clone(), signature);
    }

    /// Extract and trust-check an embedded certificate, adding it to the
    /// certificate store on success (spec §4.9 "DATAOBJECT_INCOMING").
    fn ingest_embedded_certificate(&self, object: &DataObject) {
        let Some(cert) = object.certificate() else {
            return;
        };
        let now = now_unix();
        match cert.verify(&self.ca.public_key(), now) {
            Ok(()) => {
                debug!(subject = %cert.subject(), "security: trusted embedded certificate");
                self.certificates.write().insert(cert.subject().to_string(), cert.clone());
            }
            Err(e) => warn!(subject = %cert.subject(), error = %e, "security: rejecting untrusted embedded certificate"),
        }
    }

    fn verify_signature(&self, object: &DataObject) -> bool {
        let (Some(signer), Some(sig_bytes)) = (object.signed_by(), object.signature_bytes()) else {
            return false;
        };
        let Some(cert) = self.certificates.read().get(signer).cloned() else {
            warn!(signer, "security: no trusted certificate for signer");
            return false;
        };
        if cert.verify(&self.ca.public_key(), now_unix()).is_err() {
            return false;
        }
        match cert.subject_key() {
            Ok(pub_key) => verify_id(&pub_key, object.id(), sig_bytes),
            Err(_) => false,
        }
    }

    async fn handle_received(self: &Arc<Self>, mut object: Arc<DataObject>, from_node: Option<String>) {
        if !requires_verification(self.level, &object) {
            let obj = Arc::make_mut(&mut object);
            obj.mark_verified(true);
            self.handle.publish(Event::DataObjectVerified { object, from_node });
            return;
        }

        if object.signature_status() == SignatureStatus::Valid {
            self.handle.publish(Event::DataObjectVerified { object, from_node });
            return;
        }

        let this = self.clone();
        let to_check = object.clone();
        let valid = self.handle.run_blocking(move || this.verify_signature(&to_check)).await.unwrap_or(false);

        if valid {
            let obj = Arc::make_mut(&mut object);
            obj.mark_verified(true);
            self.handle.publish(Event::DataObjectVerified { object, from_node });
        } else {
            debug!(id = %object.id_hex(), "security: verification failed, dropping object");
        }
    }

    /// Drive this manager's event loop until shutdown completes.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.handle.subscribe(&[
            EventKind::DataObjectReceived,
            EventKind::DataObjectIncoming,
            EventKind::PrepareShutdown,
            EventKind::Shutdown,
        ]);

        while let Some(event) = rx.recv().await {
            match event {
                Event::DataObjectIncoming { object, .. } => {
                    self.ingest_embedded_certificate(&object);
                }
                Event::DataObjectReceived { object, from_node, .. } => {
                    self.handle_received(object, from_node).await;
                }
                Event::PrepareShutdown => {
                    self.persist_certificates();
                    self.handle.signal_ready(MANAGER_NAME, Phase::PrepareShutdown);
                }
                Event::Shutdown => {
                    self.handle.signal_ready(MANAGER_NAME, Phase::Shutdown);
                    break;
                }
                _ => {}
            }
        }
    }

    fn persist_certificates(&self) {
        let certs = self.certificates.read();
        for (subject, cert) in certs.iter() {
            if let Err(e) = self.store.insert_repository(AUTHORITY, subject, &encode_certificate(cert)) {
                warn!(subject, error = %e, "security: failed to persist certificate at shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::kernel::Kernel;
    use crate::store::SledDataStore;
    use haggle_core::{AttributeSet, Payload};
    use tempfile::tempdir;

    fn fresh_manager() -> (Arc<SecurityManager>, KernelHandle, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let mgr = SecurityManager::load_or_create(handle.clone(), store, SecurityLevel::High).unwrap();
        (mgr, handle, dir)
    }

    #[test]
    fn startup_synthesises_and_persists_key_pair() {
        let (mgr, _handle, dir) = fresh_manager();
        let subject = mgr.subject().to_string();

        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let entries = store.read_repository(AUTHORITY).unwrap();
        assert!(entries.iter().any(|e| e.key == PRIVKEY_KEY));
        assert!(entries.iter().any(|e| e.key == subject));
    }

    #[test]
    fn sign_if_needed_only_signs_unsigned_objects() {
        let (mgr, _handle, _dir) = fresh_manager();
        let mut obj = DataObject::new(AttributeSet::new(), Payload::None);
        assert_eq!(obj.signature_status(), SignatureStatus::Missing);
        mgr.sign_if_needed(&mut obj);
        assert_eq!(obj.signature_status(), SignatureStatus::Unverified);
        let signer = obj.signed_by().unwrap().to_string();
        mgr.sign_if_needed(&mut obj);
        assert_eq!(obj.signed_by().unwrap(), signer);
    }

    #[test]
    fn self_signed_object_verifies_against_own_certificate() {
        let (mgr, _handle, _dir) = fresh_manager();
        let mut obj = DataObject::new(AttributeSet::new(), Payload::None);
        mgr.sign_if_needed(&mut obj);
        assert!(mgr.verify_signature(&obj));
    }

    #[tokio::test]
    async fn low_security_bypasses_verification_immediately() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(SledDataStore::open(dir.path()).unwrap());
        let kernel = Kernel::new(vec![MANAGER_NAME]);
        let handle = kernel.handle();
        let mgr = SecurityManager::load_or_create(handle.clone(), store, SecurityLevel::Low).unwrap();

        let mut verified_rx = handle.subscribe(&[EventKind::DataObjectVerified]);
        let runner = tokio::spawn(mgr.clone().run());

        let obj = Arc::new(DataObject::new(AttributeSet::new(), Payload::None));
        handle.publish(Event::DataObjectReceived {
            object: obj,
            from_node: None,
            local_interface: "eth0".into(),
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), verified_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::DataObjectVerified { .. }));

        kernel.request_shutdown();
        handle.publish(Event::PrepareShutdown);
        handle.publish(Event::Shutdown);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), runner).await;
    }

    #[test]
    fn embedded_certificate_from_untrusted_authority_is_rejected() {
        let (mgr, _handle, _dir) = fresh_manager();
        let rogue_ca = CertificateAuthority::from_private_key(RsaPrivateKey::new(&mut OsRng, 1024).unwrap());
        let rogue_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap().to_public_key();
        let rogue_cert = rogue_ca.issue("rogue", &rogue_key, now_unix(), 3600).unwrap();

        let mut obj = DataObject::new(AttributeSet::new(), Payload::None);
        obj.attach_certificate(rogue_cert);

        mgr.ingest_embedded_certificate(&obj);
        assert!(mgr.certificates.read().get("rogue").is_none());
    }
}

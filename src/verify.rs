//! Cryptographic Verification
//!
//! SHA-256 artifact checksums and ED25519 manifest signature checks.
//!
//! Verification runs once, at catalog-load time. A manifest that fails any
//! check here is excluded from the catalog, so the request path never pays
//! for signature verification and can never serve an unverified manifest.

use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

use crate::manifest::ReleaseManifest;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("malformed signature encoding")]
    MalformedSignature,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Verifies release manifests against the single configured public key.
///
/// The matching private key lives in the release pipeline and is never
/// present on this server. There is no keyless mode: constructing a
/// `Verifier` requires valid key material (fail-closed).
#[derive(Clone)]
pub struct Verifier {
    public_key: VerifyingKey,
}

impl Verifier {
    pub fn new(key_bytes: &[u8; 32]) -> Result<Self, VerifyError> {
        let public_key =
            VerifyingKey::from_bytes(key_bytes).map_err(|_| VerifyError::InvalidPublicKey)?;
        Ok(Self { public_key })
    }

    /// Build a verifier from a 64-char hex key string.
    pub fn from_hex(key_hex: &str) -> Result<Self, VerifyError> {
        let bytes = hex::decode(key_hex.trim()).map_err(|_| VerifyError::InvalidPublicKey)?;
        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VerifyError::InvalidPublicKey)?;
        Self::new(&key_bytes)
    }

    /// Verify the manifest's detached signature over its canonical
    /// `(version, platform, checksum)` signing message.
    pub fn verify_manifest(&self, manifest: &ReleaseManifest) -> Result<(), VerifyError> {
        let sig_bytes =
            hex::decode(&manifest.signature).map_err(|_| VerifyError::MalformedSignature)?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| VerifyError::MalformedSignature)?;
        let signature = Signature::from_bytes(&sig_array);

        self.public_key
            .verify(manifest.signing_message().as_bytes(), &signature)
            .map_err(|_| VerifyError::InvalidSignature)
    }

    /// Calculate the SHA-256 checksum of a file, streaming.
    pub fn artifact_sha256(path: &Path) -> Result<String, VerifyError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Verify that an artifact on disk matches the checksum its manifest
    /// (and therefore its signature) commits to.
    pub fn verify_artifact(&self, path: &Path, expected: &str) -> Result<(), VerifyError> {
        let actual = Self::artifact_sha256(path)?;
        if actual != expected.to_lowercase() {
            return Err(VerifyError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Signing helpers for tests. Production code never signs anything.

    use super::*;
    use crate::manifest::{Platform, ReleaseManifest};
    use chrono::Utc;
    use ed25519_dalek::{Signer, SigningKey};

    pub fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    pub fn verifier() -> Verifier {
        Verifier::new(signing_key().verifying_key().as_bytes()).unwrap()
    }

    /// A manifest signed with the test key over its current field values.
    pub fn signed_manifest(version: &str, platform: Platform, checksum: &str) -> ReleaseManifest {
        let mut manifest = ReleaseManifest {
            version: version.to_string(),
            platform,
            artifact_path: format!("atrium-{version}-{platform}.tar.gz"),
            checksum: checksum.to_string(),
            signature: String::new(),
            published_at: Utc::now(),
            cdn_url: None,
            mirrored: None,
        };
        let sig = signing_key().sign(manifest.signing_message().as_bytes());
        manifest.signature = hex::encode(sig.to_bytes());
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::manifest::Platform;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sha256_calculation() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let checksum = Verifier::artifact_sha256(file.path()).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_artifact_checksum_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        let verifier = verifier();
        let result = verifier.verify_artifact(file.path(), "deadbeef");
        assert!(matches!(result, Err(VerifyError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_valid_signature_accepted() {
        let manifest = signed_manifest("1.3.0", Platform::LinuxX64, "cafe01");
        assert!(verifier().verify_manifest(&manifest).is_ok());
    }

    #[test]
    fn test_mutating_any_signed_field_invalidates() {
        let verifier = verifier();
        let good = signed_manifest("1.3.0", Platform::LinuxX64, "cafe01");

        let mut tampered_version = good.clone();
        tampered_version.version = "1.3.1".to_string();
        assert!(matches!(
            verifier.verify_manifest(&tampered_version),
            Err(VerifyError::InvalidSignature)
        ));

        let mut tampered_platform = good.clone();
        tampered_platform.platform = Platform::MacosArm64;
        assert!(matches!(
            verifier.verify_manifest(&tampered_platform),
            Err(VerifyError::InvalidSignature)
        ));

        let mut tampered_checksum = good.clone();
        tampered_checksum.checksum = "cafe02".to_string();
        assert!(matches!(
            verifier.verify_manifest(&tampered_checksum),
            Err(VerifyError::InvalidSignature)
        ));

        // Unsigned fields do not participate in the signature.
        let mut retargeted = good.clone();
        retargeted.artifact_path = "elsewhere.tar.gz".to_string();
        assert!(verifier.verify_manifest(&retargeted).is_ok());
    }

    #[test]
    fn test_malformed_signature_encoding() {
        let verifier = verifier();

        let mut manifest = signed_manifest("1.3.0", Platform::LinuxX64, "cafe01");
        manifest.signature = "not hex".to_string();
        assert!(matches!(
            verifier.verify_manifest(&manifest),
            Err(VerifyError::MalformedSignature)
        ));

        manifest.signature = "00ff".to_string();
        assert!(matches!(
            verifier.verify_manifest(&manifest),
            Err(VerifyError::MalformedSignature)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let manifest = signed_manifest("1.3.0", Platform::LinuxX64, "cafe01");
        let other_key = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let wrong = Verifier::new(other_key.verifying_key().as_bytes()).unwrap();
        assert!(matches!(
            wrong.verify_manifest(&manifest),
            Err(VerifyError::InvalidSignature)
        ));
    }

    #[test]
    fn test_from_hex_validation() {
        assert!(Verifier::from_hex("zz").is_err());
        assert!(Verifier::from_hex("00ff").is_err());
        let key_hex = hex::encode(signing_key().verifying_key().as_bytes());
        assert!(Verifier::from_hex(&key_hex).is_ok());
    }
}

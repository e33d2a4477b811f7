use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use orchestra_core::audit::{PayloadSigner, SignatureVerifier, SigningError};
use orchestra_types::audit::AuditSignature;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ALGORITHM: &str = "ed25519";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("error reading key '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error decoding key '{path}': {message}")]
    Decode { path: PathBuf, message: String },

    #[error("invalid key length in '{path}': expected 32 bytes")]
    Length { path: PathBuf },

    #[error("refusing to overwrite existing key '{0}'")]
    Exists(PathBuf),
}

// ---------------------------------------------------------------------------
// Key files
// ---------------------------------------------------------------------------

/// Paths of a generated keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairPaths {
    pub secret: PathBuf,
    pub public: PathBuf,
}

/// Generate an Ed25519 keypair as `<prefix>.secret` and `<prefix>.pub`.
///
/// Both files hold base64 of the 32 raw key bytes. The secret file is
/// restricted to 0o600 on Unix. Existing files are never overwritten.
pub fn generate_keypair(prefix: &Path) -> Result<(KeyPairPaths, VerifyingKey), KeyError> {
    let paths = KeyPairPaths {
        secret: with_suffix(prefix, "secret"),
        public: with_suffix(prefix, "pub"),
    };
    for path in [&paths.secret, &paths.public] {
        if path.exists() {
            return Err(KeyError::Exists(path.clone()));
        }
    }

    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying_key = signing_key.verifying_key();

    write_key(&paths.secret, &BASE64.encode(signing_key.to_bytes()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&paths.secret, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %paths.secret.display(), error = %e, "failed to restrict secret key permissions");
        }
    }
    write_key(&paths.public, &BASE64.encode(verifying_key.to_bytes()))?;

    tracing::info!(
        public = %paths.public.display(),
        fingerprint = %key_fingerprint(&verifying_key),
        "generated audit signing keypair"
    );
    Ok((paths, verifying_key))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn write_key(path: &Path, contents: &str) -> Result<(), KeyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| KeyError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_key_bytes(path: &Path) -> Result<[u8; 32], KeyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let bytes = BASE64
        .decode(contents.trim())
        .map_err(|e| KeyError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    bytes.try_into().map_err(|_| KeyError::Length {
        path: path.to_path_buf(),
    })
}

pub fn read_secret_key(path: &Path) -> Result<SigningKey, KeyError> {
    Ok(SigningKey::from_bytes(&read_key_bytes(path)?))
}

pub fn read_public_key(path: &Path) -> Result<VerifyingKey, KeyError> {
    VerifyingKey::from_bytes(&read_key_bytes(path)?).map_err(|e| KeyError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// First 8 bytes of the SHA-256 of the public key, hex encoded.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Signer / verifier
// ---------------------------------------------------------------------------

pub struct Ed25519Signer {
    key: SigningKey,
    signer_id: String,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey, signer_id: impl Into<String>) -> Self {
        Self {
            key,
            signer_id: signer_id.into(),
        }
    }

    pub fn from_file(path: &Path, signer_id: impl Into<String>) -> Result<Self, KeyError> {
        Ok(Self::new(read_secret_key(path)?, signer_id))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl PayloadSigner for Ed25519Signer {
    fn algorithm(&self) -> &str {
        ALGORITHM
    }

    fn signer_id(&self) -> &str {
        &self.signer_id
    }

    fn sign(&self, payload: &[u8]) -> Result<String, SigningError> {
        Ok(BASE64.encode(self.key.sign(payload).to_bytes()))
    }
}

pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn from_file(path: &Path) -> Result<Self, KeyError> {
        Ok(Self::new(read_public_key(path)?))
    }
}

impl SignatureVerifier for Ed25519Verifier {
    /// False for other algorithms, malformed values, and signatures by other keys.
    fn verify(&self, payload: &[u8], signature: &AuditSignature) -> bool {
        if signature.algorithm != ALGORITHM {
            return false;
        }
        let Ok(bytes) = BASE64.decode(&signature.value) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        self.key.verify(payload, &Signature::from_bytes(&bytes)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn signature(value: String) -> AuditSignature {
        AuditSignature {
            algorithm: ALGORITHM.to_string(),
            value,
            signer: "orchestra".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn keypair_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("keys").join("audit");
        let (paths, public) = generate_keypair(&prefix).unwrap();

        assert!(paths.secret.ends_with("audit.secret"));
        assert!(paths.public.ends_with("audit.pub"));
        let secret = read_secret_key(&paths.secret).unwrap();
        assert_eq!(secret.verifying_key(), public);
        assert_eq!(read_public_key(&paths.public).unwrap(), public);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.secret).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(matches!(generate_keypair(&prefix), Err(KeyError::Exists(_))));
    }

    #[test]
    fn rejects_malformed_key_files() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.pub");
        std::fs::write(&bad, "not base64!").unwrap();
        assert!(matches!(read_public_key(&bad), Err(KeyError::Decode { .. })));

        let short = dir.path().join("short.secret");
        std::fs::write(&short, BASE64.encode([1u8; 16])).unwrap();
        assert!(matches!(read_secret_key(&short), Err(KeyError::Length { .. })));

        assert!(matches!(
            read_secret_key(&dir.path().join("missing.secret")),
            Err(KeyError::Io { .. })
        ));
    }

    #[test]
    fn signatures_verify_only_with_matching_key() {
        let signer = Ed25519Signer::new(SigningKey::generate(&mut rand::rngs::OsRng), "orchestra");
        let verifier = Ed25519Verifier::new(signer.verifying_key());
        let payload = br#"{"runId":"r1","stageId":"s1"}"#;

        let value = signer.sign(payload).unwrap();
        assert!(verifier.verify(payload, &signature(value.clone())));
        assert!(!verifier.verify(b"tampered", &signature(value.clone())));

        let other = Ed25519Verifier::new(SigningKey::generate(&mut rand::rngs::OsRng).verifying_key());
        assert!(!other.verify(payload, &signature(value.clone())));

        let mut wrong_algo = signature(value);
        wrong_algo.algorithm = "rsa".into();
        assert!(!verifier.verify(payload, &wrong_algo));
        assert!(!verifier.verify(payload, &signature("AAAA".into())));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let key = SigningKey::from_bytes(&[7u8; 32]).verifying_key();
        let fp = key_fingerprint(&key);
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, key_fingerprint(&key));
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

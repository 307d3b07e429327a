use farm_core::config::SecurityConfig;
use farm_core::{Error, Result, TrustStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::verifier::{sha256_file, SignatureVerifier};

/// The signer of an artifact, as far as the gate is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub fingerprint: String,
    pub subject: Option<String>,
}

impl SigningIdentity {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            subject: None,
        }
    }
}

/// Resolves the signing identity of a file on disk.
pub trait IdentityProbe: Send + Sync {
    fn identity_of(&self, path: &Path) -> Result<SigningIdentity>;
}

/// Decides whether two identities count as the same signer.
pub type TrustComparator = Arc<dyn Fn(&SigningIdentity, &SigningIdentity) -> bool + Send + Sync>;

pub fn fingerprint_comparator() -> TrustComparator {
    Arc::new(|a: &SigningIdentity, b: &SigningIdentity| {
        a.fingerprint.eq_ignore_ascii_case(&b.fingerprint)
    })
}

/// Looks for a detached ed25519 signature at `<path>.sig` over the hex
/// SHA-256 digest of the file.
pub struct DetachedSignatureProbe {
    verifier: SignatureVerifier,
}

impl DetachedSignatureProbe {
    pub fn new(verifier: SignatureVerifier) -> Self {
        Self { verifier }
    }

    fn signature_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".sig");
        PathBuf::from(name)
    }
}

impl IdentityProbe for DetachedSignatureProbe {
    fn identity_of(&self, path: &Path) -> Result<SigningIdentity> {
        let digest = sha256_file(path)?;
        let sig_path = Self::signature_path(path);
        let signature = std::fs::read_to_string(&sig_path).map_err(|e| {
            Error::Security(format!("No signature at {}: {}", sig_path.display(), e))
        })?;
        self.verifier.verify(digest.as_bytes(), &signature)?;
        Ok(SigningIdentity {
            fingerprint: self.verifier.fingerprint(),
            subject: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        })
    }
}

/// Startup trust check of the running binary and its cooperating
/// components. Never fails: mismatches downgrade to `Untrusted`.
pub struct SecurityGate {
    probe: Option<Arc<dyn IdentityProbe>>,
    comparator: TrustComparator,
    pinned: Option<SigningIdentity>,
}

impl SecurityGate {
    pub fn new(
        probe: Arc<dyn IdentityProbe>,
        comparator: TrustComparator,
        pinned: Option<SigningIdentity>,
    ) -> Self {
        Self {
            probe: Some(probe),
            comparator,
            pinned,
        }
    }

    /// A gate with no trust root. Every check yields `Untrusted`.
    pub fn unconfigured() -> Self {
        Self {
            probe: None,
            comparator: fingerprint_comparator(),
            pinned: None,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        let Some(key) = config.public_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            return Self::unconfigured();
        };
        match SignatureVerifier::from_hex(key) {
            Ok(verifier) => Self::new(
                Arc::new(DetachedSignatureProbe::new(verifier)),
                fingerprint_comparator(),
                config.pinned_identity.clone().map(SigningIdentity::new),
            ),
            Err(e) => {
                warn!(error = %e, "Ignoring invalid security.publicKey");
                Self::unconfigured()
            }
        }
    }

    pub fn check(&self, binary: &Path, components: &[PathBuf]) -> TrustStatus {
        let status = self.evaluate(binary, components);
        match &status {
            TrustStatus::Trusted { identity } => {
                info!(binary = %binary.display(), identity = %identity, "Binary identity verified");
            }
            TrustStatus::Untrusted { reason } => {
                warn!(binary = %binary.display(), reason = %reason, "Running in untrusted mode");
            }
            TrustStatus::Unchecked => {}
        }
        status
    }

    fn evaluate(&self, binary: &Path, components: &[PathBuf]) -> TrustStatus {
        let Some(probe) = &self.probe else {
            return untrusted("no trust root configured");
        };

        let own = match probe.identity_of(binary) {
            Ok(id) => id,
            Err(e) => return untrusted(format!("binary: {}", e)),
        };

        let expected = self.pinned.clone().unwrap_or_else(|| own.clone());
        if !(self.comparator)(&expected, &own) {
            return untrusted(format!(
                "binary signed by {} but {} is pinned",
                own.fingerprint, expected.fingerprint
            ));
        }

        for component in components {
            match probe.identity_of(component) {
                Ok(id) if (self.comparator)(&expected, &id) => {}
                Ok(id) => {
                    return untrusted(format!(
                        "{} signed by {}, expected {}",
                        component.display(),
                        id.fingerprint,
                        expected.fingerprint
                    ))
                }
                Err(e) => return untrusted(format!("{}: {}", component.display(), e)),
            }
        }

        TrustStatus::Trusted {
            identity: expected.fingerprint,
        }
    }
}

fn untrusted(reason: impl Into<String>) -> TrustStatus {
    TrustStatus::Untrusted {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct FixedProbe(HashMap<PathBuf, String>);

    impl IdentityProbe for FixedProbe {
        fn identity_of(&self, path: &Path) -> Result<SigningIdentity> {
            self.0
                .get(path)
                .map(|fp| SigningIdentity::new(fp.clone()))
                .ok_or_else(|| Error::Security("unsigned".into()))
        }
    }

    fn gate_with(entries: &[(&str, &str)], pinned: Option<&str>) -> SecurityGate {
        let map = entries
            .iter()
            .map(|(p, fp)| (PathBuf::from(p), fp.to_string()))
            .collect();
        SecurityGate::new(
            Arc::new(FixedProbe(map)),
            fingerprint_comparator(),
            pinned.map(SigningIdentity::new),
        )
    }

    #[test]
    fn test_matching_components_are_trusted() {
        let gate = gate_with(&[("/bin/farmd", "aa"), ("/lib/a.so", "AA")], Some("aa"));
        let status = gate.check(Path::new("/bin/farmd"), &[PathBuf::from("/lib/a.so")]);
        assert_eq!(status, TrustStatus::Trusted { identity: "aa".into() });
    }

    #[test]
    fn test_component_mismatch_downgrades() {
        let gate = gate_with(&[("/bin/farmd", "aa"), ("/lib/a.so", "bb")], None);
        let status = gate.check(Path::new("/bin/farmd"), &[PathBuf::from("/lib/a.so")]);
        assert!(!status.is_trusted());
    }

    #[test]
    fn test_pinned_identity_mismatch_downgrades() {
        let gate = gate_with(&[("/bin/farmd", "aa")], Some("cc"));
        assert!(!gate.check(Path::new("/bin/farmd"), &[]).is_trusted());
    }

    #[test]
    fn test_injected_comparator_decides_policy() {
        let map = [(PathBuf::from("/bin/farmd"), "dev-123".to_string())].into_iter().collect();
        let gate = SecurityGate::new(
            Arc::new(FixedProbe(map)),
            Arc::new(|expected: &SigningIdentity, actual: &SigningIdentity| {
                actual.fingerprint.starts_with(&expected.fingerprint)
            }),
            Some(SigningIdentity::new("dev-")),
        );
        assert!(gate.check(Path::new("/bin/farmd"), &[]).is_trusted());
    }

    #[test]
    fn test_unconfigured_gate_is_untrusted() {
        let status = SecurityGate::unconfigured().check(Path::new("/bin/farmd"), &[]);
        assert!(matches!(status, TrustStatus::Untrusted { .. }));
    }

    #[test]
    fn test_detached_signature_probe() {
        let dir = TempDir::new().unwrap();
        let binary = dir.path().join("farmd");
        std::fs::write(&binary, b"\x7fELF fake binary").unwrap();

        let key = SigningKey::from_bytes(&[9u8; 32]);
        let digest = sha256_file(&binary).unwrap();
        let sig = key.sign(digest.as_bytes());
        std::fs::write(dir.path().join("farmd.sig"), hex::encode(sig.to_bytes())).unwrap();

        let config = SecurityConfig {
            public_key: Some(hex::encode(key.verifying_key().as_bytes())),
            pinned_identity: None,
            components: Vec::new(),
        };
        let gate = SecurityGate::from_config(&config);
        assert!(gate.check(&binary, &[]).is_trusted());

        std::fs::write(&binary, b"\x7fELF modified").unwrap();
        assert!(!gate.check(&binary, &[]).is_trusted());
    }
}

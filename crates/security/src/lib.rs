pub mod gate;
pub mod verifier;

pub use gate::{
    fingerprint_comparator, DetachedSignatureProbe, IdentityProbe, SecurityGate, SigningIdentity,
    TrustComparator,
};
pub use verifier::{sha256_file, sha256_hex, SignatureVerifier};

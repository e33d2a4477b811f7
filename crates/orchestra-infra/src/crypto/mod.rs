//! Audit record signing.
//!
//! Ed25519 implementations of the core `PayloadSigner` and
//! `SignatureVerifier` seams, plus key file generation and loading.

pub mod signing;

pub use signing::{
    Ed25519Signer, Ed25519Verifier, KeyError, KeyPairPaths, generate_keypair, key_fingerprint, read_public_key,
    read_secret_key,
};

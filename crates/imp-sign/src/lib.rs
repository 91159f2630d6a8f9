//! Signing mechanism registry.
//!
//! Three mechanisms are built in and resolved by name: `none` (fixed
//! constant signature, test builds only), `munge` (external credential
//! service — here a keyed-HMAC stand-in, see DESIGN.md), and `curve`
//! (external asymmetric signing service — here an Ed25519 stand-in).
//!
//! The registry is a closed set: `Mechanism` is an enum, not a dynamic
//! plugin table, per the "no runtime plugin loading" design note.

use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use imp_kv::Kv;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("unknown signing mechanism: {0}")]
    UnknownMech(String),
    #[error("mechanism {mech} not initialized: {reason}")]
    NotInitialized { mech: &'static str, reason: String },
    #[error("signature verification failed")]
    SignatureFailure,
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Environment a mechanism's `init`/`prep`/`sign`/`verify` hooks read key
/// material from. Sourced from process environment variables by the
/// caller; kept separate from `imp-config`'s opaque config map so this
/// crate has no dependency on the config format.
#[derive(Debug, Clone, Default)]
pub struct MechEnv {
    /// Shared secret for the `munge` stand-in, read from `IMP_MUNGE_KEY`.
    pub munge_key: Option<String>,
    /// Base64 (standard, padded) Ed25519 signing key seed for the `curve`
    /// stand-in, read from `IMP_CURVE_SECRET_KEY`.
    pub curve_secret_key: Option<String>,
    /// Base64 (standard, padded) Ed25519 verifying key, read from
    /// `IMP_CURVE_PUBLIC_KEY`. Required only for `verify`.
    pub curve_public_key: Option<String>,
}

impl MechEnv {
    /// Build from the current process environment.
    pub fn from_process_env() -> Self {
        Self {
            munge_key: std::env::var("IMP_MUNGE_KEY").ok(),
            curve_secret_key: std::env::var("IMP_CURVE_SECRET_KEY").ok(),
            curve_public_key: std::env::var("IMP_CURVE_PUBLIC_KEY").ok(),
        }
    }
}

/// Trait contract a signing mechanism implements. Mirrors the original C
/// `sign_mech` function-pointer record: `name`, optional `init`/`prep`,
/// required `sign`/`verify`.
pub trait SigningMechanism {
    fn name(&self) -> &'static str;

    /// One-time setup from key material in `env`. Default: no-op.
    fn init(&self, _env: &MechEnv) -> Result<(), SignError> {
        Ok(())
    }

    /// Add mechanism-specific keys to the header before it's serialized.
    /// Default: no-op (the `none` and `munge` mechanisms add nothing).
    fn prep(&self, _header: &mut Kv, _flags: u32) -> Result<(), SignError> {
        Ok(())
    }

    /// Sign `buf` (the concatenated `HEADER.PAYLOAD` bytes, dot included).
    fn sign(&self, buf: &[u8], env: &MechEnv, flags: u32) -> Result<String, SignError>;

    /// Verify `signature` over `buf`.
    fn verify(
        &self,
        header: &Kv,
        buf: &[u8],
        signature: &str,
        env: &MechEnv,
        flags: u32,
    ) -> Result<(), SignError>;
}

/// The `none` mechanism: intended for test builds. Always produces and
/// accepts the same fixed constant signature.
pub struct NoneMechanism;

const NONE_SIGNATURE: &str = "none-signature";

impl SigningMechanism for NoneMechanism {
    fn name(&self) -> &'static str {
        "none"
    }

    fn sign(&self, _buf: &[u8], _env: &MechEnv, _flags: u32) -> Result<String, SignError> {
        Ok(NONE_SIGNATURE.to_string())
    }

    fn verify(
        &self,
        _header: &Kv,
        _buf: &[u8],
        signature: &str,
        _env: &MechEnv,
        _flags: u32,
    ) -> Result<(), SignError> {
        if signature == NONE_SIGNATURE {
            Ok(())
        } else {
            Err(SignError::SignatureFailure)
        }
    }
}

/// The `munge` mechanism: wraps an external authentication service in the
/// original. Here, a deterministic keyed-HMAC-SHA256 stand-in keyed by
/// `IMP_MUNGE_KEY`, encoded as standard-alphabet base64 with padding.
pub struct MungeMechanism;

type HmacSha256 = Hmac<Sha256>;

impl SigningMechanism for MungeMechanism {
    fn name(&self) -> &'static str {
        "munge"
    }

    fn init(&self, env: &MechEnv) -> Result<(), SignError> {
        if env.munge_key.is_none() {
            return Err(SignError::NotInitialized {
                mech: "munge",
                reason: "IMP_MUNGE_KEY not set".to_string(),
            });
        }
        Ok(())
    }

    fn sign(&self, buf: &[u8], env: &MechEnv, _flags: u32) -> Result<String, SignError> {
        let key = env.munge_key.as_deref().ok_or(SignError::NotInitialized {
            mech: "munge",
            reason: "IMP_MUNGE_KEY not set".to_string(),
        })?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| SignError::SigningFailed(e.to_string()))?;
        mac.update(buf);
        let tag = mac.finalize().into_bytes();
        Ok(base64::engine::general_purpose::STANDARD.encode(tag))
    }

    fn verify(
        &self,
        _header: &Kv,
        buf: &[u8],
        signature: &str,
        env: &MechEnv,
        _flags: u32,
    ) -> Result<(), SignError> {
        let key = env.munge_key.as_deref().ok_or(SignError::NotInitialized {
            mech: "munge",
            reason: "IMP_MUNGE_KEY not set".to_string(),
        })?;
        let expected_tag = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| SignError::SignatureFailure)?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| SignError::SigningFailed(e.to_string()))?;
        mac.update(buf);
        mac.verify_slice(&expected_tag)
            .map_err(|_| SignError::SignatureFailure)
    }
}

/// The `curve` mechanism: wraps an external CurveZMQ-style asymmetric
/// service in the original. Here, an Ed25519 signature stand-in keyed by
/// `IMP_CURVE_SECRET_KEY` / `IMP_CURVE_PUBLIC_KEY`.
pub struct CurveMechanism;

impl SigningMechanism for CurveMechanism {
    fn name(&self) -> &'static str {
        "curve"
    }

    fn init(&self, env: &MechEnv) -> Result<(), SignError> {
        if env.curve_secret_key.is_none() && env.curve_public_key.is_none() {
            return Err(SignError::NotInitialized {
                mech: "curve",
                reason: "neither IMP_CURVE_SECRET_KEY nor IMP_CURVE_PUBLIC_KEY set".to_string(),
            });
        }
        Ok(())
    }

    fn sign(&self, buf: &[u8], env: &MechEnv, _flags: u32) -> Result<String, SignError> {
        let seed_b64 = env
            .curve_secret_key
            .as_deref()
            .ok_or(SignError::NotInitialized {
                mech: "curve",
                reason: "IMP_CURVE_SECRET_KEY not set".to_string(),
            })?;
        let seed_bytes = base64::engine::general_purpose::STANDARD
            .decode(seed_b64)
            .map_err(|e| SignError::SigningFailed(e.to_string()))?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| SignError::SigningFailed("curve secret key must be 32 bytes".into()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let sig: Signature = signing_key.sign(buf);
        Ok(base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()))
    }

    fn verify(
        &self,
        _header: &Kv,
        buf: &[u8],
        signature: &str,
        env: &MechEnv,
        _flags: u32,
    ) -> Result<(), SignError> {
        let pub_b64 = env
            .curve_public_key
            .as_deref()
            .ok_or(SignError::NotInitialized {
                mech: "curve",
                reason: "IMP_CURVE_PUBLIC_KEY not set".to_string(),
            })?;
        let pub_bytes = base64::engine::general_purpose::STANDARD
            .decode(pub_b64)
            .map_err(|_| SignError::SignatureFailure)?;
        let pub_arr: [u8; 32] = pub_bytes
            .try_into()
            .map_err(|_| SignError::SignatureFailure)?;
        let verifying_key =
            VerifyingKey::from_bytes(&pub_arr).map_err(|_| SignError::SignatureFailure)?;
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(signature)
            .map_err(|_| SignError::SignatureFailure)?;
        let sig_arr: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignError::SignatureFailure)?;
        let sig = Signature::from_bytes(&sig_arr);
        verifying_key
            .verify(buf, &sig)
            .map_err(|_| SignError::SignatureFailure)
    }
}

/// The closed set of registered mechanisms, resolved by name at the
/// trust boundary (token wrap/unwrap).
pub enum Mechanism {
    None(NoneMechanism),
    Munge(MungeMechanism),
    Curve(CurveMechanism),
}

impl Mechanism {
    /// Resolve a mechanism by its registry name.
    pub fn resolve(name: &str) -> Result<Mechanism, SignError> {
        match name {
            "none" => Ok(Mechanism::None(NoneMechanism)),
            "munge" => Ok(Mechanism::Munge(MungeMechanism)),
            "curve" => Ok(Mechanism::Curve(CurveMechanism)),
            other => Err(SignError::UnknownMech(other.to_string())),
        }
    }

    /// All registry names known at compile time, in a stable order.
    pub const ALL_NAMES: [&'static str; 3] = ["none", "munge", "curve"];
}

impl SigningMechanism for Mechanism {
    fn name(&self) -> &'static str {
        match self {
            Mechanism::None(m) => m.name(),
            Mechanism::Munge(m) => m.name(),
            Mechanism::Curve(m) => m.name(),
        }
    }

    fn init(&self, env: &MechEnv) -> Result<(), SignError> {
        match self {
            Mechanism::None(m) => m.init(env),
            Mechanism::Munge(m) => m.init(env),
            Mechanism::Curve(m) => m.init(env),
        }
    }

    fn prep(&self, header: &mut Kv, flags: u32) -> Result<(), SignError> {
        match self {
            Mechanism::None(m) => m.prep(header, flags),
            Mechanism::Munge(m) => m.prep(header, flags),
            Mechanism::Curve(m) => m.prep(header, flags),
        }
    }

    fn sign(&self, buf: &[u8], env: &MechEnv, flags: u32) -> Result<String, SignError> {
        match self {
            Mechanism::None(m) => m.sign(buf, env, flags),
            Mechanism::Munge(m) => m.sign(buf, env, flags),
            Mechanism::Curve(m) => m.sign(buf, env, flags),
        }
    }

    fn verify(
        &self,
        header: &Kv,
        buf: &[u8],
        signature: &str,
        env: &MechEnv,
        flags: u32,
    ) -> Result<(), SignError> {
        match self {
            Mechanism::None(m) => m.verify(header, buf, signature, env, flags),
            Mechanism::Munge(m) => m.verify(header, buf, signature, env, flags),
            Mechanism::Curve(m) => m.verify(header, buf, signature, env, flags),
        }
    }
}

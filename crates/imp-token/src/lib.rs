//! Signed token envelope codec: `HEADER.PAYLOAD.SIGNATURE`.
//!
//! `wrap` builds a token carrying an arbitrary payload signed on behalf
//! of a userid, using one of the registered mechanisms. `unwrap` reverses
//! the process, optionally enforcing an allow-list of mechanism names.

use base64::Engine as _;
use imp_kv::{Kv, KvValue};
use imp_sign::{MechEnv, Mechanism, SignError, SigningMechanism};
use thiserror::Error;

const TOKEN_VERSION: i64 = 1;

/// `unwrap`/`unwrap_anymech` flag bit: skip `mech.verify` entirely. The
/// only bit `unwrap`'s `flags` accepts; any other bit set is rejected.
pub const NO_VERIFY: u32 = 0x1;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("userid must be non-negative, got {0}")]
    InvalidUserid(i64),
    #[error("flags must be zero, got {0}")]
    InvalidFlags(u32),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Kv(#[from] imp_kv::KvError),
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("base64 decoding failed: {0}")]
    Base64(String),
    #[error("header version {actual} is not the supported version {expected}")]
    VersionMismatch { expected: i64, actual: i64 },
    #[error("mechanism {0:?} is not in the allowed-types list")]
    MechanismDisallowed(String),
}

fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, TokenError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| TokenError::Base64(e.to_string()))
}

/// Build a signed token for `payload`, attributed to `userid`, using the
/// named `mechanism`. `flags` is reserved and must currently be zero.
pub fn wrap(
    userid: i64,
    payload: &[u8],
    mechanism: &str,
    env: &MechEnv,
    flags: u32,
) -> Result<String, TokenError> {
    if userid < 0 {
        return Err(TokenError::InvalidUserid(userid));
    }
    if flags != 0 {
        return Err(TokenError::InvalidFlags(flags));
    }

    let mech = Mechanism::resolve(mechanism)?;
    mech.init(env)?;

    let mut header = Kv::new();
    header.put("version", KvValue::Int64(TOKEN_VERSION));
    header.put("mechanism", KvValue::Str(mech.name().to_string()));
    header.put("userid", KvValue::Int64(userid));
    mech.prep(&mut header, flags)?;

    let header_b64 = b64_encode(&header.encode());
    let payload_b64 = b64_encode(payload);

    let mut buf = String::with_capacity(header_b64.len() + payload_b64.len() + 1);
    buf.push_str(&header_b64);
    buf.push('.');
    buf.push_str(&payload_b64);

    let signature = mech.sign(buf.as_bytes(), env, flags)?;

    buf.push('.');
    buf.push_str(&signature);
    Ok(buf)
}

/// Convenience wrapper over [`wrap`] using the default registered
/// mechanism for the current process identity. Flags are always zero.
pub fn wrap_default(
    userid: i64,
    payload: &[u8],
    default_mechanism: &str,
    env: &MechEnv,
) -> Result<String, TokenError> {
    wrap(userid, payload, default_mechanism, env, 0)
}

/// Result of a successful [`unwrap`]: the signer's claimed userid, the
/// recovered payload, and the mechanism name that produced the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub userid: i64,
    pub payload: Vec<u8>,
    pub mechanism: String,
}

fn split_token(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.splitn(3, '.');
    let header = parts
        .next()
        .ok_or_else(|| TokenError::Malformed("missing header".into()))?;
    let payload = parts
        .next()
        .ok_or_else(|| TokenError::Malformed("missing payload".into()))?;
    let signature = parts
        .next()
        .ok_or_else(|| TokenError::Malformed("missing signature".into()))?;
    Ok((header, payload, signature))
}

fn unwrap_impl(
    token: &str,
    mech_type: Option<&str>,
    env: &MechEnv,
    flags: u32,
    allowed_types: Option<&[String]>,
) -> Result<Unwrapped, TokenError> {
    if flags & !NO_VERIFY != 0 {
        return Err(TokenError::InvalidFlags(flags));
    }

    let (header_b64, payload_b64, signature) = split_token(token)?;
    let header_bytes = b64_decode(header_b64)?;
    let header =
        Kv::decode(&header_bytes).map_err(|e| TokenError::Malformed(e.to_string()))?;

    let version = header
        .get_int64("version")
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    if version != TOKEN_VERSION {
        return Err(TokenError::VersionMismatch {
            expected: TOKEN_VERSION,
            actual: version,
        });
    }

    let mechanism_name = header
        .get_str("mechanism")
        .map_err(|e| TokenError::Malformed(e.to_string()))?
        .to_string();

    if let Some(allowed) = allowed_types {
        if !allowed.iter().any(|m| m == &mechanism_name) {
            return Err(TokenError::MechanismDisallowed(mechanism_name));
        }
    }
    if let Some(expected) = mech_type {
        if expected != mechanism_name {
            return Err(TokenError::MechanismDisallowed(mechanism_name));
        }
    }

    let mech = Mechanism::resolve(&mechanism_name)?;

    let mut buf = String::with_capacity(header_b64.len() + payload_b64.len() + 1);
    buf.push_str(header_b64);
    buf.push('.');
    buf.push_str(payload_b64);

    if flags & NO_VERIFY == 0 {
        mech.verify(&header, buf.as_bytes(), signature, env, flags)?;
    }

    let userid = header
        .get_int64("userid")
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    let payload = b64_decode(payload_b64)?;

    Ok(Unwrapped {
        userid,
        payload,
        mechanism: mechanism_name,
    })
}

/// Unwrap a token produced by a specific `mech_type`, without consulting
/// an allow-list. Mirrors `flux_sign_unwrap_anymech`: used only when the
/// caller already trusts the mechanism (e.g. the privileged side, which
/// already picked the mechanism it expects from its own configuration).
pub fn unwrap_anymech(
    token: &str,
    mech_type: &str,
    env: &MechEnv,
    flags: u32,
) -> Result<Unwrapped, TokenError> {
    unwrap_impl(token, Some(mech_type), env, flags, None)
}

/// Unwrap a token at a trust boundary, checking the embedded mechanism
/// name against `allowed_types`. Mirrors `flux_sign_unwrap`.
pub fn unwrap(
    token: &str,
    env: &MechEnv,
    flags: u32,
    allowed_types: &[String],
) -> Result<Unwrapped, TokenError> {
    unwrap_impl(token, None, env, flags, Some(allowed_types))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn none_env() -> MechEnv {
        MechEnv::default()
    }

    #[test]
    fn round_trip_with_none_mechanism() {
        let env = none_env();
        let token = wrap(1000, b"hello world", "none", &env, 0).unwrap();
        let out = unwrap(&token, &env, 0, &["none".to_string()]).unwrap();
        assert_eq!(out.userid, 1000);
        assert_eq!(out.payload, b"hello world");
        assert_eq!(out.mechanism, "none");
    }

    #[test]
    fn round_trip_with_munge_mechanism() {
        let env = MechEnv {
            munge_key: Some("secret-shared-key".to_string()),
            ..Default::default()
        };
        let token = wrap(42, b"payload-bytes", "munge", &env, 0).unwrap();
        let out = unwrap(&token, &env, 0, &["munge".to_string()]).unwrap();
        assert_eq!(out.userid, 42);
        assert_eq!(out.payload, b"payload-bytes");
    }

    #[test]
    fn negative_userid_rejected() {
        let env = none_env();
        assert!(matches!(
            wrap(-1, b"x", "none", &env, 0),
            Err(TokenError::InvalidUserid(-1))
        ));
    }

    #[test]
    fn nonzero_flags_rejected() {
        let env = none_env();
        assert!(matches!(
            wrap(1, b"x", "none", &env, 1),
            Err(TokenError::InvalidFlags(1))
        ));
    }

    #[test]
    fn unknown_mechanism_rejected_on_wrap() {
        let env = none_env();
        assert!(wrap(1, b"x", "rot13", &env, 0).is_err());
    }

    #[test]
    fn disallowed_mechanism_rejected_on_unwrap() {
        let env = none_env();
        let token = wrap(1, b"x", "none", &env, 0).unwrap();
        let result = unwrap(&token, &env, 0, &["munge".to_string()]);
        assert!(matches!(
            result,
            Err(TokenError::MechanismDisallowed(ref m)) if m == "none"
        ));
    }

    #[test]
    fn tampered_signature_rejected() {
        let env = none_env();
        let mut token = wrap(1, b"x", "none", &env, 0).unwrap();
        token.push_str("garbage");
        assert!(unwrap(&token, &env, 0, &["none".to_string()]).is_err());
    }

    #[test]
    fn tampered_payload_rejected_under_munge() {
        let env = MechEnv {
            munge_key: Some("k".to_string()),
            ..Default::default()
        };
        let token = wrap(7, b"original", "munge", &env, 0).unwrap();
        let (header, _payload, sig) = split_token(&token).unwrap();
        let tampered = format!("{header}.{}.{sig}", b64_encode(b"forged"));
        assert!(unwrap(&tampered, &env, 0, &["munge".to_string()]).is_err());
    }

    #[test]
    fn malformed_token_missing_parts_rejected() {
        let env = none_env();
        assert!(unwrap("only-one-part", &env, 0, &["none".to_string()]).is_err());
    }

    #[test]
    fn wrapping_is_deterministic_for_none_mechanism() {
        let env = none_env();
        let a = wrap(5, b"same", "none", &env, 0).unwrap();
        let b = wrap(5, b"same", "none", &env, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unwrap_anymech_bypasses_allow_list() {
        let env = none_env();
        let token = wrap(1, b"x", "none", &env, 0).unwrap();
        assert!(unwrap_anymech(&token, "none", &env, 0).is_ok());
    }

    #[test]
    fn no_verify_flag_skips_signature_check() {
        let env = none_env();
        let mut token = wrap(1, b"x", "none", &env, 0).unwrap();
        token.push_str("garbage");
        // Tampered signature would normally fail...
        assert!(unwrap(&token, &env, 0, &["none".to_string()]).is_err());
        // ...but NO_VERIFY accepts it without checking.
        let out = unwrap(&token, &env, NO_VERIFY, &["none".to_string()]).unwrap();
        assert_eq!(out.userid, 1);
    }

    #[test]
    fn unknown_flag_bits_rejected() {
        let env = none_env();
        let token = wrap(1, b"x", "none", &env, 0).unwrap();
        assert!(matches!(
            unwrap(&token, &env, 0x2, &["none".to_string()]),
            Err(TokenError::InvalidFlags(0x2))
        ));
    }

    #[test]
    fn version_mismatch_detected() {
        let env = none_env();
        let mut header = Kv::new();
        header.put("version", KvValue::Int64(99));
        header.put("mechanism", KvValue::Str("none".to_string()));
        header.put("userid", KvValue::Int64(1));
        let header_b64 = b64_encode(&header.encode());
        let payload_b64 = b64_encode(b"x");
        let buf = format!("{header_b64}.{payload_b64}");
        let sig = Mechanism::resolve("none")
            .unwrap()
            .sign(buf.as_bytes(), &env, 0)
            .unwrap();
        let token = format!("{buf}.{sig}");
        assert!(matches!(
            unwrap(&token, &env, 0, &["none".to_string()]),
            Err(TokenError::VersionMismatch { .. })
        ));
    }
}

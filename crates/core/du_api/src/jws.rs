use crate::error::ParseError;
use crate::error::VerifyError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use rsa::sha2::Digest;
use rsa::sha2::Sha256;
use rsa::BigUint;
use rsa::Pkcs1v15Sign;
use rsa::RsaPublicKey;
use serde_json::Value;
use std::collections::HashMap;

/// Root signing keys pinned into the agent.
///
/// A deployment signature is only trusted when its signing-key chain
/// terminates at one of these. Keys are `(kid, modulus, exponent)` with the
/// integers base64url encoded, big endian.
const BUILTIN_ROOT_KEYS: &[(&str, &str, &str)] = &[(
    "DU.202506.R1",
    "iZwFjdn-SxbiizfxlHy66gH9CEJWkUFZCDdzi49ilsB9RNVH_jTvxImGaSgZKOi3mD7YGPmL4vAQd0m4w0CHGsJGXueOv-LgJwuCvv72dp4rQFOpsbfvFd57ycgCZRB9cEo1eH4dcPIYNsaUclKJrmYNa_aFpUsPWkrV7-UEzEUMSxn_5aflBHrhvrdXDgJ3m-GOXJuAUaRG9wQ1ChLVkgyOOUAtiUA-Hv56MJeKhTtCqQERIMiO2AHQ0qqncttq8PykbbMfC2YHrKNHNRrDKGUH9gj8Uoh8GlM8DNFmQGy4TOGFbRObcaAv1upGYCaUMfoqFyRRBsWigX053cTY3w",
    "AQAB",
)];

/// The set of root keys a signing-key chain may terminate at.
#[derive(Debug, Default)]
pub struct RootKeyStore {
    keys: HashMap<String, RsaPublicKey>,
}

impl RootKeyStore {
    /// The store holding the keys built into the agent.
    pub fn trusted() -> Self {
        let mut store = RootKeyStore::default();
        for (kid, n, e) in BUILTIN_ROOT_KEYS {
            store
                .insert(kid, n, e)
                .expect("builtin root keys are well formed");
        }
        store
    }

    pub fn empty() -> Self {
        RootKeyStore::default()
    }

    /// Add a trusted root, e.g. a test root injected by the suite.
    pub fn insert(&mut self, kid: &str, n: &str, e: &str) -> Result<(), VerifyError> {
        let key = rsa_key(n, e)?;
        self.keys.insert(kid.to_string(), key);
        Ok(())
    }

    fn get(&self, kid: &str) -> Option<&RsaPublicKey> {
        self.keys.get(kid)
    }
}

/// A parsed compact JWS: `base64url(header).base64url(payload).base64url(sig)`.
struct CompactJws {
    header: Value,
    payload: Vec<u8>,
    signature: Vec<u8>,
    signing_input: String,
}

impl CompactJws {
    fn parse(token: &str) -> Result<Self, VerifyError> {
        let mut sections = token.split('.');
        let (header, payload, signature) = match (
            sections.next(),
            sections.next(),
            sections.next(),
            sections.next(),
        ) {
            (Some(header), Some(payload), Some(signature), None) => (header, payload, signature),
            _ => {
                return Err(VerifyError::signature_invalid(
                    "not a three-section compact JWS",
                ))
            }
        };

        let header_bytes = decode_section(header)?;
        let header_json: Value = serde_json::from_slice(&header_bytes)
            .map_err(|_| VerifyError::signature_invalid("the JWS header is not JSON"))?;

        Ok(CompactJws {
            header: header_json,
            payload: decode_section(payload)?,
            signature: decode_section(signature)?,
            signing_input: format!("{header}.{payload}"),
        })
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.header.get(name).and_then(Value::as_str)
    }

    fn check_alg(&self) -> Result<(), VerifyError> {
        match self.header_str("alg") {
            Some("RS256") => Ok(()),
            Some(other) => Err(VerifyError::signature_invalid(format!(
                "unsupported signature algorithm {other:?}"
            ))),
            None => Err(VerifyError::signature_invalid("no signature algorithm")),
        }
    }
}

fn decode_section(section: &str) -> Result<Vec<u8>, VerifyError> {
    BASE64_URL
        .decode(section)
        .map_err(|_| VerifyError::signature_invalid("a JWS section is not base64url"))
}

fn rsa_key(n: &str, e: &str) -> Result<RsaPublicKey, VerifyError> {
    let n = BigUint::from_bytes_be(&decode_section(n)?);
    let e = BigUint::from_bytes_be(&decode_section(e)?);
    RsaPublicKey::new(n, e)
        .map_err(|err| VerifyError::signature_invalid(format!("invalid RSA key: {err}")))
}

fn key_from_jwk(jwk: &Value) -> Result<RsaPublicKey, VerifyError> {
    match jwk.get("kty").and_then(Value::as_str) {
        Some("RSA") => (),
        _ => return Err(VerifyError::signature_invalid("the signing key is not RSA")),
    }
    if let Some(alg) = jwk.get("alg").and_then(Value::as_str) {
        if alg != "RS256" {
            return Err(VerifyError::signature_invalid(format!(
                "unsupported signing key algorithm {alg:?}"
            )));
        }
    }
    let n = jwk
        .get("n")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::signature_invalid("the signing key has no modulus"))?;
    let e = jwk
        .get("e")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::signature_invalid("the signing key has no exponent"))?;
    rsa_key(n, e)
}

fn verify_rs256(
    key: &RsaPublicKey,
    signing_input: &str,
    signature: &[u8],
) -> Result<(), VerifyError> {
    let digest = Sha256::digest(signing_input.as_bytes());
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| VerifyError::signature_invalid("the signature does not verify"))
}

/// Validate the detached signature over the raw `update_manifest` string.
///
/// Three checks, in order:
/// 1. the signing-key chain carried in the outer header (`sjwk`) terminates
///    at a pinned root key, identified by the inner header's `kid`;
/// 2. the outer signature verifies under the chained signing key;
/// 3. the outer payload declares `{hash, alg}` and the recomputed digest of
///    the raw manifest string matches.
pub fn verify_manifest(
    store: &RootKeyStore,
    manifest: &str,
    signature: &str,
) -> Result<(), VerifyError> {
    let outer = CompactJws::parse(signature)?;
    outer.check_alg()?;

    let chain_token = outer
        .header_str("sjwk")
        .ok_or_else(|| VerifyError::signature_invalid("no signing-key chain in the header"))?;
    let chain = CompactJws::parse(chain_token)?;
    chain.check_alg()?;

    let kid = chain
        .header_str("kid")
        .ok_or_else(|| VerifyError::signature_invalid("the signing-key chain names no root"))?;
    let root = store.get(kid).ok_or_else(|| {
        VerifyError::signature_invalid(format!(
            "the signing-key chain terminates at the unknown root {kid:?}"
        ))
    })?;
    verify_rs256(root, &chain.signing_input, &chain.signature)?;

    let signing_jwk: Value = serde_json::from_slice(&chain.payload)
        .map_err(|_| VerifyError::signature_invalid("the chained signing key is not JSON"))?;
    let signing_key = key_from_jwk(&signing_jwk)?;
    verify_rs256(&signing_key, &outer.signing_input, &outer.signature)?;

    check_manifest_hash(manifest, &outer.payload)
}

fn check_manifest_hash(manifest: &str, declared: &[u8]) -> Result<(), VerifyError> {
    let declaration: Value = serde_json::from_slice(declared)
        .map_err(|_| ParseError::bad_format("the signed hash declaration is not JSON"))?;
    let declared_hash = declaration
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::bad_format("the signed hash declaration carries no hash"))?;
    match declaration.get("alg").and_then(Value::as_str) {
        None | Some("sha256") => (),
        Some(other) => {
            return Err(
                ParseError::bad_format(format!("unsupported manifest hash algorithm {other:?}"))
                    .into(),
            )
        }
    }

    let actual = BASE64.encode(Sha256::digest(manifest.as_bytes()));
    if actual != declared_hash {
        return Err(VerifyError::ManifestHashMismatch);
    }
    Ok(())
}

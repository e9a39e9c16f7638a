//! Signs update manifests the way the cloud control plane does, using
//! throwaway keys committed as fixtures. Tests inject the matching root into
//! the agent's key store and can then produce envelopes that verify, or
//! deliberately broken variants.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::sha2::Digest;
use rsa::sha2::Sha256;
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Sign;
use rsa::RsaPrivateKey;
use serde_json::json;
use serde_json::Value;

const ROOT_KEY_PEM: &str = include_str!("../fixtures/root_key.pem");
const SIGNING_KEY_PEM: &str = include_str!("../fixtures/signing_key.pem");
const DEFAULT_ROOT_KID: &str = "TEST.ROOT.R1";

pub struct ManifestSigner {
    root_kid: String,
    root_key: RsaPrivateKey,
    signing_key: RsaPrivateKey,
}

impl ManifestSigner {
    pub fn new() -> Self {
        Self::with_root_kid(DEFAULT_ROOT_KID)
    }

    pub fn with_root_kid(root_kid: &str) -> Self {
        ManifestSigner {
            root_kid: root_kid.to_string(),
            root_key: private_key(ROOT_KEY_PEM),
            signing_key: private_key(SIGNING_KEY_PEM),
        }
    }

    /// A signer whose chain names the default root but is signed by the
    /// wrong key, for negative tests.
    pub fn with_swapped_keys() -> Self {
        ManifestSigner {
            root_kid: DEFAULT_ROOT_KID.to_string(),
            root_key: private_key(SIGNING_KEY_PEM),
            signing_key: private_key(ROOT_KEY_PEM),
        }
    }

    pub fn root_kid(&self) -> &str {
        &self.root_kid
    }

    pub fn root_modulus_base64url(&self) -> String {
        BASE64_URL.encode(private_key(ROOT_KEY_PEM).n().to_bytes_be())
    }

    pub fn root_exponent_base64url(&self) -> String {
        BASE64_URL.encode(private_key(ROOT_KEY_PEM).e().to_bytes_be())
    }

    /// Produce the detached compact JWS over a serialized manifest: the
    /// payload declares the manifest digest and the header chains the
    /// signing key back to the root.
    pub fn sign(&self, manifest: &str) -> String {
        let digest = BASE64.encode(Sha256::digest(manifest.as_bytes()));
        self.sign_hash_declaration(&json!({"hash": digest, "alg": "sha256"}))
    }

    /// Sign an arbitrary hash declaration, for tests tampering with it.
    pub fn sign_hash_declaration(&self, declaration: &Value) -> String {
        let signing_jwk = json!({
            "kty": "RSA",
            "alg": "RS256",
            "n": BASE64_URL.encode(self.signing_key.n().to_bytes_be()),
            "e": BASE64_URL.encode(self.signing_key.e().to_bytes_be()),
        });
        let chain = sign_token(
            &self.root_key,
            &json!({"alg": "RS256", "kid": self.root_kid}),
            signing_jwk.to_string().as_bytes(),
        );
        sign_token(
            &self.signing_key,
            &json!({"alg": "RS256", "sjwk": chain}),
            declaration.to_string().as_bytes(),
        )
    }

    /// Wrap a manifest into a complete deployment envelope value.
    pub fn envelope(&self, action: u64, workflow_id: &str, manifest: &Value) -> Value {
        let manifest = manifest.to_string();
        let signature = self.sign(&manifest);
        json!({
            "workflow": {"action": action, "id": workflow_id},
            "updateManifest": manifest,
            "updateManifestSignature": signature,
            "fileUrls": {},
        })
    }
}

impl Default for ManifestSigner {
    fn default() -> Self {
        ManifestSigner::new()
    }
}

fn private_key(pem: &str) -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(pem).expect("the fixture keys are valid PKCS#8")
}

fn sign_token(key: &RsaPrivateKey, header: &Value, payload: &[u8]) -> String {
    let signing_input = format!(
        "{}.{}",
        BASE64_URL.encode(header.to_string().as_bytes()),
        BASE64_URL.encode(payload)
    );
    let digest = Sha256::digest(signing_input.as_bytes());
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .expect("signing with the fixture keys succeeds");
    format!("{signing_input}.{}", BASE64_URL.encode(signature))
}

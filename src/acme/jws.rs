//! JWS construction per [RFC 8555 §6.2] and [RFC 7515 §5.1].
//!
//! [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
//! [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{acme::key::AcmeKey, util::base64url, Error, Result};

/// JWS protected header.
///
/// newAccount requests (and revokeCert requests authenticated by the
/// certificate key) carry a `jwk` field; every other request is signed by an
/// existing account and carries `kid` instead.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct ProtectedHeader {
    alg: String,
    nonce: String,
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl From<&AcmeKey> for Jwk {
    fn from(key: &AcmeKey) -> Self {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        // uncompressed points always carry both coordinates
        let x = point.x().expect("uncompressed point");
        let y = point.y().expect("uncompressed point");

        Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: base64url(&x),
            y: base64url(&y),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(jwk: &Jwk) -> Self {
        JwkThumb {
            crv: jwk.crv.clone(),
            kty: jwk.kty.clone(),
            x: jwk.x.clone(),
            y: jwk.y.clone(),
        }
    }
}

/// Flattened JSON serialization of a JWS.
///
/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Sign `payload` under `protected` with the key's ES256 signer.
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: ProtectedHeader,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let header = {
        let json = serde_json::to_string(&protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(json)
    };

    let payload = {
        let json = serde_json::to_string(payload)?;

        // POST-as-GET requests carry a truly empty payload, which must not be
        // base64url encoded.
        if json == "\"\"" {
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(json)
        }
    };

    let to_sign = format!("{header}.{payload}");
    let (signature, _rec_id) = key
        .signing_key()
        .sign_recoverable(to_sign.as_bytes())
        .map_err(|err| Error::Other(format!("signing failure: {err}")))?;

    let signature = BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes());

    let jws = FlattenedJws {
        protected: header,
        payload,
        signature,
    };

    Ok(serde_json::to_string(&jws)?)
}

/// Key authorization for a challenge token; the DNS-01 form is additionally
/// SHA-256 hashed before encoding. See [RFC 8555 §8.1].
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
pub(crate) fn key_authorization(token: &str, key: &AcmeKey, dns: bool) -> Result<String> {
    let jwk = Jwk::from(key);
    let jwk_thumb = JwkThumb::from(&jwk);
    let jwk_json = serde_json::to_string(&jwk_thumb)?;

    let digest = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(jwk_json));
    let key_auth = format!("{token}.{digest}");

    Ok(if dns {
        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth))
    } else {
        key_auth
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_proof_differs_from_http_proof() {
        let key = AcmeKey::generate();
        let http = key_authorization("token", &key, false).unwrap();
        let dns = key_authorization("token", &key, true).unwrap();
        assert_ne!(http, dns);
        assert!(http.starts_with("token."));
        // base64url of a SHA-256 digest
        assert_eq!(dns.len(), 43);
    }

    #[test]
    fn signed_body_has_three_parts() {
        let key = AcmeKey::generate();
        let protected =
            ProtectedHeader::new_jwk(Jwk::from(&key), "https://ca.test/acct", "nonce-1".into());
        let body = sign(protected, &key, &crate::acme::api::EmptyObject).unwrap();

        let parsed: FlattenedJws = serde_json::from_str(&body).unwrap();
        assert!(!parsed.protected.is_empty());
        assert!(!parsed.payload.is_empty());
        assert!(!parsed.signature.is_empty());
    }

    #[test]
    fn post_as_get_payload_is_empty() {
        let key = AcmeKey::generate();
        let protected =
            ProtectedHeader::new_kid("https://ca.test/acct/1", "https://ca.test/order", "n".into());
        let body = sign(protected, &key, &crate::acme::api::EmptyString).unwrap();

        let parsed: FlattenedJws = serde_json::from_str(&body).unwrap();
        assert!(parsed.payload.is_empty());
    }
}

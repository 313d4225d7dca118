//! Key material, CSR handling and certificate parsing.

use der::{
    asn1::Ia5String,
    oid::{AssociatedOid as _, ObjectIdentifier},
    Decode as _, DecodePem as _, Encode as _,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use time::{OffsetDateTime, PrimitiveDateTime};
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::{CertReq, ExtensionReq},
};

use crate::{util::hex, Error, Result};

const CN_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

const SUPPORTED_RSA_BITS: [u32; 3] = [2048, 3072, 4096];

/// Parameters for internally generated certificate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum KeyParams {
    EcdsaP256,
    Rsa { bits: u32 },
}

impl KeyParams {
    /// Validate before any network call or DNS record is placed.
    ///
    /// Generation supports ECDSA P-256. RSA subjects must bring their own
    /// CSR; a size outside the CA-accepted set is flagged separately so the
    /// caller can tell a typo from a policy gap.
    pub fn validate(&self) -> Result<()> {
        match self {
            KeyParams::EcdsaP256 => Ok(()),
            KeyParams::Rsa { bits } if !SUPPORTED_RSA_BITS.contains(bits) => Err(
                Error::Validation(format!("unsupported RSA key size: {bits}")),
            ),
            KeyParams::Rsa { .. } => Err(Error::Validation(
                "RSA key generation is not supported; supply an externally created CSR".to_owned(),
            )),
        }
    }
}

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Creates a CSR for `domains` signed by `signer`.
///
/// The first domain becomes the Common Name; every domain lands in the
/// Subject Alternative Name extension.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    domains: &[String],
) -> Result<CertReq> {
    let primary = domains
        .first()
        .ok_or_else(|| Error::validation("no domains for CSR"))?;
    let subject = format!("CN={primary}")
        .parse::<Name>()
        .map_err(|err| Error::Validation(format!("bad subject name: {err}")))?;

    let mut csr = CsrBuilder::new(subject, signer)
        .map_err(|err| Error::Other(format!("CSR builder: {err}")))?;

    let san = SubjectAltName(
        domains
            .iter()
            .map(|domain| {
                Ia5String::new(domain)
                    .map(GeneralName::DnsName)
                    .map_err(|err| Error::Validation(format!("bad domain {domain}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?,
    );
    csr.add_extension(&san)
        .map_err(|err| Error::Other(format!("CSR extension: {err}")))?;

    csr.build::<p256::ecdsa::DerSignature>()
        .map_err(|err| Error::Other(format!("CSR build: {err}")))
}

pub(crate) fn csr_to_der(csr: &CertReq) -> Result<Vec<u8>> {
    csr.to_der()
        .map_err(|err| Error::Other(format!("CSR encode: {err}")))
}

pub(crate) fn csr_from_pem(pem: &str) -> Result<CertReq> {
    CertReq::from_pem(pem).map_err(|err| Error::Validation(format!("cannot parse CSR: {err}")))
}

/// The names a CSR covers. The SAN set is authoritative; the CN is only
/// consulted when no SAN extension is present.
pub(crate) fn csr_names(csr: &CertReq) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for attr in csr.info.attributes.iter() {
        if attr.oid != ExtensionReq::OID {
            continue;
        }
        for value in attr.values.iter() {
            let ext_req: ExtensionReq = value
                .decode_as()
                .map_err(|err| Error::Validation(format!("bad extensionRequest: {err}")))?;
            for ext in ext_req.0 {
                if ext.extn_id != SubjectAltName::OID {
                    continue;
                }
                let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                    .map_err(|err| Error::Validation(format!("bad SAN in CSR: {err}")))?;
                for name in san.0 {
                    if let GeneralName::DnsName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
    }

    if names.is_empty() {
        if let Some(cn) = common_name(&csr.info.subject) {
            names.push(cn);
        }
    }

    if names.is_empty() {
        return Err(Error::validation("CSR carries no DNS names"));
    }

    Ok(names)
}

fn common_name(name: &Name) -> Option<String> {
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == CN_OID {
                return Some(String::from_utf8_lossy(atv.value.value()).into_owned());
            }
        }
    }
    None
}

/// Metadata extracted from an issued end-entity certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CertificateParts {
    pub subjects: Vec<String>,
    pub serial: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub fingerprint_sha256: String,
}

/// Parse a PEM chain and describe its end-entity (first) certificate.
pub(crate) fn parse_chain_pem(chain_pem: &str) -> Result<CertificateParts> {
    let mut rdr = std::io::BufReader::new(std::io::Cursor::new(chain_pem));
    let ders = rustls_pemfile::certs(&mut rdr)
        .map(|res| res.map(|cert| cert.to_vec()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| Error::Other(format!("cannot parse certificate chain: {err}")))?;

    let ee = ders
        .first()
        .ok_or_else(|| Error::Other("no certificates in chain".to_owned()))?;

    parse_certificate_der(ee)
}

pub(crate) fn parse_certificate_der(der_bytes: &[u8]) -> Result<CertificateParts> {
    let cert = x509_cert::Certificate::from_der(der_bytes)
        .map_err(|err| Error::Other(format!("cannot parse certificate: {err}")))?;

    let tbs = &cert.tbs_certificate;

    let mut subjects = Vec::new();
    if let Some(cn) = common_name(&tbs.subject) {
        subjects.push(cn);
    }
    if let Some(extensions) = &tbs.extensions {
        for ext in extensions {
            if ext.extn_id != SubjectAltName::OID {
                continue;
            }
            let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                .map_err(|err| Error::Other(format!("bad SAN: {err}")))?;
            for name in san.0 {
                if let GeneralName::DnsName(dns) = name {
                    let dns = dns.to_string();
                    if !subjects.contains(&dns) {
                        subjects.push(dns);
                    }
                }
            }
        }
    }

    let not_before = to_offset(tbs.validity.not_before.to_date_time())?;
    let not_after = to_offset(tbs.validity.not_after.to_date_time())?;

    Ok(CertificateParts {
        subjects,
        serial: hex(tbs.serial_number.as_bytes()),
        not_before,
        not_after,
        fingerprint_sha256: hex(&Sha256::digest(der_bytes)),
    })
}

/// The first (end-entity) certificate of a PEM chain as DER, for revocation
/// requests.
pub(crate) fn first_der_of_chain(chain_pem: &str) -> Result<Vec<u8>> {
    let mut rdr = std::io::BufReader::new(std::io::Cursor::new(chain_pem));
    let result = rustls_pemfile::certs(&mut rdr)
        .next()
        .transpose()
        .map_err(|err| Error::Other(format!("cannot parse certificate chain: {err}")))?
        .map(|cert| cert.to_vec())
        .ok_or_else(|| Error::Other("no certificates in chain".to_owned()));
    result
}

fn to_offset(dt: der::DateTime) -> Result<OffsetDateTime> {
    // validity times are UTC by construction
    PrimitiveDateTime::try_from(dt)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| Error::Other(format!("bad certificate time: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdsa_params_validate() {
        KeyParams::EcdsaP256.validate().unwrap();
    }

    #[test]
    fn unsupported_rsa_size_is_a_validation_error() {
        let err = KeyParams::Rsa { bits: 1024 }.validate().unwrap_err();
        match err {
            Error::Validation(reason) => assert!(reason.contains("1024")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn rsa_generation_points_at_csr_path() {
        let err = KeyParams::Rsa { bits: 2048 }.validate().unwrap_err();
        assert!(err.to_string().contains("CSR"));
    }

    #[test]
    fn csr_roundtrip_preserves_san_set() {
        let key = create_p256_key();
        let domains = vec!["a.example.com".to_owned(), "b.example.com".to_owned()];
        let csr = create_csr(&key, &domains).unwrap();

        let names = csr_names(&csr).unwrap();
        assert_eq!(names, domains);
    }

    #[test]
    fn issued_chain_parses_to_metadata() {
        let chain = crate::test::issued_chain_pem();
        let parts = parse_chain_pem(chain).unwrap();

        assert!(parts.subjects.contains(&"a.example.com".to_owned()));
        assert_eq!(parts.fingerprint_sha256.len(), 64);
        assert!(parts.not_after > parts.not_before);
        assert!(!parts.serial.is_empty());
    }
}

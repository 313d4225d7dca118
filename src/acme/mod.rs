//! ACME protocol client.
//!
//! Speaks [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) against a
//! CA directory: account management, orders, authorizations, challenges,
//! finalize, download and revocation. The orchestrator composes these calls
//! into the issuance state machine; nothing in this module touches DNS or the
//! vault.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use base64::prelude::*;

use crate::{Error, Result};

pub mod api;

mod jws;
mod key;
mod transport;

pub(crate) use self::key::AcmeKey;
use self::transport::{expect_header, handle_problem, req_get, NoncePool, Transport};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory. Not appropriate for testing or
    /// development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory. Issued certificates do not chain
    /// to a trusted root.
    LetsEncryptStaging,

    /// An arbitrary directory URL.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Entry point for one CA endpoint.
pub struct AcmeClient {
    http: reqwest::Client,
    api_directory: api::Directory,
    nonce_pool: Arc<NoncePool>,
}

impl AcmeClient {
    /// Fetch the directory document and set up nonce handling.
    pub async fn connect(url: DirectoryUrl<'_>) -> Result<AcmeClient> {
        let http = reqwest::Client::new();
        let res = handle_problem(req_get(&http, url.to_url()).await?)
            .await
            .map_err(Error::from)?;
        let api_directory = res.json::<api::Directory>().await?;
        let nonce_pool = Arc::new(NoncePool::new(http.clone(), &api_directory.new_nonce));

        Ok(AcmeClient {
            http,
            api_directory,
            nonce_pool,
        })
    }

    /// Issuance profiles advertised by the CA, if any.
    pub fn profiles(&self) -> Option<&BTreeMap<String, String>> {
        self.api_directory.meta.as_ref()?.profiles.as_ref()
    }

    /// Returns a reference to the directory's API object.
    ///
    /// Useful for debugging.
    pub fn api_directory(&self) -> &api::Directory {
        &self.api_directory
    }

    /// Register or look up the account for `key`.
    ///
    /// Idempotent: the server returns the existing account (200 with the
    /// `Location` header set to the key ID) when the key is already
    /// registered, and creates one otherwise.
    pub(crate) async fn ensure_account(
        &self,
        acme_key: AcmeKey,
        contact: &[String],
        tos_agreed: bool,
    ) -> Result<AcmeAccount> {
        let acc = api::Account {
            contact: if contact.is_empty() {
                None
            } else {
                Some(contact.to_vec())
            },
            terms_of_service_agreed: Some(tos_agreed),
            ..Default::default()
        };

        let mut transport =
            Transport::new(self.http.clone(), Arc::clone(&self.nonce_pool), acme_key);
        let res = transport
            .call_jwk(&self.api_directory.new_account, &acc)
            .await?;

        let kid = expect_header(&res, "location")?;
        log::debug!("Key ID is: {kid}");
        let api_account = res.json::<api::Account>().await?;

        transport.set_key_id(kid);

        Ok(AcmeAccount {
            directory: self.api_directory.clone(),
            transport,
            api_account,
        })
    }

    /// Revoke a certificate authenticating with the certificate's own key
    /// rather than an account. See [RFC 8555 §7.6].
    ///
    /// [RFC 8555 §7.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.6
    pub(crate) async fn revoke_with_cert_key(
        &self,
        cert_der: &[u8],
        cert_key: AcmeKey,
        reason: Option<usize>,
    ) -> Result<()> {
        let revocation = api::Revocation {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(cert_der),
            reason,
        };

        let transport =
            Transport::new(self.http.clone(), Arc::clone(&self.nonce_pool), cert_key);
        transport
            .call_jwk(&self.api_directory.revoke_cert, &revocation)
            .await?;
        Ok(())
    }
}

/// Account with an ACME provider: a contact plus a P-256 key signing every
/// request.
pub struct AcmeAccount {
    directory: api::Directory,
    transport: Transport,
    api_account: api::Account,
}

/// An order in flight, tracked by its URL.
#[derive(Debug, Clone)]
pub struct AcmeOrder {
    pub url: String,
    pub api_order: api::Order,
}

impl AcmeAccount {
    pub(crate) fn acme_key(&self) -> &AcmeKey {
        self.transport.acme_key()
    }

    /// Returns a reference to the account's API object.
    ///
    /// Useful for debugging.
    pub fn api_account(&self) -> &api::Account {
        &self.api_account
    }

    /// Create a new order for `domains`, optionally pinned to an issuance
    /// profile the CA advertises.
    pub(crate) async fn new_order(
        &self,
        domains: &[String],
        profile: Option<&str>,
    ) -> Result<AcmeOrder> {
        let identifiers = domains
            .iter()
            .map(|domain| api::Identifier::dns(domain))
            .collect();

        let order = api::Order::request(identifiers, profile.map(str::to_owned));

        let res = self
            .transport
            .call_kid(&self.directory.new_order, &order)
            .await?;
        let url = expect_header(&res, "location")?;
        let api_order = res.json::<api::Order>().await?;

        Ok(AcmeOrder { url, api_order })
    }

    /// Fetch every authorization of the order, paired with its URL.
    pub(crate) async fn authorizations(
        &self,
        order: &AcmeOrder,
    ) -> Result<Vec<(String, api::Authorization)>> {
        let mut result = Vec::new();
        if let Some(urls) = &order.api_order.authorizations {
            for auth_url in urls {
                let res = self.transport.call_kid(auth_url, &api::EmptyString).await?;
                let api_auth = res.json::<api::Authorization>().await?;
                result.push((auth_url.clone(), api_auth));
            }
        }
        Ok(result)
    }

    /// The TXT record value proving control for a DNS-01 challenge.
    pub(crate) fn dns_proof(&self, challenge: &api::Challenge) -> Result<String> {
        jws::key_authorization(&challenge.token, self.transport.acme_key(), true)
    }

    /// Tell the CA to validate a challenge, then poll the authorization until
    /// it leaves `pending`. Requires the proof to be in place first.
    pub(crate) async fn respond_challenge(
        &self,
        challenge_url: &str,
        auth_url: &str,
        delay: Duration,
    ) -> Result<()> {
        let res = self
            .transport
            .call_kid(challenge_url, &api::EmptyObject)
            .await?;
        let _api_challenge = res.json::<api::Challenge>().await?;

        let auth = loop {
            let auth = self
                .transport
                .call_kid(auth_url, &api::EmptyString)
                .await?
                .json::<api::Authorization>()
                .await?;

            if !matches!(auth.status, api::AuthorizationStatus::Pending) {
                break auth;
            }

            tokio::time::sleep(delay).await;
        };

        if !matches!(auth.status, api::AuthorizationStatus::Valid) {
            let problem = auth.first_error().cloned().unwrap_or_else(|| api::Problem {
                _type: "urn:ietf:params:acme:error:incorrectResponse".to_owned(),
                detail: Some(format!(
                    "validation of {} failed without error detail",
                    auth.identifier.value
                )),
                subproblems: None,
            });
            return Err(problem.into());
        }

        Ok(())
    }

    /// Submit the CSR and poll the order out of `processing`.
    ///
    /// `valid` means the certificate is issued; anything else fails the
    /// order.
    pub(crate) async fn finalize(
        &self,
        order: &AcmeOrder,
        csr_der: &[u8],
        delay: Duration,
    ) -> Result<AcmeOrder> {
        let finalize = api::Finalize {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };

        self.transport
            .call_kid(&order.api_order.finalize, &finalize)
            .await?;

        let order = loop {
            let refreshed = self.refresh_order(&order.url).await?;
            if !refreshed.api_order.is_status(api::OrderStatus::Processing) {
                break refreshed;
            }
            tokio::time::sleep(delay).await;
        };

        if !order.api_order.is_status(api::OrderStatus::Valid) {
            let problem = order.api_order.error.clone().unwrap_or_else(|| api::Problem {
                _type: "urn:ietf:params:acme:error:serverInternal".to_owned(),
                detail: Some(format!("order is in status {:?}", order.api_order.status)),
                subproblems: None,
            });
            return Err(problem.into());
        }

        Ok(order)
    }

    /// POST-as-GET the order URL.
    pub(crate) async fn refresh_order(&self, url: &str) -> Result<AcmeOrder> {
        let res = self.transport.call_kid(url, &api::EmptyString).await?;
        let api_order = res.json::<api::Order>().await?;
        Ok(AcmeOrder {
            url: url.to_owned(),
            api_order,
        })
    }

    /// Download the issued certificate chain as PEM.
    pub(crate) async fn download_certificate(&self, order: &AcmeOrder) -> Result<String> {
        let url = order
            .api_order
            .certificate
            .as_ref()
            .ok_or_else(|| Error::Other("order has no certificate url".to_owned()))?;

        let res = self.transport.call_kid(url, &api::EmptyString).await?;
        Ok(res.text().await?)
    }

    /// Revoke a certificate using this account's key.
    pub(crate) async fn revoke_certificate(
        &self,
        cert_der: &[u8],
        reason: Option<usize>,
    ) -> Result<()> {
        let revocation = api::Revocation {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(cert_der),
            reason,
        };

        self.transport
            .call_kid(&self.directory.revoke_cert, &revocation)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_reads_directory() {
        let server = crate::test::with_directory_server();

        let client = AcmeClient::connect(DirectoryUrl::Other(&server.dir_url))
            .await
            .unwrap();

        assert!(client.api_directory().new_account.ends_with("/acme/new-acct"));
        let profiles = client.profiles().unwrap();
        assert!(profiles.contains_key("classic"));
    }

    #[tokio::test]
    async fn ensure_account_sets_key_id() {
        let server = crate::test::with_directory_server();
        let client = AcmeClient::connect(DirectoryUrl::Other(&server.dir_url))
            .await
            .unwrap();

        let account = client
            .ensure_account(AcmeKey::generate(), &["mailto:foo@bar.com".to_owned()], true)
            .await
            .unwrap();

        assert!(account.api_account().is_status_valid());
        assert!(account.acme_key().key_id().is_some());
    }

    #[tokio::test]
    async fn order_and_authorization_flow() {
        let server = crate::test::with_directory_server();
        let client = AcmeClient::connect(DirectoryUrl::Other(&server.dir_url))
            .await
            .unwrap();
        let account = client
            .ensure_account(AcmeKey::generate(), &[], true)
            .await
            .unwrap();

        let order = account
            .new_order(&["acme-test.example.com".to_owned()], None)
            .await
            .unwrap();

        let auths = account.authorizations(&order).await.unwrap();
        assert_eq!(auths.len(), 1);

        let (_, auth) = &auths[0];
        let challenge = auth.dns_challenge().unwrap();
        let proof = account.dns_proof(challenge).unwrap();
        assert_eq!(proof.len(), 43);
    }
}

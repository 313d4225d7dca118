//! Configuration CRUD exposed to the caller.
//!
//! These commands return metadata only; raw secret bytes go into the vault
//! on the way in and never come back out through this surface. Deleting a
//! configuration also deletes its vault references; that cleanup is
//! best-effort and logged, the primary outcome never fails on it.

use crate::{
    config::{DnsProviderConfig, IssuerConfig},
    dns::{build_adapter, ProviderType, TestOutcome},
    util::new_id,
    vault::{SecretKind, SecretMeta},
    Environment, Error, Result,
};

use super::Orchestrator;

impl Orchestrator {
    /// Register a DNS provider. `credential` is the provider API token; it is
    /// required for every automated type and ignored for `Manual`.
    pub fn create_provider(
        &self,
        provider_type: ProviderType,
        label: &str,
        domain_suffixes: Vec<String>,
        credential: Option<&[u8]>,
    ) -> Result<DnsProviderConfig> {
        if domain_suffixes.is_empty() {
            return Err(Error::validation("provider needs at least one domain suffix"));
        }

        let credential_ref = if provider_type.requires_credential() {
            let credential = credential.ok_or_else(|| {
                Error::Validation(format!(
                    "provider type {} requires a credential",
                    provider_type.as_str()
                ))
            })?;
            Some(
                self.vault
                    .store(SecretKind::ProviderCredential, label, credential)?,
            )
        } else {
            None
        };

        let config = DnsProviderConfig {
            id: new_id("dns"),
            provider_type,
            label: label.to_owned(),
            domain_suffixes,
            credential_ref,
        };
        self.inventory.save_provider(config.clone());
        Ok(config)
    }

    pub fn list_providers(&self) -> Vec<DnsProviderConfig> {
        self.inventory.providers()
    }

    pub fn update_provider(&self, config: DnsProviderConfig) -> Result<()> {
        if self
            .inventory
            .providers()
            .iter()
            .all(|existing| existing.id != config.id)
        {
            return Err(Error::NotFound(format!("provider {}", config.id)));
        }
        self.inventory.save_provider(config);
        Ok(())
    }

    /// Delete a provider and its stored credential.
    pub fn delete_provider(&self, provider_id: &str) -> Result<()> {
        let config = self
            .inventory
            .delete_provider(provider_id)
            .ok_or_else(|| Error::NotFound(format!("provider {provider_id}")))?;

        if let Some(secret_ref) = config.credential_ref {
            if let Err(err) = self.vault.delete(&secret_ref) {
                log::warn!("Credential {secret_ref} of deleted provider not removed: {err}");
            }
        }
        Ok(())
    }

    /// Exercise a provider's credentials against its live API.
    pub async fn test_provider(&self, provider_id: &str) -> Result<TestOutcome> {
        let config = self
            .inventory
            .providers()
            .into_iter()
            .find(|p| p.id == provider_id)
            .ok_or_else(|| Error::NotFound(format!("provider {provider_id}")))?;

        let credential = match &config.credential_ref {
            Some(secret_ref) => Some(self.vault.resolve(secret_ref)?),
            None => None,
        };
        let adapter = build_adapter(&config, credential)?;
        Ok(adapter.test_connection().await?)
    }

    /// Register an issuer. The account key reference is filled in on first
    /// issuance.
    pub fn create_issuer(
        &self,
        issuer_id: &str,
        directory_url: &str,
        environment: Environment,
        contact: Vec<String>,
        tos_agreed: bool,
    ) -> Result<IssuerConfig> {
        if directory_url.is_empty() {
            return Err(Error::validation("issuer needs a directory URL"));
        }

        let config = IssuerConfig {
            issuer_id: issuer_id.to_owned(),
            directory_url: directory_url.to_owned(),
            environment,
            contact,
            account_key_ref: None,
            tos_agreed,
            selected: false,
        };
        self.inventory.save_issuer(config.clone());
        Ok(config)
    }

    pub fn list_issuers(&self) -> Vec<IssuerConfig> {
        self.inventory.issuers()
    }

    /// Delete an issuer and its stored account key.
    pub fn delete_issuer(&self, issuer_id: &str) -> Result<()> {
        let config = self
            .inventory
            .delete_issuer(issuer_id)
            .ok_or_else(|| Error::NotFound(format!("issuer {issuer_id}")))?;

        if let Some(secret_ref) = config.account_key_ref {
            if let Err(err) = self.vault.delete(&secret_ref) {
                log::warn!("Account key {secret_ref} of deleted issuer not removed: {err}");
            }
        }
        Ok(())
    }

    /// Metadata of stored secrets; plaintext never crosses this boundary.
    pub fn list_secrets(&self, kind: Option<SecretKind>) -> Vec<SecretMeta> {
        self.vault.list(kind)
    }
}

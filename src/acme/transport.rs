//! JWS payload and nonce handling for requests to the ACME API.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    acme::{
        api::Problem,
        jws::{self, Jwk, ProtectedHeader},
        key::AcmeKey,
    },
    Error, Result,
};

pub(crate) async fn req_get(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("GET {url}");
    Ok(client.get(url).send().await?)
}

pub(crate) async fn req_head(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("HEAD {url}");
    Ok(client.head(url).send().await?)
}

async fn req_post(client: &reqwest::Client, url: &str, body: String) -> Result<reqwest::Response> {
    log::trace!("POST {url}");
    Ok(client
        .post(url)
        .header("content-type", "application/jose+json")
        .body(body)
        .send()
        .await?)
}

/// Pass 2xx responses through; turn anything else into a [`Problem`].
pub(crate) async fn handle_problem(
    res: reqwest::Response,
) -> std::result::Result<reqwest::Response, Problem> {
    if res.status().is_success() {
        return Ok(res);
    }

    let status = res.status();
    let is_problem_json = res
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let body = res.text().await.unwrap_or_default();

    let problem = if is_problem_json {
        serde_json::from_str(&body).unwrap_or_else(|err| Problem {
            _type: "problemJsonFail".to_owned(),
            detail: Some(format!(
                "failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            subproblems: None,
        })
    } else {
        Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
            subproblems: None,
        }
    };

    Err(problem)
}

pub(crate) fn expect_header(res: &reqwest::Response, name: &str) -> Result<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
        .ok_or_else(|| Error::Other(format!("missing header: {name}")))
}

/// Shared pool of replay nonces.
///
/// Every response may carry a fresh `Replay-Nonce`; harvesting them saves a
/// round trip to the newNonce endpoint on the next call.
#[derive(Debug)]
pub(crate) struct NoncePool {
    client: reqwest::Client,
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new(client: reqwest::Client, nonce_url: &str) -> Self {
        NoncePool {
            client,
            nonce_url: nonce_url.to_owned(),
            pool: Mutex::new(VecDeque::new()),
        }
    }

    fn extract_nonce(&self, res: &reqwest::Response) {
        if let Some(nonce) = res.headers().get("replay-nonce") {
            let Ok(nonce) = nonce.to_str() else {
                return;
            };
            log::trace!("Extracting new nonce");

            let mut pool = self.pool.lock();
            pool.push_back(nonce.to_owned());
            if pool.len() > 10 {
                pool.pop_front();
            }
        }
    }

    async fn get_nonce(&self) -> Result<String> {
        {
            let mut pool = self.pool.lock();
            if let Some(nonce) = pool.pop_front() {
                log::trace!("Use previous nonce");
                return Ok(nonce);
            }
        }

        log::debug!("Request new nonce");
        let res = req_head(&self.client, &self.nonce_url).await?;
        expect_header(&res, "replay-nonce")
    }
}

/// Signs and posts requests for one account key.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount url
/// 3. `set_key_id()` from the returned `Location` header
/// 4. `call_kid()` for all calls after that
#[derive(Clone)]
pub(crate) struct Transport {
    client: reqwest::Client,
    acme_key: AcmeKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub(crate) fn new(
        client: reqwest::Client,
        nonce_pool: Arc<NoncePool>,
        acme_key: AcmeKey,
    ) -> Self {
        Transport {
            client,
            acme_key,
            nonce_pool,
        }
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    pub(crate) fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// Call with the full JWK in the protected header.
    ///
    /// Needed for newAccount, and for revocations signed by a certificate key
    /// that has no account.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, |url, nonce, key, payload| {
            let protected = ProtectedHeader::new_jwk(Jwk::from(key), url, nonce);
            jws::sign(protected, key, payload)
        })
        .await
    }

    /// Call with the account URL as key ID.
    pub(crate) async fn call_kid<T>(&self, url: &str, body: &T) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, |url, nonce, key, payload| {
            let kid = key
                .key_id()
                .ok_or_else(|| Error::Other("transport has no key ID yet".to_owned()))?;
            let protected = ProtectedHeader::new_kid(kid, url, nonce);
            jws::sign(protected, key, payload)
        })
        .await
    }

    async fn do_call<T, F>(&self, url: &str, body: &T, make_body: F) -> Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(&str, String, &AcmeKey, &T) -> Result<String>,
    {
        // The ACME API may at any point invalidate all nonces. If we detect
        // such an error, loop until the server accepts one.
        loop {
            let nonce = self.nonce_pool.get_nonce().await?;

            let signed = make_body(url, nonce, &self.acme_key, body)?;

            log::debug!("Call endpoint: {url}");
            let response = req_post(&self.client, url, signed).await?;

            // a nonce may ride along regardless of outcome
            self.nonce_pool.extract_nonce(&response);

            match handle_problem(response).await {
                Ok(res) => return Ok(res),
                Err(problem) if problem.is_bad_nonce() => {
                    log::debug!("Retrying on bad nonce");
                    continue;
                }
                Err(problem) if problem.is_jws_verification_error() => {
                    log::debug!("Retrying on: {problem}");
                    continue;
                }
                Err(problem) => return Err(problem.into()),
            }
        }
    }
}

//! deSEC DNS adapter.
//!
//! deSEC models TXT data as an RRset keyed by (subname, type); a PUT replaces
//! the whole set, which gives upsert semantics for free. Values are stored
//! quoted on their side.

use serde::{Deserialize, Serialize};

use crate::dns::{normalize_txt, AdapterError, AdapterErrorKind, DnsAdapter, TestOutcome};

const API_BASE: &str = "https://desec.io/api/v1";

const CHALLENGE_TTL: u32 = 3600; // deSEC minimum

pub struct DesecAdapter {
    id: String,
    token: String,
    client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct Domain {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RrSet {
    subname: String,
    #[serde(rename = "type")]
    _type: String,
    ttl: u32,
    records: Vec<String>,
}

impl DesecAdapter {
    pub fn new(id: &str, token: String) -> Self {
        Self {
            id: id.to_owned(),
            token,
            client: reqwest::Client::new(),
            api_base: API_BASE.to_owned(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_api_base(id: &str, token: String, api_base: String) -> Self {
        Self {
            id: id.to_owned(),
            token,
            client: reqwest::Client::new(),
            api_base,
        }
    }

    async fn call(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, AdapterError> {
        let res = req
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await?;

        let status = res.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(res);
        }

        let body = res.text().await.unwrap_or_default();
        Err(AdapterError::from_status(
            status,
            format!("desec: HTTP {status}: {body}"),
        ))
    }

    /// The registered domain owning `record_name` (longest suffix the token
    /// can see), plus the subname under it.
    async fn split_name(&self, record_name: &str) -> Result<(String, String), AdapterError> {
        let res = self
            .call(self.client.get(format!("{}/domains/", self.api_base)))
            .await?;
        let domains: Vec<Domain> = res
            .json()
            .await
            .map_err(|err| AdapterError::unknown(format!("desec: bad domain list: {err}")))?;

        let mut best: Option<String> = None;
        for domain in domains {
            let matches = record_name == domain.name
                || record_name.ends_with(&format!(".{}", domain.name));
            if matches && best.as_ref().map_or(true, |b| domain.name.len() > b.len()) {
                best = Some(domain.name);
            }
        }

        let domain = best.ok_or_else(|| {
            AdapterError::not_found(format!("desec: no domain found for {record_name}"))
        })?;

        let subname = record_name
            .strip_suffix(&domain)
            .map(|s| s.trim_end_matches('.').to_owned())
            .unwrap_or_default();

        Ok((domain, subname))
    }

    fn rrset_url(&self, domain: &str, subname: &str) -> String {
        format!("{}/domains/{domain}/rrsets/{subname}/TXT/", self.api_base)
    }
}

#[async_trait::async_trait]
impl DnsAdapter for DesecAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn present_txt(&self, name: &str, value: &str) -> Result<(), AdapterError> {
        let (domain, subname) = self.split_name(name).await?;

        let body = RrSet {
            subname: subname.clone(),
            _type: "TXT".to_owned(),
            ttl: CHALLENGE_TTL,
            records: vec![format!("\"{value}\"")],
        };

        // PUT replaces the whole RRset; an existing record is overwritten
        let url = self.rrset_url(&domain, &subname);
        let res = self.call(self.client.put(&url).json(&body)).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            // RRset did not exist yet; create it on the collection
            let url = format!("{}/domains/{domain}/rrsets/", self.api_base);
            self.call(self.client.post(&url).json(&body)).await?;
        }

        // read-after-write; deSEC hands the value back quoted
        let res = self.call(self.client.get(&self.rrset_url(&domain, &subname))).await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::new(
                AdapterErrorKind::Unknown,
                format!("desec: write of {name} did not read back"),
            ));
        }
        let rrset: RrSet = res
            .json()
            .await
            .map_err(|err| AdapterError::unknown(format!("desec: bad rrset: {err}")))?;

        if !rrset.records.iter().any(|r| normalize_txt(r) == value) {
            return Err(AdapterError::new(
                AdapterErrorKind::Unknown,
                format!("desec: {name} reads back with unexpected content"),
            ));
        }

        Ok(())
    }

    async fn cleanup_txt(&self, name: &str, _value: &str) -> Result<(), AdapterError> {
        let (domain, subname) = self.split_name(name).await?;
        // an empty records array deletes the RRset
        let body = RrSet {
            subname: subname.clone(),
            _type: "TXT".to_owned(),
            ttl: CHALLENGE_TTL,
            records: vec![],
        };
        self.call(
            self.client
                .put(&self.rrset_url(&domain, &subname))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<TestOutcome, AdapterError> {
        let res = self
            .call(self.client.get(format!("{}/domains/", self.api_base)))
            .await?;
        let domains: Vec<Domain> = res
            .json()
            .await
            .map_err(|err| AdapterError::unknown(format!("desec: bad domain list: {err}")))?;
        Ok(TestOutcome {
            detail: format!("token can see {} domain(s)", domains.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use parking_lot::Mutex;
    use std::{collections::HashMap, net::TcpListener, sync::Arc};

    /// Fake deSEC API over one domain. Stores RRsets keyed by subname,
    /// records kept exactly as sent (quoted).
    #[derive(Default)]
    struct FakeDesec {
        rrsets: Mutex<HashMap<String, Vec<String>>>,
    }

    async fn list_domains() -> HttpResponse {
        HttpResponse::Ok().json(serde_json::json!([{ "name": "example.com" }]))
    }

    async fn put_rrset(
        state: web::Data<FakeDesec>,
        path: web::Path<(String, String, String)>,
        body: web::Json<RrSet>,
    ) -> HttpResponse {
        let (_, subname, _) = path.into_inner();
        let mut rrsets = state.rrsets.lock();
        if body.records.is_empty() {
            rrsets.remove(&subname);
        } else {
            rrsets.insert(subname, body.records.clone());
        }
        HttpResponse::Ok().json(&*body)
    }

    async fn get_rrset(
        state: web::Data<FakeDesec>,
        path: web::Path<(String, String, String)>,
    ) -> HttpResponse {
        let (_, subname, _) = path.into_inner();
        match state.rrsets.lock().get(&subname) {
            Some(records) => HttpResponse::Ok().json(RrSet {
                subname,
                _type: "TXT".to_owned(),
                ttl: CHALLENGE_TTL,
                records: records.clone(),
            }),
            None => HttpResponse::NotFound().finish(),
        }
    }

    fn spawn_fake_desec() -> (String, Arc<FakeDesec>) {
        let state = Arc::new(FakeDesec::default());
        let data = web::Data::from(Arc::clone(&state));

        let lst = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = lst.local_addr().unwrap().port();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/domains/", web::get().to(list_domains))
                .route(
                    "/domains/{domain}/rrsets/{subname}/{rtype}/",
                    web::put().to(put_rrset),
                )
                .route(
                    "/domains/{domain}/rrsets/{subname}/{rtype}/",
                    web::get().to(get_rrset),
                )
        })
        .listen(lst)
        .unwrap()
        .workers(1)
        .run();

        tokio::spawn(server);

        (format!("http://127.0.0.1:{port}"), state)
    }

    const RECORD: &str = "_acme-challenge.a.example.com";

    #[tokio::test]
    async fn put_replaces_the_whole_rrset() {
        let (base, state) = spawn_fake_desec();
        let adapter = DesecAdapter::with_api_base("desec", "token".into(), base);

        adapter.present_txt(RECORD, "value-one").await.unwrap();
        adapter.present_txt(RECORD, "value-two").await.unwrap();

        let rrsets = state.rrsets.lock();
        let records = rrsets.get("_acme-challenge.a").unwrap();
        assert_eq!(records, &vec!["\"value-two\"".to_owned()]);
    }

    #[tokio::test]
    async fn cleanup_deletes_the_rrset() {
        let (base, state) = spawn_fake_desec();
        let adapter = DesecAdapter::with_api_base("desec", "token".into(), base);

        adapter.present_txt(RECORD, "value").await.unwrap();
        adapter.cleanup_txt(RECORD, "value").await.unwrap();

        assert!(state.rrsets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connection_lists_domains() {
        let (base, _state) = spawn_fake_desec();
        let adapter = DesecAdapter::with_api_base("desec", "token".into(), base);

        let outcome = adapter.test_connection().await.unwrap();
        assert!(outcome.detail.contains("1 domain"));
    }
}

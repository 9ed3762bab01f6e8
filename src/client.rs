//! Caller-facing LDAP client on top of a multiplexed [`Session`].
//!
//! Every operation can run concurrently with the others on the same
//! connection. Non-zero result codes come back as [`LdapError::Status`],
//! except where the code is the answer (compare, SASL bind in progress).

use crate::config::{ClientConfig, TlsConfig, DEFAULT_PAGE_SIZE};
use crate::connection::{self, LdapStream, LdapUrl};
use crate::controls::{find_entry_change, find_paged, is_persistent, Control, EntryChangeNotification};
use crate::error::{LdapError, ResultCode, Result};
use crate::filter::parse as parse_filter;
use crate::framer::DEFAULT_MAX_MESSAGE_SIZE;
use crate::ldap_protocol::{
    AddRequest, Attribute, BindAuthentication, BindRequest, BindResponse, CompareRequest, DelRequest,
    ExtendedRequest, ExtendedResponse, IntermediateResponse, LdapMessage, LdapResult, ModifyChange,
    ModifyDNRequest, ModifyRequest, ProtocolOp, SearchRequest, SearchResultEntry, SearchScope,
};
use crate::metrics::ClientMetrics;
use crate::session::{ConnectionState, ResponseStream, Session};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Connection-wide settings shared by every clone of a client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Default per-operation timeout.
    pub timeout: Option<Duration>,
    pub page_size: i32,
    pub max_message_size: usize,
    /// Used by StartTLS.
    pub tls: Option<TlsConfig>,
    /// Host the certificate is checked against when `tls.server_name` is unset.
    pub host: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tls: None,
            host: "localhost".to_string(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &ClientConfig, host: &str) -> Self {
        Self {
            timeout: config.timeout(),
            page_size: config.page_size,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tls: config.tls.clone(),
            host: host.to_string(),
        }
    }
}

/// Everything a search returned.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub entries: Vec<SearchResultEntry>,
    /// Continuation references, one list of URIs per reference.
    pub referrals: Vec<Vec<String>>,
    pub result: LdapResult,
    /// Controls attached to searchResultDone.
    pub controls: Vec<Control>,
}

/// One non-final response of a streaming search.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchItem {
    Entry(SearchResultEntry, Vec<Control>),
    Reference(Vec<String>),
    Intermediate(IntermediateResponse),
}

impl SearchItem {
    /// Change notification attached to a persistent search entry.
    pub fn entry_change(&self) -> Option<&EntryChangeNotification> {
        match self {
            SearchItem::Entry(_, controls) => find_entry_change(controls),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct LdapClient {
    session: Session,
    options: Arc<ClientOptions>,
    timeout: Option<Duration>,
    controls: Vec<Control>,
}

impl LdapClient {
    /// Connect as described by `config`: TCP (and TLS for `ldaps://`),
    /// optional StartTLS, optional simple bind.
    pub async fn connect(config: &ClientConfig) -> Result<LdapClient> {
        let url = LdapUrl::parse(&config.url)?;
        let stream = connection::connect(&url, config.tls.as_ref(), config.connect_timeout()).await?;
        let client = Self::from_stream(stream, ClientOptions::from_config(config, &url.host));
        if config.starttls() {
            if url.secure {
                debug!("Ignoring starttls for {}: already using ldaps", url);
            } else {
                client.start_tls().await?;
            }
        }
        if let Some(bind) = &config.bind {
            client.simple_bind(&bind.dn, &bind.password).await?;
        }
        Ok(client)
    }

    /// Run a session over an already open stream.
    pub fn from_stream(stream: LdapStream, options: ClientOptions) -> LdapClient {
        let session = Session::start(stream, Arc::new(ClientMetrics::new()), options.max_message_size);
        LdapClient {
            session,
            timeout: options.timeout,
            options: Arc::new(options),
            controls: Vec::new(),
        }
    }

    /// A handle on the same connection with a different operation timeout.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> LdapClient {
        let mut client = self.clone();
        client.timeout = timeout;
        client
    }

    /// A handle on the same connection that attaches `controls` to every request.
    pub fn with_controls(&self, controls: Vec<Control>) -> LdapClient {
        let mut client = self.clone();
        client.controls = controls;
        client
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(self.session.metrics())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn call(&self, op: ProtocolOp) -> Result<LdapMessage> {
        self.session.request(op, self.controls.clone(), self.timeout).await
    }

    fn status(&self, operation: &'static str, result: LdapResult) -> Result<LdapResult> {
        if result.result_code != 0 {
            self.session.metrics().inc_error(operation);
        }
        result.into_result()
    }

    pub async fn simple_bind(&self, dn: &str, password: &str) -> Result<()> {
        let response = self.bind(dn, BindAuthentication::Simple(password.to_string())).await?;
        self.status("bind", response.result)?;
        info!("Bound as {:?}", dn);
        Ok(())
    }

    /// One SASL round. `saslBindInProgress` is returned, not raised, so the
    /// caller can continue with the server's challenge.
    pub async fn sasl_bind(&self, mechanism: &str, credentials: Option<&[u8]>) -> Result<BindResponse> {
        let auth = BindAuthentication::Sasl {
            mechanism: mechanism.to_string(),
            credentials: credentials.map(|c| c.to_vec()),
        };
        let response = self.bind("", auth).await?;
        if response.result.code() == ResultCode::SaslBindInProgress {
            return Ok(response);
        }
        let result = self.status("bind", response.result.clone())?;
        Ok(BindResponse {
            result,
            server_sasl_creds: response.server_sasl_creds,
        })
    }

    /// SASL EXTERNAL, typically over TLS with a client certificate.
    pub async fn external_bind(&self, authzid: Option<&str>) -> Result<()> {
        self.sasl_bind("EXTERNAL", authzid.map(str::as_bytes)).await?;
        Ok(())
    }

    async fn bind(&self, dn: &str, authentication: BindAuthentication) -> Result<BindResponse> {
        let request = ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: dn.to_string(),
            authentication,
        });
        match self.call(request).await?.protocol_op {
            ProtocolOp::BindResponse(response) => Ok(response),
            other => Err(unexpected("bind", &other)),
        }
    }

    pub async fn unbind(&self) -> Result<()> {
        self.session.unbind(self.controls.clone()).await
    }

    /// Upgrade this plain connection to TLS. No other operation may be
    /// outstanding.
    pub async fn start_tls(&self) -> Result<()> {
        let (connector, server_name) = connection::tls_setup(&self.options.host, self.options.tls.as_ref())?;
        self.session
            .start_tls(&connector, server_name, self.controls.clone(), self.timeout)
            .await
    }

    fn search_request(&self, base: &str, scope: SearchScope, filter: &str, attrs: &[&str]) -> Result<SearchRequest> {
        let mut request = SearchRequest::new(base, scope, parse_filter(filter)?);
        request.attributes = attrs.iter().map(|a| a.to_string()).collect();
        Ok(request)
    }

    /// Search and collect every entry and reference.
    pub async fn search(&self, base: &str, scope: SearchScope, filter: &str, attrs: &[&str]) -> Result<SearchResult> {
        let request = self.search_request(base, scope, filter, attrs)?;
        self.search_with(request, self.controls.clone()).await
    }

    async fn search_with(&self, request: SearchRequest, controls: Vec<Control>) -> Result<SearchResult> {
        let mut stream = self
            .session
            .request_stream(ProtocolOp::SearchRequest(request), controls, self.timeout)
            .await?;
        let mut out = SearchResult::default();
        while let Some(message) = stream.next().await {
            let message = message?;
            match message.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => out.entries.push(entry),
                ProtocolOp::SearchResultReference(uris) => out.referrals.push(uris),
                ProtocolOp::IntermediateResponse(_) => {}
                ProtocolOp::SearchResultDone(result) => {
                    out.result = self.status("search", result)?;
                    out.controls = message.controls;
                }
                other => return Err(unexpected("search", &other)),
            }
        }
        Ok(out)
    }

    /// Search delivering entries as they arrive. The stream's message id can be
    /// passed to [`abandon`](Self::abandon); persistent searches never finish
    /// on their own, so the operation timeout does not apply to them.
    pub async fn search_stream(&self, base: &str, scope: SearchScope, filter: &str, attrs: &[&str]) -> Result<SearchStream> {
        let request = self.search_request(base, scope, filter, attrs)?;
        let timeout = if is_persistent(&self.controls) { None } else { self.timeout };
        let inner = self
            .session
            .request_stream(ProtocolOp::SearchRequest(request), self.controls.clone(), timeout)
            .await?;
        Ok(SearchStream {
            inner,
            metrics: self.metrics(),
            result: None,
        })
    }

    /// Lazily paged search with the simple paged results control. `page_size`
    /// defaults to the configured page size.
    pub fn search_paged(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[&str],
        page_size: Option<i32>,
    ) -> Result<PagedSearch> {
        let request = self.search_request(base, scope, filter, attrs)?;
        let page_size = page_size.unwrap_or(self.options.page_size);
        if page_size <= 0 {
            return Err(LdapError::InvalidState("page size must be positive"));
        }
        Ok(PagedSearch {
            client: self.clone(),
            request,
            page_size,
            cookie: Vec::new(),
            fetched: 0,
            done: false,
        })
    }

    /// `Ok(true)` for compareTrue, `Ok(false)` for compareFalse.
    pub async fn compare(&self, dn: &str, attr: &str, value: impl AsRef<[u8]>) -> Result<bool> {
        let request = ProtocolOp::CompareRequest(CompareRequest {
            entry: dn.to_string(),
            attr: attr.to_string(),
            assertion_value: value.as_ref().to_vec(),
        });
        match self.call(request).await?.protocol_op {
            ProtocolOp::CompareResponse(result) => match result.code() {
                ResultCode::CompareTrue => Ok(true),
                ResultCode::CompareFalse => Ok(false),
                _ => {
                    self.session.metrics().inc_error("compare");
                    Err(result.to_error())
                }
            },
            other => Err(unexpected("compare", &other)),
        }
    }

    pub async fn add(&self, dn: &str, attributes: Vec<Attribute>) -> Result<LdapResult> {
        let request = ProtocolOp::AddRequest(AddRequest {
            entry: dn.to_string(),
            attributes,
        });
        match self.call(request).await?.protocol_op {
            ProtocolOp::AddResponse(result) => self.status("add", result),
            other => Err(unexpected("add", &other)),
        }
    }

    pub async fn delete(&self, dn: &str) -> Result<LdapResult> {
        let request = ProtocolOp::DelRequest(DelRequest { entry: dn.to_string() });
        match self.call(request).await?.protocol_op {
            ProtocolOp::DelResponse(result) => self.status("delete", result),
            other => Err(unexpected("delete", &other)),
        }
    }

    pub async fn modify(&self, dn: &str, changes: Vec<ModifyChange>) -> Result<LdapResult> {
        let request = ProtocolOp::ModifyRequest(ModifyRequest {
            object: dn.to_string(),
            changes,
        });
        match self.call(request).await?.protocol_op {
            ProtocolOp::ModifyResponse(result) => self.status("modify", result),
            other => Err(unexpected("modify", &other)),
        }
    }

    pub async fn modify_dn(
        &self,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<LdapResult> {
        let request = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
            entry: dn.to_string(),
            newrdn: new_rdn.to_string(),
            delete_old_rdn,
            new_superior: new_superior.map(str::to_string),
        });
        match self.call(request).await?.protocol_op {
            ProtocolOp::ModifyDNResponse(result) => self.status("modify_dn", result),
            other => Err(unexpected("modify_dn", &other)),
        }
    }

    pub async fn extended(&self, name: &str, value: Option<Vec<u8>>) -> Result<ExtendedResponse> {
        let request = ProtocolOp::ExtendedRequest(ExtendedRequest {
            request_name: name.to_string(),
            request_value: value,
        });
        match self.call(request).await?.protocol_op {
            ProtocolOp::ExtendedResponse(response) => {
                let result = self.status("extended", response.result)?;
                Ok(ExtendedResponse { result, ..response })
            }
            other => Err(unexpected("extended", &other)),
        }
    }

    /// Authorization identity of this connection (`dn:...`, `u:...`, or empty
    /// for anonymous).
    pub async fn who_am_i(&self) -> Result<String> {
        let response = self.extended(WHO_AM_I_OID, None).await?;
        Ok(response
            .response_value
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default())
    }

    pub async fn abandon(&self, message_id: i32) -> Result<()> {
        self.session.abandon(message_id, self.controls.clone()).await
    }
}

fn unexpected(operation: &'static str, op: &ProtocolOp) -> LdapError {
    LdapError::UnexpectedResponse {
        operation,
        got: op.tag(),
    }
}

/// Entries of one search in arrival order.
pub struct SearchStream {
    inner: ResponseStream,
    metrics: Arc<ClientMetrics>,
    result: Option<LdapResult>,
}

impl SearchStream {
    pub fn message_id(&self) -> i32 {
        self.inner.message_id()
    }

    /// `Ok(None)` after searchResultDone with success; a non-zero result code
    /// is returned as an error.
    pub async fn next(&mut self) -> Result<Option<SearchItem>> {
        let Some(message) = self.inner.next().await else {
            return Ok(None);
        };
        let message = message?;
        match message.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => Ok(Some(SearchItem::Entry(entry, message.controls))),
            ProtocolOp::SearchResultReference(uris) => Ok(Some(SearchItem::Reference(uris))),
            ProtocolOp::IntermediateResponse(resp) => Ok(Some(SearchItem::Intermediate(resp))),
            ProtocolOp::SearchResultDone(result) => {
                if result.result_code != 0 {
                    self.metrics.inc_error("search");
                }
                self.result = Some(result.clone());
                result.into_result().map(|_| None)
            }
            other => Err(unexpected("search", &other)),
        }
    }

    /// Final result once the stream has finished.
    pub fn result(&self) -> Option<&LdapResult> {
        self.result.as_ref()
    }
}

/// Pages of a search driven by the paged results control.
pub struct PagedSearch {
    client: LdapClient,
    request: SearchRequest,
    page_size: i32,
    cookie: Vec<u8>,
    fetched: usize,
    done: bool,
}

impl PagedSearch {
    /// Fetch the next page. `Ok(None)` once the server returned an empty
    /// cookie or the request's size limit has been reached.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SearchResultEntry>>> {
        if self.done {
            return Ok(None);
        }
        let mut controls: Vec<Control> = self
            .client
            .controls
            .iter()
            .filter(|c| c.oid != crate::controls::PAGED_RESULTS_OID)
            .cloned()
            .collect();
        controls.push(Control::paged(self.page_size, self.cookie.clone()));

        let page = self.client.search_with(self.request.clone(), controls).await;
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        self.fetched += page.entries.len();
        match find_paged(&page.controls) {
            Some(paged) if !paged.cookie.is_empty() => self.cookie = paged.cookie.clone(),
            Some(_) => self.done = true,
            None => {
                debug!("Server returned no paged results control, treating page as last");
                self.done = true;
            }
        }
        let limit = self.request.size_limit;
        if limit > 0 && self.fetched >= limit as usize {
            self.done = true;
        }
        Ok(Some(page.entries))
    }

    /// Every remaining page, concatenated.
    pub async fn collect_all(mut self) -> Result<Vec<SearchResultEntry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Entries fetched so far.
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    pub fn size_limit(mut self, limit: i32) -> Self {
        self.request.size_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{ControlValue, PagedResults};
    use crate::ldap_protocol::{ModifyOperation, SearchResultEntry};
    use crate::test_server::{pair, FakeServer};

    fn fake_client() -> (LdapClient, FakeServer) {
        let (stream, server) = pair();
        (LdapClient::from_stream(stream, ClientOptions::default()), server)
    }

    fn entry(i: usize) -> SearchResultEntry {
        SearchResultEntry {
            object_name: format!("uid=user{},ou=people,dc=example,dc=com", i),
            attributes: vec![Attribute::new("uid", [format!("user{}", i)])],
        }
    }

    fn paged_done(cookie: &[u8]) -> Vec<Control> {
        vec![Control::new(
            crate::controls::PAGED_RESULTS_OID,
            false,
            ControlValue::PagedResults(PagedResults {
                size: 5,
                cookie: cookie.to_vec(),
            }),
        )]
    }

    #[tokio::test]
    async fn test_simple_bind() {
        let (client, mut server) = fake_client();
        let server = tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            let ProtocolOp::BindRequest(bind) = &req.protocol_op else {
                panic!("expected bind, got {:?}", req.protocol_op);
            };
            assert_eq!(bind.version, 3);
            assert_eq!(bind.name, "cn=admin,dc=example,dc=com");
            assert_eq!(bind.authentication, BindAuthentication::Simple("secret".into()));
            let ok = BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None,
            };
            server.reply(req.message_id, ProtocolOp::BindResponse(ok)).await;

            let req = server.recv().await.unwrap();
            let denied = BindResponse {
                result: LdapResult::with_code(49, "bad password"),
                server_sasl_creds: None,
            };
            server.reply(req.message_id, ProtocolOp::BindResponse(denied)).await;
        });

        client.simple_bind("cn=admin,dc=example,dc=com", "secret").await.unwrap();
        let err = client.simple_bind("cn=admin,dc=example,dc=com", "wrong").await.unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::InvalidCredentials));
        assert_eq!(client.metrics().errors("bind"), 1);
        assert_eq!(client.metrics().requests("bind"), 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_sasl_bind_in_progress_is_not_an_error() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            let challenge = BindResponse {
                result: LdapResult::with_code(14, ""),
                server_sasl_creds: Some(b"challenge".to_vec()),
            };
            server.reply(req.message_id, ProtocolOp::BindResponse(challenge)).await;
        });
        let response = client.sasl_bind("DIGEST-MD5", None).await.unwrap();
        assert_eq!(response.result.code(), ResultCode::SaslBindInProgress);
        assert_eq!(response.server_sasl_creds.as_deref(), Some(&b"challenge"[..]));
    }

    #[tokio::test]
    async fn test_search_collects_entries_and_references() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            let ProtocolOp::SearchRequest(search) = &req.protocol_op else {
                panic!("expected search");
            };
            assert_eq!(search.base_object, "ou=people,dc=example,dc=com");
            assert_eq!(search.filter, parse_filter("(uid=user*)").unwrap());
            assert_eq!(search.attributes, vec!["uid".to_string(), "mail".to_string()]);
            for i in 0..2 {
                server.reply(req.message_id, ProtocolOp::SearchResultEntry(entry(i))).await;
            }
            server
                .reply(
                    req.message_id,
                    ProtocolOp::SearchResultReference(vec!["ldap://other/dc=example,dc=com".into()]),
                )
                .await;
            server
                .reply(req.message_id, ProtocolOp::SearchResultDone(LdapResult::success()))
                .await;
        });

        let result = client
            .search("ou=people,dc=example,dc=com", SearchScope::WholeSubtree, "(uid=user*)", &["uid", "mail"])
            .await
            .unwrap();
        assert_eq!(result.entries, vec![entry(0), entry(1)]);
        assert_eq!(result.referrals, vec![vec!["ldap://other/dc=example,dc=com".to_string()]]);
        assert_eq!(result.result, LdapResult::success());
    }

    #[tokio::test]
    async fn test_search_failure_and_bad_filter() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            server
                .reply(
                    req.message_id,
                    ProtocolOp::SearchResultDone(LdapResult::with_code(32, "no such base")),
                )
                .await;
        });
        let err = client
            .search("ou=missing", SearchScope::BaseObject, "(objectClass=*)", &[])
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NoSuchObject));

        // Rejected locally, nothing is sent
        let err = client
            .search("dc=example,dc=com", SearchScope::BaseObject, "(cn=foo", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Filter(_)));
    }

    #[tokio::test]
    async fn test_paged_search_pages() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            let all: Vec<SearchResultEntry> = (0..5).map(entry).collect();
            while let Some(req) = server.recv().await {
                let paged = find_paged(&req.controls).cloned().expect("paged control");
                assert_eq!(paged.size, 2);
                let start: usize = if paged.cookie.is_empty() {
                    0
                } else {
                    String::from_utf8(paged.cookie).unwrap().parse().unwrap()
                };
                let end = (start + 2).min(all.len());
                for e in &all[start..end] {
                    server.reply(req.message_id, ProtocolOp::SearchResultEntry(e.clone())).await;
                }
                let cookie = if end < all.len() { end.to_string().into_bytes() } else { Vec::new() };
                let done = LdapMessage::new(req.message_id, ProtocolOp::SearchResultDone(LdapResult::success()))
                    .with_controls(paged_done(&cookie));
                server.send(done).await;
            }
        });

        let mut pages = client
            .search_paged("ou=people,dc=example,dc=com", SearchScope::SingleLevel, "(uid=*)", &[], Some(2))
            .unwrap();
        let mut sizes = Vec::new();
        while let Some(page) = pages.next_page().await.unwrap() {
            sizes.push(page.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(pages.fetched(), 5);
        assert!(pages.next_page().await.unwrap().is_none());

        let all = client
            .search_paged("ou=people,dc=example,dc=com", SearchScope::SingleLevel, "(uid=*)", &[], Some(2))
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(all, (0..5).map(entry).collect::<Vec<_>>());

        // Size limit stops paging early
        let mut limited = client
            .search_paged("ou=people,dc=example,dc=com", SearchScope::SingleLevel, "(uid=*)", &[], Some(2))
            .unwrap()
            .size_limit(2);
        assert_eq!(limited.next_page().await.unwrap().map(|p| p.len()), Some(2));
        assert!(limited.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            for code in [6, 5, 16] {
                let req = server.recv().await.unwrap();
                let ProtocolOp::CompareRequest(cmp) = &req.protocol_op else {
                    panic!("expected compare");
                };
                assert_eq!(cmp.attr, "mail");
                server
                    .reply(req.message_id, ProtocolOp::CompareResponse(LdapResult::with_code(code, "")))
                    .await;
            }
        });
        assert!(client.compare("uid=a", "mail", "a@example.com").await.unwrap());
        assert!(!client.compare("uid=a", "mail", "b@example.com").await.unwrap());
        let err = client.compare("uid=a", "mail", b"x").await.unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NoSuchAttribute));
    }

    #[tokio::test]
    async fn test_who_am_i() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            let ProtocolOp::ExtendedRequest(ext) = &req.protocol_op else {
                panic!("expected extended");
            };
            assert_eq!(ext.request_name, WHO_AM_I_OID);
            assert_eq!(ext.request_value, None);
            let response = ExtendedResponse {
                result: LdapResult::success(),
                response_name: None,
                response_value: Some(b"dn:cn=admin,dc=example,dc=com".to_vec()),
            };
            server.reply(req.message_id, ProtocolOp::ExtendedResponse(response)).await;
        });
        assert_eq!(client.who_am_i().await.unwrap(), "dn:cn=admin,dc=example,dc=com");
    }

    #[tokio::test]
    async fn test_write_operations() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            while let Some(req) = server.recv().await {
                let response = match &req.protocol_op {
                    ProtocolOp::AddRequest(_) => ProtocolOp::AddResponse(LdapResult::with_code(68, "exists")),
                    ProtocolOp::DelRequest(_) => ProtocolOp::DelResponse(LdapResult::success()),
                    ProtocolOp::ModifyRequest(m) => {
                        assert_eq!(m.changes[0].operation, ModifyOperation::Replace);
                        ProtocolOp::ModifyResponse(LdapResult::success())
                    }
                    ProtocolOp::ModifyDNRequest(m) => {
                        assert_eq!(m.new_superior.as_deref(), Some("ou=old,dc=example,dc=com"));
                        ProtocolOp::ModifyDNResponse(LdapResult::success())
                    }
                    // Wrong response type on purpose
                    ProtocolOp::ExtendedRequest(_) => ProtocolOp::DelResponse(LdapResult::success()),
                    other => panic!("unexpected {:?}", other),
                };
                server.reply(req.message_id, response).await;
            }
        });

        let err = client
            .add("uid=x,dc=example,dc=com", vec![Attribute::new("objectClass", ["person"])])
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::EntryAlreadyExists));
        assert!(client.delete("uid=x,dc=example,dc=com").await.is_ok());
        let change = ModifyChange {
            operation: ModifyOperation::Replace,
            modification: Attribute::new("mail", ["x@example.com"]),
        };
        assert!(client.modify("uid=x,dc=example,dc=com", vec![change]).await.is_ok());
        assert!(client
            .modify_dn("uid=x,dc=example,dc=com", "uid=y", true, Some("ou=old,dc=example,dc=com"))
            .await
            .is_ok());
        assert!(matches!(
            client.extended("1.2.3.4", None).await,
            Err(LdapError::UnexpectedResponse { operation: "extended", got: 0x6B })
        ));
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let (client, mut server) = fake_client();
        let quick = client.with_timeout(Some(Duration::from_millis(50)));
        let call = tokio::spawn(async move { quick.delete("cn=slow").await });
        let req = server.recv().await.unwrap();
        assert!(matches!(call.await.unwrap(), Err(LdapError::Timeout { .. })));
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        assert_eq!(client.metrics().timeouts("delete"), 1);
    }

    #[tokio::test]
    async fn test_clones_share_ids_separate_clients_do_not() {
        let (client, mut server) = fake_client();
        let clone = client.clone();
        let a = tokio::spawn(async move { client.delete("cn=a").await });
        let b = tokio::spawn(async move { clone.delete("cn=b").await });
        let first = server.recv().await.unwrap();
        let second = server.recv().await.unwrap();
        let mut ids = vec![first.message_id, second.message_id];
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        for req in [first, second] {
            server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        }
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let (other, mut other_server) = fake_client();
        let call = tokio::spawn(async move { other.delete("cn=c").await });
        let req = other_server.recv().await.unwrap();
        assert_eq!(req.message_id, 1);
        other_server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_search_stream_abandon() {
        let (client, mut server) = fake_client();
        let mut stream = client
            .search_stream("dc=example,dc=com", SearchScope::WholeSubtree, "(objectClass=*)", &[])
            .await
            .unwrap();
        let req = server.recv().await.unwrap();
        server.reply(req.message_id, ProtocolOp::SearchResultEntry(entry(7))).await;
        match stream.next().await.unwrap() {
            Some(SearchItem::Entry(e, controls)) => {
                assert_eq!(e, entry(7));
                assert!(controls.is_empty());
            }
            other => panic!("expected entry, got {:?}", other),
        }
        client.abandon(stream.message_id()).await.unwrap();
        assert!(matches!(stream.next().await, Err(LdapError::Abandoned { .. })));
        let abandon = server.recv().await.unwrap();
        assert_eq!(abandon.protocol_op, ProtocolOp::AbandonRequest(req.message_id));
    }

    #[tokio::test]
    async fn test_persistent_search_ignores_timeout() {
        let (client, mut server) = fake_client();
        let psearch = Control::persistent_search(crate::controls::CHANGE_ANY, true, true);
        let mut stream = client
            .with_timeout(Some(Duration::from_millis(20)))
            .with_controls(vec![psearch])
            .search_stream("dc=example,dc=com", SearchScope::WholeSubtree, "(objectClass=*)", &[])
            .await
            .unwrap();
        let req = server.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let change = Control::new(
            crate::controls::ENTRY_CHANGE_NOTIFICATION_OID,
            false,
            ControlValue::EntryChange(EntryChangeNotification {
                change_type: crate::controls::CHANGE_MODIFY,
                previous_dn: None,
                change_number: Some(42),
            }),
        );
        let message = LdapMessage::new(req.message_id, ProtocolOp::SearchResultEntry(entry(1)))
            .with_controls(vec![change]);
        server.send(message).await;

        let item = stream.next().await.unwrap().unwrap();
        let notification = item.entry_change().unwrap();
        assert_eq!(notification.change_type, crate::controls::CHANGE_MODIFY);
        assert_eq!(notification.change_number, Some(42));
        assert_eq!(client.metrics().timeouts("search"), 0);
        assert_eq!(client.session().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_controls_are_attached() {
        let (client, mut server) = fake_client();
        tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            assert_eq!(req.controls.len(), 1);
            assert_eq!(req.controls[0].oid, crate::controls::SORT_REQUEST_OID);
            server.reply(req.message_id, ProtocolOp::DelResponse(LdapResult::success())).await;
        });
        let sort = Control::sort(
            vec![crate::controls::SortKey {
                attribute: "cn".into(),
                ordering_rule: None,
                reverse: false,
            }],
            false,
        );
        client.with_controls(vec![sort]).delete("cn=x").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_binds_from_config() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut server = FakeServer::new(sock);
            let req = server.recv().await.unwrap();
            assert!(matches!(req.protocol_op, ProtocolOp::BindRequest(_)));
            let ok = BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: None,
            };
            server.reply(req.message_id, ProtocolOp::BindResponse(ok)).await;
            // Hold the socket until the client hangs up
            while server.recv().await.is_some() {}
        });
        let config = ClientConfig {
            url: format!("ldap://127.0.0.1:{}", port),
            bind: Some(crate::config::BindConfig {
                dn: "cn=admin".into(),
                password: "secret".into(),
            }),
            ..ClientConfig::default()
        };
        let client = LdapClient::connect(&config).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.unbind().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}

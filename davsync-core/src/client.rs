use std::time::SystemTime;

use digest_auth::{AuthContext, HttpMethod};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use url::Url;

use crate::multistatus::{MultistatusEntry, parse_multistatus};

pub const DEFAULT_EXTENSION: &str = ".m4b";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:displayname/>
    <d:getlastmodified/>
    <d:getcontentlength/>
    <d:getcontenttype/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("missing settings")]
    MissingSettings,
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid multistatus response: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("digest authentication failed: {0}")]
    Digest(#[from] digest_auth::Error),
}

impl DavError {
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            DavError::Api { status, .. }
                if matches!(*status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavCredentials {
    pub username: String,
    pub password: String,
}

impl DavCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// One child resource reported by a depth-1 listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Last path segment of the href, percent-decoded.
    pub name: String,
    pub href: Url,
    pub display_name: Option<String>,
    /// Zero when the server did not report a length.
    pub size: u64,
    pub content_type: Option<String>,
    pub modified: Option<SystemTime>,
}

/// Single pass over the entries of one listing response.
#[derive(Debug)]
pub struct RemoteListing {
    entries: std::vec::IntoIter<RemoteEntry>,
}

impl Iterator for RemoteListing {
    type Item = RemoteEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

/// Transport handle for one WebDAV collection. Build it once and clone it
/// wherever a listing or download is needed.
#[derive(Clone)]
pub struct DavClient {
    http: Client,
    collection_url: Url,
    credentials: DavCredentials,
    extension: String,
    propfind: Method,
}

impl DavClient {
    pub fn new(collection_url: &str, credentials: DavCredentials) -> Result<Self, DavError> {
        let trimmed = collection_url.trim();
        if trimmed.is_empty() {
            return Err(DavError::MissingSettings);
        }
        let mut collection_url = Url::parse(trimmed)?;
        if !collection_url.path().ends_with('/') {
            let path = format!("{}/", collection_url.path());
            collection_url.set_path(&path);
        }
        let http = Client::builder().redirect(Policy::none()).build()?;
        Ok(Self {
            http,
            collection_url,
            credentials,
            extension: DEFAULT_EXTENSION.to_string(),
            propfind: Method::from_bytes(b"PROPFIND").expect("PROPFIND is a valid method token"),
        })
    }

    /// Restricts listings to names ending with `extension`. An empty string
    /// accepts every file.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn collection_url(&self) -> &Url {
        &self.collection_url
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub async fn list_collection(&self) -> Result<RemoteListing, DavError> {
        let response = self
            .send(self.propfind.clone(), &self.collection_url, |request| {
                request
                    .header("Depth", "1")
                    .header(CONTENT_TYPE, "application/xml; charset=utf-8")
                    .body(PROPFIND_BODY)
            })
            .await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;

        let entries: Vec<RemoteEntry> = parse_multistatus(&body)?
            .into_iter()
            .filter_map(|entry| self.to_remote_entry(entry))
            .collect();
        tracing::debug!(
            collection = %self.collection_url,
            entries = entries.len(),
            "collection listed"
        );
        Ok(RemoteListing {
            entries: entries.into_iter(),
        })
    }

    pub async fn get(&self, href: &Url) -> Result<Response, DavError> {
        let response = self
            .send(Method::GET, href, |request| request.header(ACCEPT, ""))
            .await?;
        Self::check_status(response).await
    }

    /// Sends Basic credentials up front and answers one Digest challenge if
    /// the server replies 401 with `WWW-Authenticate: Digest`.
    async fn send<F>(&self, method: Method, url: &Url, prepare: F) -> Result<Response, DavError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let request = prepare(self.http.request(method.clone(), url.clone()));
        let response = self.authorize(request).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED || self.credentials.username.is_empty() {
            return Ok(response);
        }
        let Some(challenge) = digest_challenge(&response) else {
            return Ok(response);
        };

        let mut prompt = digest_auth::parse(&challenge)?;
        let mut context = AuthContext::new(
            self.credentials.username.as_str(),
            self.credentials.password.as_str(),
            request_uri(url),
        );
        context.method = HttpMethod::from(method.as_str());
        let answer = prompt.respond(&context)?.to_header_string();
        tracing::debug!(url = %url, "answering digest challenge");

        let retry = prepare(self.http.request(method, url.clone())).header(AUTHORIZATION, answer);
        Ok(retry.send().await?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.credentials.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.credentials.username, Some(&self.credentials.password))
        }
    }

    async fn check_status(response: Response) -> Result<Response, DavError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DavError::Api { status, body })
        }
    }

    fn to_remote_entry(&self, entry: MultistatusEntry) -> Option<RemoteEntry> {
        if entry.props.is_collection {
            return None;
        }
        let href = self.collection_url.join(&entry.href).ok()?;
        if is_same_collection(&href, &self.collection_url) {
            return None;
        }
        let name = resource_name(&href)?;
        let remote = RemoteEntry {
            name,
            href,
            display_name: entry.props.display_name,
            size: entry.props.content_length.unwrap_or(0),
            content_type: entry.props.content_type,
            modified: entry
                .props
                .last_modified
                .as_deref()
                .and_then(|value| httpdate::parse_http_date(value).ok()),
        };
        self.accepts(&remote).then_some(remote)
    }

    fn accepts(&self, entry: &RemoteEntry) -> bool {
        if self.extension.is_empty() {
            return entry.size > 0 || entry.content_type.is_some();
        }
        entry.name.ends_with(&self.extension)
    }
}

fn digest_challenge(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| {
            value
                .trim_start()
                .get(..6)
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case("digest"))
        })
        .map(str::to_string)
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

fn is_same_collection(href: &Url, collection: &Url) -> bool {
    href.path().trim_end_matches('/') == collection.path().trim_end_matches('/')
}

fn resource_name(href: &Url) -> Option<String> {
    let segment = href.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let name = urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_url_is_missing_settings() {
        let err = DavClient::new("  ", DavCredentials::default())
            .err()
            .expect("expected missing settings");
        assert!(matches!(err, DavError::MissingSettings));
        assert_eq!(err.to_string(), "missing settings");
    }

    #[test]
    fn collection_url_gets_trailing_slash() {
        let client = DavClient::new("https://dav.example/books", DavCredentials::default()).unwrap();
        assert_eq!(client.collection_url().as_str(), "https://dav.example/books/");
    }

    #[test]
    fn resource_name_is_percent_decoded() {
        let href = Url::parse("https://dav.example/books/My%20Book%20%231.m4b").unwrap();
        assert_eq!(resource_name(&href).as_deref(), Some("My Book #1.m4b"));
    }

    #[test]
    fn self_entry_matches_with_or_without_slash() {
        let collection = Url::parse("https://dav.example/books/").unwrap();
        let href = Url::parse("https://dav.example/books").unwrap();
        assert!(is_same_collection(&href, &collection));
    }

    #[test]
    fn auth_errors_are_classified() {
        let err = DavError::Api {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(err.is_auth());
        let err = DavError::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(!err.is_auth());
    }
}

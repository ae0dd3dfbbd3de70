use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use url::Url;

const ODATA_VERBOSE: &str = "application/json;odata=verbose";
const FILE_NOT_FOUND_CODE: &str = "-2147024894";

#[derive(Debug, Error)]
pub enum SpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the `/_api` REST surface of a single site.
///
/// Server-relative paths are always sent as OData parameter aliases
/// (`@p='...'`) so they end up query-encoded instead of being spliced into
/// the request path.
#[derive(Clone)]
pub struct SpClient {
    http: Client,
    site_url: Url,
    token: String,
}

impl SpClient {
    pub fn new(site_url: &str, token: impl Into<String>) -> Result<Self, SpError> {
        Ok(Self {
            http: Client::new(),
            site_url: Url::parse(site_url.trim_end_matches('/'))?,
            token: token.into(),
        })
    }

    pub fn site_url(&self) -> &Url {
        &self.site_url
    }

    pub async fn get_web_server_relative_url(&self) -> Result<String, SpError> {
        let mut url = self.endpoint("/_api/web")?;
        url.query_pairs_mut()
            .append_pair("$select", "ServerRelativeUrl");
        let response = self.get(url).send().await?;
        let payload: Verbose<WebInfo> = Self::handle_response(response).await?;
        Ok(payload.d.server_relative_url)
    }

    pub async fn get_site_info(&self) -> Result<SiteInfo, SpError> {
        let mut url = self.endpoint("/_api/site")?;
        url.query_pairs_mut()
            .append_pair("$select", "Url,ServerRelativeUrl");
        let response = self.get(url).send().await?;
        let payload: Verbose<SiteInfo> = Self::handle_response(response).await?;
        Ok(payload.d)
    }

    /// Returns `None` when the site is not associated with a hub.
    pub async fn get_hub_site_data(&self) -> Result<Option<HubSiteData>, SpError> {
        let url = self.endpoint("/_api/web/hubsitedata(false)")?;
        let response = self.get(url).send().await?;
        let payload: Verbose<HubSiteDataEnvelope> = Self::handle_response(response).await?;
        match payload.d.hub_site_data.filter(|raw| !raw.trim().is_empty()) {
            Some(raw) => Ok(serde_json::from_str::<Option<HubSiteData>>(&raw)?),
            None => Ok(None),
        }
    }

    /// Lists the immediate files and subfolders of `path`, following `__next`
    /// links until both collections are exhausted.
    pub async fn list_folder(&self, path: &str) -> Result<FolderListing, SpError> {
        let mut url = self.endpoint("/_api/web/GetFolderByServerRelativeUrl(@p)")?;
        url.query_pairs_mut()
            .append_pair("@p", &odata_string(path))
            .append_pair(
                "$select",
                "Files/ServerRelativeUrl,Files/Length,Folders/ServerRelativeUrl,Folders/ItemCount",
            )
            .append_pair("$expand", "Files,Folders");
        let response = self.get(url).send().await?;
        let payload: Verbose<FolderExpand> = Self::handle_response(response).await?;
        let files = self.collect_pages(payload.d.files).await?;
        let folders = self.collect_pages(payload.d.folders).await?;
        Ok(FolderListing { files, folders })
    }

    pub async fn upload_file(
        &self,
        folder: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<(), SpError> {
        let mut url = self.endpoint(
            "/_api/web/GetFolderByServerRelativeUrl(@p)/Files/add(url=@f,overwrite=true)",
        )?;
        url.query_pairs_mut()
            .append_pair("@p", &odata_string(folder))
            .append_pair("@f", &odata_string(file_name));
        let response = self.post(url).body(content).send().await?;
        Self::handle_empty(response).await
    }

    /// Raw file content.
    pub async fn download_file(&self, path: &str) -> Result<Vec<u8>, SpError> {
        let mut url = self.endpoint("/_api/web/GetFileByServerRelativeUrl(@p)/$value")?;
        url.query_pairs_mut().append_pair("@p", &odata_string(path));
        let response = self.get(url).send().await?;
        Self::handle_bytes(response).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<(), SpError> {
        let mut url = self.endpoint("/_api/web/Folders/add(@p)")?;
        url.query_pairs_mut().append_pair("@p", &odata_string(path));
        let response = self.post(url).send().await?;
        Self::handle_empty(response).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), SpError> {
        let mut url = self.endpoint("/_api/web/GetFileByServerRelativeUrl(@p)")?;
        url.query_pairs_mut().append_pair("@p", &odata_string(path));
        let response = self
            .post(url)
            .header("X-HTTP-Method", "DELETE")
            .header("If-Match", "*")
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    async fn collect_pages<T: DeserializeOwned>(
        &self,
        first: Collection<T>,
    ) -> Result<Vec<T>, SpError> {
        let mut items = first.results;
        let mut next = first.next;
        while let Some(link) = next {
            let response = self.get(Url::parse(&link)?).send().await?;
            let page: Verbose<Collection<T>> = Self::handle_response(response).await?;
            items.extend(page.d.results);
            next = page.d.next;
        }
        Ok(items)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", ODATA_VERBOSE)
    }

    fn post(&self, url: Url) -> RequestBuilder {
        self.http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header("Accept", ODATA_VERBOSE)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SpError> {
        // Url::join would drop the site's own path ("/sites/dev"), so append instead.
        let base = self.site_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path}"))?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SpError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SpError::Api { status, body })
        }
    }

    async fn handle_bytes(response: reqwest::Response) -> Result<Vec<u8>, SpError> {
        if response.status().is_success() {
            Ok(response.bytes().await?.to_vec())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SpError::Api { status, body })
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), SpError> {
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SpError::Api { status, body })
        }
    }
}

impl SpError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            SpError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// True when the target does not exist on the remote side.
    pub fn is_not_found(&self) -> bool {
        match self {
            SpError::Api { status, body } => {
                *status == StatusCode::NOT_FOUND || body.contains(FILE_NOT_FOUND_CODE)
            }
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn odata_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn deserialize_length<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    // Verbose OData serializes Int64 values as strings.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SiteInfo {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "ServerRelativeUrl")]
    pub server_relative_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HubSiteData {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl HubSiteData {
    /// Path part of the hub's absolute url, e.g. `/sites/hub`.
    pub fn server_relative_url(&self) -> Result<String, SpError> {
        let url = Url::parse(&self.url)?;
        let path = url.path().trim_end_matches('/');
        if path.is_empty() {
            Ok("/".to_string())
        } else {
            Ok(path.to_string())
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteFile {
    #[serde(rename = "ServerRelativeUrl")]
    pub server_relative_url: String,
    #[serde(rename = "Length", deserialize_with = "deserialize_length")]
    pub length: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteFolder {
    #[serde(rename = "ServerRelativeUrl")]
    pub server_relative_url: String,
    #[serde(rename = "ItemCount", default)]
    pub item_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderListing {
    pub files: Vec<RemoteFile>,
    pub folders: Vec<RemoteFolder>,
}

#[derive(Debug, Deserialize)]
struct Verbose<T> {
    d: T,
}

#[derive(Debug, Deserialize)]
struct WebInfo {
    #[serde(rename = "ServerRelativeUrl")]
    server_relative_url: String,
}

#[derive(Debug, Deserialize)]
struct HubSiteDataEnvelope {
    #[serde(rename = "HubSiteData", default)]
    hub_site_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderExpand {
    #[serde(rename = "Files")]
    files: Collection<RemoteFile>,
    #[serde(rename = "Folders")]
    folders: Collection<RemoteFolder>,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(rename = "__next", default)]
    next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odata_string_doubles_single_quotes() {
        assert_eq!(odata_string("/sites/dev/O'Neil"), "'/sites/dev/O''Neil'");
    }

    #[test]
    fn file_length_accepts_string_and_number() {
        let text: RemoteFile = serde_json::from_str(
            r#"{"ServerRelativeUrl": "/sites/dev/a.txt", "Length": "100"}"#,
        )
        .unwrap();
        let number: RemoteFile =
            serde_json::from_str(r#"{"ServerRelativeUrl": "/sites/dev/b.txt", "Length": 50}"#)
                .unwrap();
        assert_eq!(text.length, 100);
        assert_eq!(number.length, 50);
    }

    #[test]
    fn not_found_matches_status_and_error_code() {
        let by_status = SpError::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        let by_code = SpError::Api {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: r#"{"error":{"code":"-2147024894, System.IO.FileNotFoundException"}}"#.into(),
        };
        let other = SpError::Api {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
        };
        assert!(by_status.is_not_found());
        assert!(by_code.is_not_found());
        assert!(!other.is_not_found());
        assert_eq!(other.classification(), Some(ApiErrorClass::Auth));
    }

    #[test]
    fn hub_relative_url_strips_origin() {
        let hub = HubSiteData {
            url: "https://contoso.sharepoint.com/sites/hub/".into(),
            name: None,
        };
        assert_eq!(hub.server_relative_url().unwrap(), "/sites/hub");
    }
}

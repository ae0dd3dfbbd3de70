use std::future::Future;
use std::sync::Arc;

use sprest_core::{FolderListing, SpClient, SpError};
use tracing::debug;

use super::paths::{join_remote, normalize_remote_path, relative_remote_path};
use super::tokens::{HUB_SITE, PUBLISH_ROOT, SITE, SITE_COLLECTION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

pub trait FolderLister {
    fn list_folder(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<FolderListing, SpError>> + Send;
}

pub trait FileWriter {
    fn write_file(
        &self,
        folder: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> impl Future<Output = Result<(), SpError>> + Send;
}

pub trait FileReader {
    fn read_file(
        &self,
        remote_path: &str,
    ) -> impl Future<Output = Result<Vec<u8>, SpError>> + Send;
}

pub trait FileDeleter {
    /// Must report a missing target as `AlreadyAbsent`, not as an error.
    fn delete_file(
        &self,
        remote_path: &str,
    ) -> impl Future<Output = Result<DeleteOutcome, SpError>> + Send;
}

pub trait TokenSource {
    /// `Ok(None)` means the referenced entity does not exist.
    fn resolve_token(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, SpError>> + Send;
}

impl<T: FolderLister + Send + Sync> FolderLister for Arc<T> {
    fn list_folder(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<FolderListing, SpError>> + Send {
        (**self).list_folder(path)
    }
}

impl<T: TokenSource + Send + Sync> TokenSource for Arc<T> {
    fn resolve_token(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<String>, SpError>> + Send {
        (**self).resolve_token(key)
    }
}

impl<T: FileWriter + Send + Sync> FileWriter for Arc<T> {
    fn write_file(
        &self,
        folder: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> impl Future<Output = Result<(), SpError>> + Send {
        (**self).write_file(folder, file_name, content)
    }
}

impl<T: FileReader + Send + Sync> FileReader for Arc<T> {
    fn read_file(
        &self,
        remote_path: &str,
    ) -> impl Future<Output = Result<Vec<u8>, SpError>> + Send {
        (**self).read_file(remote_path)
    }
}

impl<T: FileDeleter + Send + Sync> FileDeleter for Arc<T> {
    fn delete_file(
        &self,
        remote_path: &str,
    ) -> impl Future<Output = Result<DeleteOutcome, SpError>> + Send {
        (**self).delete_file(remote_path)
    }
}

/// The live service behind every collaborator trait.
#[derive(Clone)]
pub struct SpRemote {
    client: SpClient,
    web_root: String,
    publish_root: String,
}

impl SpRemote {
    pub async fn connect(client: SpClient, publish_root: &str) -> Result<Self, SpError> {
        let web_root = normalize_remote_path(&client.get_web_server_relative_url().await?);
        Ok(Self {
            client,
            web_root,
            publish_root: normalize_remote_path(publish_root),
        })
    }

    pub fn web_root(&self) -> &str {
        &self.web_root
    }

    /// Creates every folder between the web root and `folder`. Adding an
    /// existing folder is a no-op on the service side.
    async fn ensure_folder_chain(&self, folder: &str) -> Result<(), SpError> {
        let Some(relative) = relative_remote_path(&self.web_root, folder) else {
            return self.client.create_folder(folder).await;
        };
        let mut current = self.web_root.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            current = join_remote(&current, segment);
            debug!(folder = %current, "ensuring remote folder");
            self.client.create_folder(&current).await?;
        }
        Ok(())
    }
}

impl FolderLister for SpRemote {
    async fn list_folder(&self, path: &str) -> Result<FolderListing, SpError> {
        self.client.list_folder(path).await
    }
}

impl FileWriter for SpRemote {
    async fn write_file(
        &self,
        folder: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<(), SpError> {
        match self
            .client
            .upload_file(folder, file_name, content.clone())
            .await
        {
            Err(err) if err.is_not_found() => {
                self.ensure_folder_chain(folder).await?;
                self.client.upload_file(folder, file_name, content).await
            }
            other => other,
        }
    }
}

impl FileReader for SpRemote {
    async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, SpError> {
        self.client.download_file(remote_path).await
    }
}

impl FileDeleter for SpRemote {
    async fn delete_file(&self, remote_path: &str) -> Result<DeleteOutcome, SpError> {
        match self.client.delete_file(remote_path).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.is_not_found() => Ok(DeleteOutcome::AlreadyAbsent),
            Err(err) => Err(err),
        }
    }
}

impl TokenSource for SpRemote {
    async fn resolve_token(&self, key: &str) -> Result<Option<String>, SpError> {
        match key {
            PUBLISH_ROOT => Ok(Some(self.publish_root.clone())),
            SITE => Ok(Some(self.web_root.clone())),
            SITE_COLLECTION => Ok(Some(self.client.get_site_info().await?.server_relative_url)),
            HUB_SITE => match self.client.get_hub_site_data().await? {
                Some(hub) => Ok(Some(hub.server_relative_url()?)),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const UPLOAD_PATH: &str =
        "/sites/dev/_api/web/GetFolderByServerRelativeUrl(@p)/Files/add(url=@f,overwrite=true)";

    async fn connect(server: &MockServer) -> SpRemote {
        Mock::given(method("GET"))
            .and(path("/sites/dev/_api/web"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "d": { "ServerRelativeUrl": "/sites/dev" }
            })))
            .mount(server)
            .await;
        let client = SpClient::new(&format!("{}/sites/dev", server.uri()), "token").unwrap();
        SpRemote::connect(client, "/sites/dev/app").await.unwrap()
    }

    #[tokio::test]
    async fn write_file_creates_missing_folders_and_retries() {
        let server = MockServer::start().await;
        let remote = connect(&server).await;

        Mock::given(method("POST"))
            .and(path(UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(UPLOAD_PATH))
            .and(query_param("@p", "'/sites/dev/app/css'"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sites/dev/_api/web/Folders/add(@p)"))
            .and(query_param("@p", "'/sites/dev/app'"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sites/dev/_api/web/Folders/add(@p)"))
            .and(query_param("@p", "'/sites/dev/app/css'"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        remote
            .write_file("/sites/dev/app/css", "site.css", b"body{}".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_of_missing_file_is_already_absent() {
        let server = MockServer::start().await;
        let remote = connect(&server).await;

        Mock::given(method("POST"))
            .and(path("/sites/dev/_api/web/GetFileByServerRelativeUrl(@p)"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = remote.delete_file("/sites/dev/app/gone.js").await.unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn delete_propagates_other_errors() {
        let server = MockServer::start().await;
        let remote = connect(&server).await;

        Mock::given(method("POST"))
            .and(path("/sites/dev/_api/web/GetFileByServerRelativeUrl(@p)"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        assert!(remote.delete_file("/sites/dev/app/locked.js").await.is_err());
    }

    #[tokio::test]
    async fn read_file_downloads_content() {
        let server = MockServer::start().await;
        let remote = connect(&server).await;

        Mock::given(method("GET"))
            .and(path("/sites/dev/_api/web/GetFileByServerRelativeUrl(@p)/$value"))
            .and(query_param("@p", "'/sites/dev/app/css/site.css'"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"body{}".to_vec()))
            .mount(&server)
            .await;

        let content = remote.read_file("/sites/dev/app/css/site.css").await.unwrap();
        assert_eq!(content, b"body{}");
    }

    #[tokio::test]
    async fn hub_token_is_none_without_hub() {
        let server = MockServer::start().await;
        let remote = connect(&server).await;

        Mock::given(method("GET"))
            .and(path("/sites/dev/_api/web/hubsitedata(false)"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "d": { "HubSiteData": "" }
            })))
            .mount(&server)
            .await;

        assert_eq!(remote.resolve_token(HUB_SITE).await.unwrap(), None);
        assert_eq!(
            remote.resolve_token(PUBLISH_ROOT).await.unwrap().as_deref(),
            Some("/sites/dev/app")
        );
        assert_eq!(remote.web_root(), "/sites/dev");
    }
}

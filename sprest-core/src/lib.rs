mod client;

pub use client::{
    ApiErrorClass, FolderListing, HubSiteData, RemoteFile, RemoteFolder, SiteInfo, SpClient,
    SpError,
};
pub use reqwest::StatusCode;

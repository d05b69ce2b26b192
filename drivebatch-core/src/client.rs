use std::time::{Duration, SystemTime};

use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,mimeType,size,md5Checksum,parents";
const LIST_FIELDS: &str = "nextPageToken,files(id,name,mimeType,size,md5Checksum,parents)";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.file_endpoint(file_id, None)?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists one page of the direct children of `folder_id`, in the order the
    /// service returns them.
    pub async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("q", &children_query(folder_id));
            query.append_pair("pageSize", &page_size.max(1).to_string());
            query.append_pair("fields", LIST_FIELDS);
            query.append_pair("supportsAllDrives", "true");
            query.append_pair("includeItemsFromAllDrives", "true");
            if let Some(token) = page_token.filter(|t| !t.is_empty()) {
                query.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let body = FileBody {
            name: Some(name),
            mime_type: Some(FOLDER_MIME_TYPE),
            parents: Some(vec![parent_id]),
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn copy_file(
        &self,
        file_id: &str,
        parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.file_endpoint(file_id, Some("copy"))?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let body = FileBody {
            name: new_name,
            mime_type: None,
            parents: Some(vec![parent_id]),
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn rename_file(&self, file_id: &str, new_name: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.file_endpoint(file_id, None)?;
        url.query_pairs_mut()
            .append_pair("fields", FILE_FIELDS)
            .append_pair("supportsAllDrives", "true");
        let body = FileBody {
            name: Some(new_name),
            mime_type: None,
            parents: None,
        };
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<(), DriveError> {
        let mut url = self.file_endpoint(file_id, None)?;
        url.query_pairs_mut().append_pair("supportsAllDrives", "true");
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    fn file_endpoint(&self, file_id: &str, action: Option<&str>) -> Result<Url, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?;
            segments.push(file_id);
            if let Some(action) = action {
                segments.push(action);
            }
        }
        Ok(url)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> DriveError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, SystemTime::now()));
        let body = response.text().await.unwrap_or_default();
        DriveError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            DriveError::Api { status, body, .. } => classify_api_status(*status, body),
            DriveError::Request(err) if err.is_decode() || err.is_builder() => {
                ApiErrorClass::Permanent
            }
            DriveError::Request(_) => ApiErrorClass::Transient,
            DriveError::Url(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriveError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode, body: &str) -> ApiErrorClass {
    // Drive reports per-user quota exhaustion as 403 with a reason code.
    let rate_limited_reason =
        body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded");
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limited_reason)
    {
        ApiErrorClass::RateLimit
    } else if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Parses a `Retry-After` header value, either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

fn children_query(folder_id: &str) -> String {
    let escaped = folder_id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}' in parents and trashed = false")
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Drive encodes sizes as decimal strings; folders carry none.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<Vec<&'a str>>,
}

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};
use runkit_backend::{
    DownloadDescriptor, FullVersion, MajorVersion, MetadataCatalog, RemoteMetadataEntry,
    RuntimeError, RuntimeKind,
};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no metadata catalog configured for {kind}")]
    NotConfigured { kind: RuntimeKind },
    #[error("failed to fetch {kind} metadata: {source}")]
    Request {
        kind: RuntimeKind,
        #[source]
        source: reqwest::Error,
    },
    #[error("{kind} metadata request failed with HTTP {status}{body_snippet}")]
    HttpStatus {
        kind: RuntimeKind,
        status: reqwest::StatusCode,
        body_snippet: String,
    },
    #[error("failed to parse {kind} metadata: {details}")]
    Parse { kind: RuntimeKind, details: String },
    #[error("failed to read local {kind} catalog {}: {source}", .path.display())]
    Read {
        kind: RuntimeKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CatalogError {
    fn kind(&self) -> RuntimeKind {
        match self {
            Self::NotConfigured { kind }
            | Self::Request { kind, .. }
            | Self::HttpStatus { kind, .. }
            | Self::Parse { kind, .. }
            | Self::Read { kind, .. } => *kind,
        }
    }
}

impl From<CatalogError> for RuntimeError {
    fn from(error: CatalogError) -> Self {
        RuntimeError::metadata_unavailable(error.kind(), &error)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    url: String,
    #[serde(default)]
    strip_components: usize,
    binary: String,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    latest: String,
    #[serde(rename = "downloadDescriptor")]
    download_descriptor: RawDescriptor,
    checksum: String,
    #[serde(rename = "isLTS", default)]
    is_lts: bool,
    #[serde(rename = "isEOL", default)]
    is_eol: bool,
}

/// Metadata catalog fetched from one URL per runtime kind.
///
/// URLs with a `file://` prefix are read from disk, which keeps offline
/// mirrors and fixtures on the same code path.
#[derive(Debug, Clone)]
pub struct HttpMetadataCatalog {
    client: reqwest::Client,
    urls: BTreeMap<RuntimeKind, String>,
}

impl HttpMetadataCatalog {
    #[must_use]
    pub fn new(client: reqwest::Client, urls: BTreeMap<RuntimeKind, String>) -> Self {
        Self { client, urls }
    }

    #[must_use]
    pub fn url(&self, kind: RuntimeKind) -> Option<&str> {
        self.urls.get(&kind).map(String::as_str)
    }

    /// Fetch and parse the catalog for `kind`.
    ///
    /// # Errors
    /// Returns an error when no URL is configured for the kind, the request
    /// fails, the server answers with a non-success status, or the body is not
    /// a catalog document.
    pub async fn fetch_catalog(
        &self,
        kind: RuntimeKind,
    ) -> Result<BTreeMap<MajorVersion, RemoteMetadataEntry>, CatalogError> {
        let url = self
            .url(kind)
            .ok_or(CatalogError::NotConfigured { kind })?;
        debug!("Fetching {kind} metadata from {url}");

        let body = if let Some(path) = url.strip_prefix("file://") {
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| CatalogError::Read {
                    kind,
                    path: PathBuf::from(path),
                    source,
                })?
        } else {
            self.fetch_remote(kind, url).await?
        };

        let entries = parse_catalog(kind, &body)?;
        debug!("{kind} metadata lists {} majors", entries.len());
        Ok(entries)
    }

    async fn fetch_remote(&self, kind: RuntimeKind, url: &str) -> Result<String, CatalogError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| CatalogError::Request { kind, source })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_snippet = response
                .text()
                .await
                .ok()
                .map(|body| response_snippet(&body, 160))
                .unwrap_or_default();
            return Err(CatalogError::HttpStatus {
                kind,
                status,
                body_snippet,
            });
        }

        response
            .text()
            .await
            .map_err(|source| CatalogError::Request { kind, source })
    }
}

#[async_trait]
impl MetadataCatalog for HttpMetadataCatalog {
    async fn fetch(
        &self,
        kind: RuntimeKind,
    ) -> Result<BTreeMap<MajorVersion, RemoteMetadataEntry>, RuntimeError> {
        Ok(self.fetch_catalog(kind).await?)
    }
}

/// Parse a catalog document.
///
/// Entries whose key is not a valid family for `kind`, or whose latest
/// version does not belong to that family, are skipped with a warning.
///
/// # Errors
/// Returns [`CatalogError::Parse`] when the document is not a JSON object of
/// catalog entries.
pub fn parse_catalog(
    kind: RuntimeKind,
    body: &str,
) -> Result<BTreeMap<MajorVersion, RemoteMetadataEntry>, CatalogError> {
    let raw: BTreeMap<String, RawEntry> =
        serde_json::from_str(body).map_err(|error| CatalogError::Parse {
            kind,
            details: error.to_string(),
        })?;

    let mut entries = BTreeMap::new();
    for (key, entry) in raw {
        let Ok(major) = key.parse::<MajorVersion>() else {
            warn!("Skipping {kind} catalog entry with invalid key '{key}'");
            continue;
        };
        if !kind.accepts(&major) {
            warn!("Skipping {kind} catalog entry '{key}': not a {kind} version family");
            continue;
        }
        let latest_version = match entry.latest.parse::<FullVersion>() {
            Ok(version) if major.contains(&version) => version,
            Ok(version) => {
                warn!("Skipping {kind} catalog entry '{key}': latest {version} is outside the family");
                continue;
            }
            Err(error) => {
                warn!("Skipping {kind} catalog entry '{key}': {error}");
                continue;
            }
        };

        entries.insert(
            major,
            RemoteMetadataEntry {
                latest_version,
                download: DownloadDescriptor {
                    url: entry.download_descriptor.url,
                    strip_components: entry.download_descriptor.strip_components,
                    binary_path: entry.download_descriptor.binary,
                },
                checksum: entry.checksum.to_ascii_lowercase(),
                is_lts: entry.is_lts,
                is_eol: entry.is_eol,
            },
        );
    }

    Ok(entries)
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHP_CATALOG: &str = r#"{
        "8.3": {
            "latest": "8.3.12",
            "downloadDescriptor": {
                "url": "https://example.test/php-8.3.12.zip",
                "stripComponents": 1,
                "binary": "bin/php"
            },
            "checksum": "ABCDEF",
            "isLTS": false,
            "isEOL": false
        },
        "7.4": {
            "latest": "7.4.33",
            "downloadDescriptor": { "url": "https://example.test/php-7.4.33.zip", "binary": "php" },
            "checksum": "00",
            "isEOL": true
        }
    }"#;

    #[test]
    fn parse_catalog_maps_wire_fields() {
        let entries = parse_catalog(RuntimeKind::Php, PHP_CATALOG).expect("catalog should parse");

        let php83 = &entries[&MajorVersion::new(8, Some(3))];
        assert_eq!(php83.latest_version, FullVersion::new(8, 3, 12));
        assert_eq!(php83.download.strip_components, 1);
        assert_eq!(php83.download.binary_path, "bin/php");
        assert_eq!(php83.checksum, "abcdef");

        let php74 = &entries[&MajorVersion::new(7, Some(4))];
        assert_eq!(php74.download.strip_components, 0);
        assert!(php74.is_eol);
        assert!(!php74.is_lts);
    }

    #[test]
    fn parse_catalog_skips_entries_of_the_wrong_shape() {
        let body = r#"{
            "22": {
                "latest": "22.11.0",
                "downloadDescriptor": { "url": "u", "binary": "bin/node" },
                "checksum": "aa",
                "isLTS": true
            },
            "8.3": {
                "latest": "8.3.12",
                "downloadDescriptor": { "url": "u", "binary": "php" },
                "checksum": "aa"
            },
            "20": {
                "latest": "21.0.0",
                "downloadDescriptor": { "url": "u", "binary": "node" },
                "checksum": "aa"
            },
            "beta": {
                "latest": "23.0.0",
                "downloadDescriptor": { "url": "u", "binary": "node" },
                "checksum": "aa"
            }
        }"#;

        let entries = parse_catalog(RuntimeKind::Node, body).expect("catalog should parse");

        assert_eq!(entries.len(), 1);
        assert!(entries[&MajorVersion::new(22, None)].is_lts);
    }

    #[test]
    fn parse_catalog_rejects_non_catalog_documents() {
        let error = parse_catalog(RuntimeKind::Php, "[1, 2, 3]").expect_err("array is invalid");
        assert!(matches!(error, CatalogError::Parse { kind: RuntimeKind::Php, .. }));
    }

    #[test]
    fn catalog_errors_become_metadata_unavailable() {
        let error: RuntimeError = CatalogError::NotConfigured {
            kind: RuntimeKind::Node,
        }
        .into();

        assert!(matches!(
            error,
            RuntimeError::MetadataUnavailable { kind: RuntimeKind::Node, .. }
        ));
    }

    #[tokio::test]
    async fn fetch_catalog_reads_file_urls() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("php.json");
        std::fs::write(&path, PHP_CATALOG).expect("catalog fixture should be written");

        let catalog = HttpMetadataCatalog::new(
            reqwest::Client::new(),
            BTreeMap::from([(RuntimeKind::Php, format!("file://{}", path.display()))]),
        );

        let entries = catalog
            .fetch(RuntimeKind::Php)
            .await
            .expect("local catalog should load");
        assert_eq!(entries.len(), 2);

        let missing = catalog.fetch(RuntimeKind::Node).await;
        assert!(matches!(
            missing,
            Err(RuntimeError::MetadataUnavailable { kind: RuntimeKind::Node, .. })
        ));
    }
}

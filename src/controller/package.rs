//! Package source loading
//!
//! Resolves an extension version to the packaged chart and the metadata the
//! controller needs to install it. The Kubernetes loader reads the
//! `ExtensionVersion` object and fetches the chart either from a ConfigMap or
//! over HTTP(S).

use crate::crd::extension::{extension_version_name, ChartDataRef, ExtensionVersion, Permissions};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("extension version {0} not found")]
    NotFound(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("chart download failed: {0}")]
    Download(String),

    #[error("invalid package {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// A resolved extension version
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Package {
    pub extension: String,
    pub version: String,
    /// Packaged chart archive
    pub chart: Vec<u8>,
    pub ca_bundle: Option<String>,
    /// Preferred install namespace
    pub namespace: Option<String>,
    pub permissions: Permissions,
}

#[async_trait]
pub trait PackageLoader: Send + Sync {
    async fn load(&self, extension: &str, version: &str) -> Result<Package, PackageError>;
}

pub struct KubePackageLoader {
    client: kube::Client,
    http: reqwest::Client,
}

impl KubePackageLoader {
    pub fn new(client: kube::Client) -> Result<Self, PackageError> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| PackageError::Download(e.to_string()))?;
        Ok(Self { client, http })
    }

    async fn read_configmap(&self, name: &str, source: &ChartDataRef) -> Result<Vec<u8>, PackageError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &source.namespace);
        let configmap = api.get(&source.name).await?;

        let binary = configmap
            .binary_data
            .and_then(|mut data| data.remove(&source.key))
            .map(|bytes| bytes.0);
        let text = || {
            configmap
                .data
                .as_ref()
                .and_then(|data| data.get(&source.key))
                .map(|s| s.as_bytes().to_vec())
        };

        binary.or_else(text).ok_or_else(|| PackageError::Invalid {
            name: name.to_string(),
            reason: format!(
                "key {} missing in ConfigMap {}/{}",
                source.key, source.namespace, source.name
            ),
        })
    }

    async fn download(&self, url: &str, ca_bundle: Option<&str>) -> Result<Vec<u8>, PackageError> {
        let client = match ca_bundle {
            Some(pem) => {
                let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                    .map_err(|e| PackageError::Download(format!("invalid CA bundle: {}", e)))?;
                reqwest::Client::builder()
                    .timeout(DOWNLOAD_TIMEOUT)
                    .add_root_certificate(certificate)
                    .build()
                    .map_err(|e| PackageError::Download(e.to_string()))?
            }
            None => self.http.clone(),
        };

        debug!(url = %url, "Downloading chart");
        let response = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PackageError::Download(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PackageError::Download(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl PackageLoader for KubePackageLoader {
    async fn load(&self, extension: &str, version: &str) -> Result<Package, PackageError> {
        let name = extension_version_name(extension, version);
        let api: Api<ExtensionVersion> = Api::all(self.client.clone());
        let extension_version = api
            .get_opt(&name)
            .await?
            .ok_or_else(|| PackageError::NotFound(name.clone()))?;
        let spec = extension_version.spec;

        let chart = match (&spec.chart_data_ref, &spec.chart_url) {
            (Some(source), _) => self.read_configmap(&name, source).await?,
            (None, Some(url)) => self.download(url, spec.ca_bundle.as_deref()).await?,
            (None, None) => {
                return Err(PackageError::Invalid {
                    name,
                    reason: "neither chartDataRef nor chartURL is set".to_string(),
                })
            }
        };

        info!(
            extension = %extension,
            version = %version,
            chart_bytes = chart.len(),
            "Loaded extension package"
        );

        Ok(Package {
            extension: extension.to_string(),
            version: version.to_string(),
            chart,
            ca_bundle: spec.ca_bundle,
            namespace: spec.namespace,
            permissions: spec.permissions,
        })
    }
}

/// Serves fixed packages; unknown versions are not found
#[cfg(test)]
#[allow(clippy::expect_used)]
#[derive(Default)]
pub struct MockPackageLoader {
    packages: std::sync::Mutex<Vec<Package>>,
    loads: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockPackageLoader {
    pub fn with(packages: Vec<Package>) -> Self {
        Self {
            packages: std::sync::Mutex::new(packages),
            loads: Default::default(),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
#[async_trait]
impl PackageLoader for MockPackageLoader {
    async fn load(&self, extension: &str, version: &str) -> Result<Package, PackageError> {
        self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.packages
            .lock()
            .expect("MockPackageLoader lock poisoned")
            .iter()
            .find(|p| p.extension == extension && p.version == version)
            .cloned()
            .ok_or_else(|| PackageError::NotFound(extension_version_name(extension, version)))
    }
}

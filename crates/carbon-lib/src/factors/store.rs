//! Emission factor dataset loading
//!
//! Dataset layout under the root directory:
//! - `v1/<provider>.json`: PUE, regional grid intensity and per-kind specs
//! - `v2/<provider>-instances.json`: optional precise per-kind power curves

use super::{EmissionFactors, FactorError, InstanceData};
use crate::models::Provider;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Source of emission factor data
pub trait FactorStore: Send + Sync {
    /// Load the factor table for a provider
    fn provider_factors(&self, provider: Provider) -> Result<EmissionFactors, FactorError>;

    /// Load the precise per-kind dataset for a provider; empty when absent
    fn provider_instances(
        &self,
        provider: Provider,
    ) -> Result<HashMap<String, InstanceData>, FactorError>;

    /// Content fingerprint of the data, if the store can compute one
    fn fingerprint(&self) -> Option<String> {
        None
    }
}

/// File-backed store reading a dataset checkout from disk
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn factors_path(&self, provider: Provider) -> PathBuf {
        self.root.join("v1").join(format!("{}.json", provider))
    }

    fn instances_path(&self, provider: Provider) -> PathBuf {
        self.root
            .join("v2")
            .join(format!("{}-instances.json", provider))
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, FactorError> {
        let content = fs::read_to_string(path).map_err(|source| FactorError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| FactorError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Dataset files present on disk, in a stable order
    fn dataset_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Provider::ALL
            .iter()
            .flat_map(|p| [self.factors_path(*p), self.instances_path(*p)])
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files
    }
}

impl FactorStore for DatasetStore {
    fn provider_factors(&self, provider: Provider) -> Result<EmissionFactors, FactorError> {
        let path = self.factors_path(provider);
        let factors: EmissionFactors = Self::read_json(&path)?;
        info!(
            provider = %provider,
            regions = factors.coefficient.len(),
            kinds = factors.embodied.len(),
            pue = factors.average_pue,
            "Loaded emission factors"
        );
        Ok(factors)
    }

    fn provider_instances(
        &self,
        provider: Provider,
    ) -> Result<HashMap<String, InstanceData>, FactorError> {
        let path = self.instances_path(provider);
        match Self::read_json::<HashMap<String, InstanceData>>(&path) {
            Ok(instances) => {
                info!(provider = %provider, kinds = instances.len(), "Loaded instance dataset");
                Ok(instances)
            }
            Err(FactorError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                debug!(
                    provider = %provider,
                    path = %path.display(),
                    "No instance dataset, fallback model only"
                );
                Ok(HashMap::new())
            }
            Err(e) => Err(e),
        }
    }

    fn fingerprint(&self) -> Option<String> {
        let files = self.dataset_files();
        if files.is_empty() {
            return None;
        }

        let mut hasher = Sha256::new();
        for path in files {
            // Unreadable files are skipped; loading them reports the error.
            if let Ok(bytes) = fs::read(&path) {
                hasher.update(path.to_string_lossy().as_bytes());
                hasher.update(&bytes);
            }
        }
        Some(hex::encode(hasher.finalize()))
    }
}

/// In-memory store, for embedding factor tables directly
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    factors: HashMap<Provider, EmissionFactors>,
    instances: HashMap<Provider, HashMap<String, InstanceData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factors(mut self, provider: Provider, factors: EmissionFactors) -> Self {
        self.factors.insert(provider, factors);
        self
    }

    pub fn with_instances(
        mut self,
        provider: Provider,
        instances: HashMap<String, InstanceData>,
    ) -> Self {
        self.instances.insert(provider, instances);
        self
    }
}

impl FactorStore for MemoryStore {
    fn provider_factors(&self, provider: Provider) -> Result<EmissionFactors, FactorError> {
        self.factors
            .get(&provider)
            .cloned()
            .ok_or(FactorError::ProviderNotLoaded(provider))
    }

    fn provider_instances(
        &self,
        provider: Provider,
    ) -> Result<HashMap<String, InstanceData>, FactorError> {
        Ok(self.instances.get(&provider).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GCP_FACTORS: &str = r#"{
        "average_pue": 1.1,
        "coefficient": {"europe-west1": 0.000123},
        "embodied": {
            "e2-small": {
                "min_watts": 1.0,
                "max_watts": 4.0,
                "total_embodied_kwh_co2e": 1200.0,
                "vcpu": 2,
                "total_vcpu": 64
            }
        }
    }"#;

    const GCP_INSTANCES: &str = r#"{
        "n2-standard-4": {
            "vcpu": 4,
            "pkg_watt": [
                {"percentage": 0, "wattage": 2.1},
                {"percentage": 10, "wattage": 5.5},
                {"percentage": 50, "wattage": 12.0},
                {"percentage": 100, "wattage": 18.4}
            ],
            "embodied_hourly_gco2e": 3.2
        }
    }"#;

    fn write_dataset(dir: &TempDir, with_instances: bool) {
        fs::create_dir_all(dir.path().join("v1")).unwrap();
        fs::write(dir.path().join("v1").join("gcp.json"), GCP_FACTORS).unwrap();
        if with_instances {
            fs::create_dir_all(dir.path().join("v2")).unwrap();
            fs::write(
                dir.path().join("v2").join("gcp-instances.json"),
                GCP_INSTANCES,
            )
            .unwrap();
        }
    }

    #[test]
    fn test_load_provider_factors() {
        let dir = TempDir::new().unwrap();
        write_dataset(&dir, false);
        let store = DatasetStore::new(dir.path());

        let factors = store.provider_factors(Provider::Gcp).unwrap();
        assert_eq!(factors.average_pue, 1.1);
        assert_eq!(factors.coefficient["europe-west1"], 0.000123);
        assert_eq!(factors.embodied["e2-small"].total_vcpu, 64.0);
    }

    #[test]
    fn test_missing_factors_file_is_error() {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::new(dir.path());

        let err = store.provider_factors(Provider::Aws).unwrap_err();
        assert!(matches!(err, FactorError::Io { .. }));
    }

    #[test]
    fn test_malformed_factors_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("v1")).unwrap();
        fs::write(dir.path().join("v1").join("aws.json"), "{not json").unwrap();
        let store = DatasetStore::new(dir.path());

        let err = store.provider_factors(Provider::Aws).unwrap_err();
        assert!(matches!(err, FactorError::Parse { .. }));
        assert_eq!(err.reason(), "dataset_parse");
    }

    #[test]
    fn test_missing_instances_file_is_empty() {
        let dir = TempDir::new().unwrap();
        write_dataset(&dir, false);
        let store = DatasetStore::new(dir.path());

        assert!(store.provider_instances(Provider::Gcp).unwrap().is_empty());
    }

    #[test]
    fn test_load_provider_instances() {
        let dir = TempDir::new().unwrap();
        write_dataset(&dir, true);
        let store = DatasetStore::new(dir.path());

        let instances = store.provider_instances(Provider::Gcp).unwrap();
        let n2 = &instances["n2-standard-4"];
        assert_eq!(n2.vcpu, 4);
        assert_eq!(n2.pkg_watt.len(), 4);
        assert_eq!(n2.pkg_watt[3].wattage, 18.4);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::new(dir.path());
        assert!(store.fingerprint().is_none());

        write_dataset(&dir, false);
        let first = store.fingerprint().unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(store.fingerprint().unwrap(), first);

        write_dataset(&dir, true);
        assert_ne!(store.fingerprint().unwrap(), first);
    }

    #[test]
    fn test_memory_store_unknown_provider() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.provider_factors(Provider::Azure),
            Err(FactorError::ProviderNotLoaded(Provider::Azure))
        ));
        assert!(store.provider_instances(Provider::Azure).unwrap().is_empty());
    }
}

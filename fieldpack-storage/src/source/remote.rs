//! Remote GeoJSON feature endpoints. Read-only.

use super::geojson::parse_collection;
use super::{Connector, FeatureSource, SourceBinding};
use crate::error::{StorageError, StorageResult};
use crate::mutation::Mutation;
use fieldpack_model::{DataSourceDescriptor, ServiceProtocol};
use fieldpack_types::{Feature, FeatureKey};
use reqwest::blocking::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteGeoJsonConnector;

fn endpoint(binding: &SourceBinding) -> StorageResult<(&str, Option<&str>)> {
    match &binding.descriptor {
        DataSourceDescriptor::RemoteService {
            url,
            protocol: ServiceProtocol::GeoJson,
            filter,
        } => Ok((url.as_str(), filter.as_deref())),
        other => Err(StorageError::UnsupportedSourceType(other.kind_name())),
    }
}

fn client(binding: &SourceBinding) -> StorageResult<Client> {
    Ok(Client::builder()
        .timeout(binding.timeout)
        .connect_timeout(binding.timeout)
        .build()?)
}

fn get(binding: &SourceBinding) -> StorageResult<reqwest::blocking::Response> {
    let (url, filter) = endpoint(binding)?;
    let mut request = client(binding)?.get(url);
    if let Some(filter) = filter {
        request = request.query(&[("filter", filter)]);
    }
    let response = request.send().map_err(|e| {
        warn!("Request to {} failed: {}", url, e);
        StorageError::SourceUnavailable(format!("{url}: {e}"))
    })?;
    if !response.status().is_success() {
        return Err(StorageError::SourceUnavailable(format!(
            "{url} answered {}",
            response.status()
        )));
    }
    Ok(response)
}

/// Checks an online service answers at all, within `timeout`.
///
/// Used for map and tile services, which are linked rather than read.
pub fn probe_service(url: &str, timeout: Duration) -> StorageResult<()> {
    let client = Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()?;
    let response = client.get(url).send().map_err(|e| {
        warn!("Service {} unreachable: {}", url, e);
        StorageError::SourceUnavailable(format!("{url}: {e}"))
    })?;
    if response.status().is_server_error() {
        return Err(StorageError::SourceUnavailable(format!(
            "{url} answered {}",
            response.status()
        )));
    }
    debug!("Service {} answered {}", url, response.status());
    Ok(())
}

impl Connector for RemoteGeoJsonConnector {
    fn name(&self) -> &'static str {
        "remote-geojson"
    }

    fn supports(&self, descriptor: &DataSourceDescriptor) -> bool {
        matches!(
            descriptor,
            DataSourceDescriptor::RemoteService {
                protocol: ServiceProtocol::GeoJson,
                ..
            }
        )
    }

    fn probe(&self, binding: &SourceBinding) -> StorageResult<()> {
        get(binding).map(|_| ())
    }

    fn open(&self, binding: SourceBinding) -> StorageResult<Box<dyn FeatureSource>> {
        let doc: serde_json::Value = get(&binding)?.json()?;
        let features = parse_collection(&binding, &doc)?;
        debug!(
            "Fetched {} remote features for layer {}",
            features.len(),
            binding.layer_id
        );
        Ok(Box::new(RemoteGeoJsonSource { binding, features }))
    }
}

/// Features fetched from a remote endpoint in one response.
struct RemoteGeoJsonSource {
    binding: SourceBinding,
    features: Vec<Feature>,
}

impl FeatureSource for RemoteGeoJsonSource {
    fn binding(&self) -> &SourceBinding {
        &self.binding
    }

    fn read_batches(
        &mut self,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<Feature>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        for chunk in self.features.chunks(batch_size.max(1)) {
            visit(chunk.to_vec())?;
        }
        Ok(())
    }

    fn fetch(&mut self, keys: &[FeatureKey]) -> StorageResult<Vec<Feature>> {
        let wanted: HashSet<&FeatureKey> = keys.iter().collect();
        Ok(self
            .features
            .iter()
            .filter(|f| f.key.as_ref().is_some_and(|k| wanted.contains(k)))
            .cloned()
            .collect())
    }

    fn apply(&mut self, _mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>> {
        Err(StorageError::ReadOnly(format!(
            "remote layer {} does not accept writes",
            self.binding.layer_id
        )))
    }

    fn is_writable(&self) -> bool {
        false
    }
}

//! Anonymous OCI registry access, for image digests and immutable
//! action packages.

use async_trait::async_trait;
use oci_client::{
    Client, Reference,
    errors::OciDistributionError,
    manifest::OciManifest,
    secrets::RegistryAuth,
};
use thiserror::Error;
use tracing::instrument;

use crate::remote::{Manifest, Registry};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference: {reference}")]
    InvalidReference {
        reference: String,
        #[source]
        source: oci_client::ParseError,
    },
    #[error("couldn't fetch the manifest for {reference}")]
    Distribution {
        reference: String,
        #[source]
        source: OciDistributionError,
    },
}

/// A [`Registry`] backed by anonymous pulls from public registries.
#[derive(Default)]
pub struct OciRegistry {
    client: Client,
}

impl OciRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls the manifest for `reference`, returning `None` if the
    /// registry doesn't have it.
    #[instrument(skip(self))]
    pub async fn manifest(&self, reference: &str) -> Result<Option<Manifest>, RegistryError> {
        let parsed = Reference::try_from(reference.to_string()).map_err(|source| {
            RegistryError::InvalidReference {
                reference: reference.into(),
                source,
            }
        })?;

        match self
            .client
            .pull_manifest(&parsed, &RegistryAuth::Anonymous)
            .await
        {
            Ok((manifest, digest)) => {
                let artifact_type = match manifest {
                    OciManifest::Image(image) => image.artifact_type,
                    OciManifest::ImageIndex(index) => index.artifact_type,
                };
                Ok(Some(Manifest {
                    artifact_type,
                    digest,
                }))
            }
            Err(
                OciDistributionError::ImageManifestNotFoundError(_)
                | OciDistributionError::ServerError { code: 404, .. },
            ) => Ok(None),
            Err(source) => Err(RegistryError::Distribution {
                reference: reference.into(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn get_manifest(&self, reference: &str) -> anyhow::Result<Option<Manifest>> {
        Ok(self.manifest(reference).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::{OciRegistry, RegistryError};

    #[tokio::test]
    async fn test_invalid_reference() {
        let registry = OciRegistry::new();
        assert!(matches!(
            registry.manifest("Not A Reference!").await,
            Err(RegistryError::InvalidReference { .. })
        ));
    }
}

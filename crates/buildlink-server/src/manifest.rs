//! OCI index assembly.
//!
//! Per-platform build results are combined into one image index, and the
//! application metadata image plus every built image are combined into the
//! application manifest list that a deploy step pulls by digest.

use crate::error::ManifestError;
use async_trait::async_trait;
use buildlink_core::{ImageData, Platform};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const DEFAULT_REGISTRY: &str = "index.docker.io";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    fn is_index(&self) -> bool {
        self.media_type == OCI_INDEX || self.media_type == DOCKER_MANIFEST_LIST
    }
}

/// An image index. Entries keep the order they were appended in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn empty(media_type: &str) -> Self {
        Self {
            schema_version: 2,
            media_type: media_type.to_string(),
            manifests: Vec::new(),
        }
    }

    pub fn append(&mut self, descriptor: Descriptor) {
        self.manifests.push(descriptor);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// `sha256:<hex>` of the serialized index.
    pub fn digest(&self) -> Result<String, ManifestError> {
        Ok(sha256_digest(&self.to_bytes()?))
    }
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// An image reference: `repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self, ManifestError> {
        let invalid = || ManifestError::Reference(s.to_string());
        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                let hex = digest.strip_prefix("sha256:").ok_or_else(invalid)?;
                if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(invalid());
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&rest[..split], Some(rest[split + 1..].to_string()))
            }
            None => (rest, None),
        };

        if repository.is_empty()
            || repository.split('/').any(str::is_empty)
            || tag.as_deref().is_some_and(str::is_empty)
        {
            return Err(invalid());
        }
        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Registry host, defaulting to Docker Hub for short names.
    pub fn host(&self) -> &str {
        match self.repository.split_once('/') {
            Some((first, _))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                first
            }
            _ => DEFAULT_REGISTRY,
        }
    }

    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// The registry operations manifest assembly needs.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Describe a stored manifest. Image manifests carry their platform.
    async fn head(&self, reference: &Reference) -> Result<Descriptor, ManifestError>;

    /// Store a manifest under the reference's tag (or only by digest).
    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        body: Vec<u8>,
        platform: Option<Platform>,
    ) -> Result<Descriptor, ManifestError>;
}

struct Stored {
    descriptor: Descriptor,
    body: Vec<u8>,
}

/// Registry kept in process memory.
#[derive(Default)]
pub struct MemoryRegistry {
    manifests: Mutex<HashMap<(String, String), Stored>>,
    tags: Mutex<HashMap<(String, String), String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw manifest body for a reference.
    pub fn manifest(&self, reference: &Reference) -> Result<Vec<u8>, ManifestError> {
        let digest = self.resolve(reference)?;
        let manifests = self.manifests.lock().unwrap_or_else(PoisonError::into_inner);
        manifests
            .get(&(reference.repository.clone(), digest))
            .map(|stored| stored.body.clone())
            .ok_or_else(|| ManifestError::NotFound(reference.to_string()))
    }

    fn resolve(&self, reference: &Reference) -> Result<String, ManifestError> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }
        let tag = reference.tag.as_deref().unwrap_or("latest");
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(reference.repository.clone(), tag.to_string()))
            .cloned()
            .ok_or_else(|| ManifestError::NotFound(reference.to_string()))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn head(&self, reference: &Reference) -> Result<Descriptor, ManifestError> {
        let digest = self.resolve(reference)?;
        self.manifests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(reference.repository.clone(), digest))
            .map(|stored| stored.descriptor.clone())
            .ok_or_else(|| ManifestError::NotFound(reference.to_string()))
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        media_type: &str,
        body: Vec<u8>,
        platform: Option<Platform>,
    ) -> Result<Descriptor, ManifestError> {
        let digest = sha256_digest(&body);
        if let Some(expected) = &reference.digest
            && *expected != digest
        {
            return Err(ManifestError::Reference(format!(
                "{reference} does not match content digest {digest}"
            )));
        }

        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            digest: digest.clone(),
            size: body.len() as u64,
            platform,
        };
        self.manifests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (reference.repository.clone(), digest.clone()),
                Stored {
                    descriptor: descriptor.clone(),
                    body,
                },
            );
        if let Some(tag) = &reference.tag {
            self.tags
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((reference.repository.clone(), tag.clone()), digest);
        }
        tracing::debug!(reference = %reference, media_type, "stored manifest");
        Ok(descriptor)
    }
}

/// Combine per-platform results, in the order given, into one index stored
/// in the repository of the last result. Returns `repository@sha256:<hex>`.
pub async fn create_manifest(
    registry: &dyn Registry,
    results: &[(Platform, String)],
) -> Result<String, ManifestError> {
    let mut index = ImageIndex::empty(OCI_INDEX);
    let mut target = None;
    for (platform, image) in results {
        let reference = Reference::parse(image)?;
        let found = registry.head(&reference).await?;
        index.append(Descriptor {
            platform: Some(platform.clone()),
            ..found
        });
        target = Some(reference);
    }
    let target = target.ok_or(ManifestError::Empty)?;

    let body = index.to_bytes()?;
    let reference = target.with_digest(sha256_digest(&body));
    registry
        .put_manifest(&reference, OCI_INDEX, body, None)
        .await?;
    Ok(reference.to_string())
}

/// Compose the application manifest list: the metadata image first, then
/// every built image in name order. The list is tagged with its own digest
/// hex. Returns the hex, or the full `repository@sha256:<hex>` reference
/// when `full_digest` is set.
pub async fn create_app_manifest(
    registry: &dyn Registry,
    app_image: &str,
    images: &BTreeMap<String, ImageData>,
    full_digest: bool,
) -> Result<String, ManifestError> {
    let app = Reference::parse(app_image)?;
    if app.digest.is_none() {
        return Err(ManifestError::Reference(app_image.to_string()));
    }

    let mut index = ImageIndex::empty(DOCKER_MANIFEST_LIST);
    index.append(registry.head(&app).await?);
    for (name, data) in images {
        let reference = Reference::parse(&data.image)?;
        let found = registry.head(&reference).await?;
        tracing::trace!(image = %name, index = found.is_index(), "adding to app manifest");
        index.append(Descriptor {
            platform: None,
            ..found
        });
    }

    let body = index.to_bytes()?;
    let digest = sha256_digest(&body);
    let hex = digest.trim_start_matches("sha256:").to_string();
    registry
        .put_manifest(&app.with_tag(&hex), DOCKER_MANIFEST_LIST, body, None)
        .await?;

    if full_digest {
        Ok(app.with_digest(digest).to_string())
    } else {
        Ok(hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn push_image(registry: &MemoryRegistry, repo: &str, platform: Platform) -> String {
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": { "platform": platform.to_string() },
        }))
        .unwrap();
        let reference = Reference::parse(repo).unwrap();
        let stored = registry
            .put_manifest(&reference, OCI_MANIFEST, body, Some(platform))
            .await
            .unwrap();
        reference.with_digest(stored.digest).to_string()
    }

    #[test]
    fn parse_references() {
        let r = Reference::parse("registry.local:5000/acorn/web:v1").unwrap();
        assert_eq!(r.repository, "registry.local:5000/acorn/web");
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.host(), "registry.local:5000");

        let digest = format!("sha256:{}", "a".repeat(64));
        let r = Reference::parse(&format!("ghcr.io/acorn/web@{digest}")).unwrap();
        assert_eq!(r.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(r.tag, None);
        assert_eq!(r.to_string(), format!("ghcr.io/acorn/web@{digest}"));

        assert_eq!(Reference::parse("acorn/web").unwrap().host(), "index.docker.io");
        assert!(Reference::parse("ghcr.io/web@sha256:short").is_err());
        assert!(Reference::parse("ghcr.io//web").is_err());
    }

    #[tokio::test]
    async fn platform_index_keeps_input_order() {
        let registry = MemoryRegistry::new();
        let amd = Platform::new("linux", "amd64");
        let arm = Platform::new("linux", "arm64");
        let a = push_image(&registry, "registry.local/acorn/web", amd.clone()).await;
        let b = push_image(&registry, "registry.local/acorn/web", arm.clone()).await;

        let results = vec![(amd.clone(), a.clone()), (arm.clone(), b.clone())];
        let first = create_manifest(&registry, &results).await.unwrap();
        let again = create_manifest(&registry, &results).await.unwrap();
        assert_eq!(first, again);
        assert!(first.starts_with("registry.local/acorn/web@sha256:"));

        let body = registry
            .manifest(&Reference::parse(&first).unwrap())
            .unwrap();
        let index: ImageIndex = serde_json::from_slice(&body).unwrap();
        assert_eq!(index.media_type, OCI_INDEX);
        let entries: Vec<_> = index
            .manifests
            .iter()
            .map(|d| (d.platform.clone().unwrap(), d.digest.clone()))
            .collect();
        let digest_of = |r: &str| Reference::parse(r).unwrap().digest.unwrap();
        assert_eq!(entries, vec![(amd, digest_of(&a)), (arm, digest_of(&b))]);

        // Reversing the input is a different index.
        let reversed: Vec<_> = results.into_iter().rev().collect();
        assert_ne!(create_manifest(&registry, &reversed).await.unwrap(), first);
    }

    #[tokio::test]
    async fn app_manifest_is_tagged_by_its_digest() {
        let registry = MemoryRegistry::new();
        let native = Platform::new("linux", "amd64");
        let app = push_image(&registry, "registry.local/acorn/app", native.clone()).await;
        let web = push_image(&registry, "registry.local/acorn/app", native.clone()).await;
        let worker = push_image(
            &registry,
            "registry.local/acorn/app",
            Platform::new("linux", "arm64"),
        )
        .await;

        let mut images = BTreeMap::new();
        images.insert("worker".to_string(), ImageData { image: worker });
        images.insert("web".to_string(), ImageData { image: web });

        let hex = create_app_manifest(&registry, &app, &images, false)
            .await
            .unwrap();
        assert_eq!(hex.len(), 64);

        let tagged = Reference::parse("registry.local/acorn/app")
            .unwrap()
            .with_tag(&hex);
        let index: ImageIndex =
            serde_json::from_slice(&registry.manifest(&tagged).unwrap()).unwrap();
        assert_eq!(index.media_type, DOCKER_MANIFEST_LIST);
        assert_eq!(index.manifests.len(), 3);
        assert_eq!(index.manifests[0].platform, Some(native));
        assert!(index.manifests[1..].iter().all(|d| d.platform.is_none()));
        assert_eq!(index.digest().unwrap(), format!("sha256:{hex}"));

        let full = create_app_manifest(&registry, &app, &images, true)
            .await
            .unwrap();
        assert_eq!(full, format!("registry.local/acorn/app@sha256:{hex}"));
    }

    #[tokio::test]
    async fn empty_and_missing_inputs() {
        let registry = MemoryRegistry::new();
        assert!(matches!(
            create_manifest(&registry, &[]).await,
            Err(ManifestError::Empty)
        ));

        let missing = format!("registry.local/acorn/web@sha256:{}", "0".repeat(64));
        assert!(matches!(
            create_manifest(&registry, &[(Platform::new("linux", "amd64"), missing.clone())])
                .await,
            Err(ManifestError::NotFound(_))
        ));
        assert!(matches!(
            create_app_manifest(&registry, "registry.local/acorn/web:v1", &BTreeMap::new(), false)
                .await,
            Err(ManifestError::Reference(_))
        ));
    }
}

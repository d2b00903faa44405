//! Build orchestration.
//!
//! The [`Builder`] walks a build spec image by image, runs every requested
//! platform through a [`BuildEngine`], and assembles the results into the
//! application manifest. Engines reach the client's files only through the
//! [`FileServer`] they are handed.

use crate::error::BuildError;
use crate::keychain::Keychain;
use crate::manifest::{
    OCI_CONFIG, OCI_MANIFEST, Reference, Registry, create_app_manifest, create_manifest,
    sha256_digest,
};
use async_trait::async_trait;
use buildlink_client::filesync::{
    CONTEXT_DIR, DOCKERFILE_DIR, FileServer, SyncRequest, packet_pipe, receive_dir,
};
use buildlink_client::{Messages, TransportError};
use buildlink_core::{
    AppImage, BuildSpec, ImageBuild, ImageData, Message, Platform, SolveStatus, Vertex,
};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

const SYNC_CAPACITY: usize = 64;
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Progress reporting for one build, under its own status session.
pub struct StatusWriter {
    messages: Arc<dyn Messages>,
    session_id: String,
}

impl StatusWriter {
    pub fn new(messages: Arc<dyn Messages>) -> Self {
        Self {
            messages,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub async fn send(&self, status: SolveStatus) -> Result<(), TransportError> {
        self.messages
            .send(&Message::status(&self.session_id, status))
            .await
    }

    /// Report a named step as started, or as finished.
    pub async fn step(&self, name: &str, completed: bool) -> Result<(), TransportError> {
        self.send(SolveStatus {
            vertexes: vec![Vertex {
                digest: sha256_digest(name.as_bytes()),
                name: name.to_string(),
                started: true,
                completed,
                ..Default::default()
            }],
            logs: Vec::new(),
        })
        .await
    }
}

/// Everything an engine gets for one image on one platform.
pub struct SolveJob<'a> {
    pub push_repo: &'a str,
    /// `None` builds for the executor's native platform.
    pub platform: Option<&'a Platform>,
    pub build: &'a ImageBuild,
    pub files: &'a FileServer,
    pub status: &'a StatusWriter,
    pub keychain: &'a dyn Keychain,
}

#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Build and push one image, returning `repository@sha256:<hex>`.
    async fn solve(&self, job: SolveJob<'_>) -> Result<String, BuildError>;
}

pub fn native_platform() -> Platform {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    Platform::new("linux", arch)
}

/// Engine that stages the synced context on local disk and publishes a
/// content-addressed manifest for it.
pub struct StagingEngine {
    registry: Arc<dyn Registry>,
}

impl StagingEngine {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl BuildEngine for StagingEngine {
    async fn solve(&self, job: SolveJob<'_>) -> Result<String, BuildError> {
        let platform = job.platform.cloned().unwrap_or_else(native_platform);
        let repo = Reference::parse(job.push_repo)?;
        let failed = |reason: String| BuildError::Failed {
            image: job.push_repo.to_string(),
            reason,
        };

        let staging = tempfile::Builder::new().prefix("buildlink-").tempdir()?;
        let context = staging.path().join(CONTEXT_DIR);
        let dockerfile_dir = staging.path().join(DOCKERFILE_DIR);
        let dockerfile_name = dockerfile_name(job.build);

        let step = format!("[{platform}] load build context");
        job.status.step(&step, false).await?;
        receive(job.files, SyncRequest::dir(CONTEXT_DIR), &context).await?;
        let request = SyncRequest {
            include_patterns: vec![dockerfile_name.clone()],
            ..SyncRequest::dir(DOCKERFILE_DIR)
        };
        receive(job.files, request, &dockerfile_dir).await?;
        job.status.step(&step, true).await?;

        let dockerfile = tokio::fs::read_to_string(dockerfile_dir.join(&dockerfile_name))
            .await
            .map_err(|e| failed(format!("reading {dockerfile_name}: {e}")))?;

        let step = format!("[{platform}] resolve credentials for {}", repo.host());
        job.status.step(&step, false).await?;
        let auth = job.keychain.resolve(repo.host()).await?;
        tracing::debug!(host = repo.host(), anonymous = auth.is_none(), "push credentials");
        job.status.step(&step, true).await?;

        let step = format!("[{platform}] exporting to image");
        job.status.step(&step, false).await?;
        let root = context.clone();
        let (layer_digest, layer_size) = tokio::task::spawn_blocking(move || fingerprint(&root))
            .await
            .map_err(|e| failed(e.to_string()))??;

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": platform.architecture,
            "os": platform.os,
            "variant": platform.variant,
            "config": { "Labels": dockerfile_labels(&dockerfile) },
            "buildArgs": job.build.build_args,
            "target": job.build.target,
            "dockerfile": sha256_digest(dockerfile.as_bytes()),
        }))?;
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": OCI_CONFIG,
                "digest": sha256_digest(&config),
                "size": config.len(),
            },
            "layers": [{
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": layer_digest,
                "size": layer_size,
            }],
            "annotations": dockerfile_labels(&dockerfile),
        }))?;

        let reference = repo.with_digest(sha256_digest(&manifest));
        self.registry
            .put_manifest(&reference, OCI_MANIFEST, manifest, Some(platform))
            .await?;
        job.status.step(&step, true).await?;
        Ok(reference.to_string())
    }
}

fn dockerfile_name(build: &ImageBuild) -> String {
    if !build.dockerfile_contents.is_empty() {
        return "Dockerfile".to_string();
    }
    Path::new(&build.dockerfile)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Dockerfile".to_string())
}

/// Pull one named directory from the client into `dest`.
async fn receive(files: &FileServer, request: SyncRequest, dest: &Path) -> Result<(), BuildError> {
    tokio::fs::create_dir_all(dest).await?;
    let dir = request.dir_name.join(",");
    let (local, mut remote) = packet_pipe(SYNC_CAPACITY);
    let relay = files.diff_copy(request, local);
    let received = receive_dir(dest, &mut remote);
    tokio::pin!(relay, received);

    let mut relayed = false;
    loop {
        tokio::select! {
            listing = &mut received => {
                let listing = listing?;
                if !relayed {
                    relay.as_mut().await?;
                }
                tracing::debug!(dir = %dir, entries = listing.len(), "received directory");
                return Ok(());
            }
            done = &mut relay, if !relayed => {
                done?;
                relayed = true;
            }
        }
    }
}

/// Digest and total size of every file, symlink, and directory under `root`.
fn fingerprint(root: &Path) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 32 * 1024];
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_string_lossy()
            .replace('\\', "/");
        hasher.update(rel.as_bytes());
        hasher.update([0]);

        let kind = entry.file_type();
        if kind.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if kind.is_file() {
            let mut file = std::fs::File::open(entry.path())?;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                size += n as u64;
            }
        }
        hasher.update([0]);
    }
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

/// `LABEL key=value` instructions, with JSON-quoted values unquoted.
fn dockerfile_labels(dockerfile: &str) -> BTreeMap<String, String> {
    dockerfile
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line
                .get(..6)
                .filter(|head| head.eq_ignore_ascii_case("label "))
                .map(|_| &line[6..])?;
            let (key, value) = rest.trim().split_once('=')?;
            let value = serde_json::from_str::<String>(value)
                .unwrap_or_else(|_| value.trim_matches('"').to_string());
            Some((key.trim().to_string(), value))
        })
        .collect()
}

/// Dockerfile for the image carrying the application definition and the
/// digests of everything built for it.
fn metadata_dockerfile(
    acornfile: &str,
    images: &BTreeMap<String, ImageData>,
) -> Result<String, BuildError> {
    let digests: BTreeMap<&str, &str> = images
        .iter()
        .map(|(name, data)| {
            let digest = data
                .image
                .split_once('@')
                .map_or(data.image.as_str(), |(_, d)| d);
            (name.as_str(), digest)
        })
        .collect();
    Ok(format!(
        "FROM scratch\nLABEL io.acorn.acornfile={}\nLABEL io.acorn.images={}\n",
        serde_json::to_string(acornfile)?,
        serde_json::to_string(&serde_json::to_string(&digests)?)?,
    ))
}

/// Runs whole builds against one engine and registry.
pub struct Builder {
    engine: Arc<dyn BuildEngine>,
    registry: Arc<dyn Registry>,
    parallel: bool,
}

impl Builder {
    pub fn new(engine: Arc<dyn BuildEngine>, registry: Arc<dyn Registry>) -> Self {
        Self {
            engine,
            registry,
            parallel: false,
        }
    }

    /// Build the platforms of one image concurrently instead of in order.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub async fn build(
        &self,
        messages: Arc<dyn Messages>,
        push_repo: &str,
        spec: &BuildSpec,
        keychain: &dyn Keychain,
    ) -> Result<AppImage, BuildError> {
        let status = StatusWriter::new(messages.clone());
        let mut cache: HashMap<String, String> = HashMap::new();
        let mut images = BTreeMap::new();

        for (name, build) in &spec.images {
            let key = serde_json::to_string(&serde_json::json!({
                "platforms": spec.platforms,
                "build": build,
            }))?;
            let id = match cache.get(&key) {
                Some(id) => id.clone(),
                None => {
                    let build = with_defaults(build);
                    let id = self
                        .build_image(&messages, push_repo, &spec.platforms, &build, &status, keychain)
                        .await?;
                    cache.insert(key, id.clone());
                    id
                }
            };
            tracing::info!(image = %name, id = %id, "built image");
            images.insert(name.clone(), ImageData { image: id });
        }

        let metadata = ImageBuild {
            dockerfile_contents: metadata_dockerfile(&spec.acornfile, &images)?,
            ..ImageBuild::new(".", "Dockerfile")
        };
        let app = self
            .build_image(&messages, push_repo, &[], &metadata, &status, keychain)
            .await?;
        let id = create_app_manifest(self.registry.as_ref(), &app, &images, false).await?;

        Ok(AppImage {
            digest: format!("sha256:{id}"),
            id,
            acornfile: spec.acornfile.clone(),
            images,
        })
    }

    async fn build_image(
        &self,
        messages: &Arc<dyn Messages>,
        push_repo: &str,
        platforms: &[Platform],
        build: &ImageBuild,
        status: &StatusWriter,
        keychain: &dyn Keychain,
    ) -> Result<String, BuildError> {
        let files = FileServer::new(messages.clone(), build);
        let job = |platform| SolveJob {
            push_repo,
            platform,
            build,
            files: &files,
            status,
            keychain,
        };

        let mut ids = if platforms.is_empty() {
            vec![self.engine.solve(job(None)).await?]
        } else if self.parallel {
            futures_util::future::try_join_all(
                platforms.iter().map(|p| self.engine.solve(job(Some(p)))),
            )
            .await?
        } else {
            let mut ids = Vec::with_capacity(platforms.len());
            for platform in platforms {
                ids.push(self.engine.solve(job(Some(platform))).await?);
            }
            ids
        };

        if ids.len() == 1 {
            return Ok(ids.remove(0));
        }
        let results: Vec<(Platform, String)> = platforms.iter().cloned().zip(ids).collect();
        Ok(create_manifest(self.registry.as_ref(), &results).await?)
    }
}

fn with_defaults(build: &ImageBuild) -> ImageBuild {
    let mut build = build.clone();
    if build.context.is_empty() {
        build.context = ".".to_string();
    }
    if build.dockerfile.is_empty() {
        build.dockerfile = "Dockerfile".to_string();
    }
    build
}

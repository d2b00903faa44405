//! Drives the executor over a real socket with the real client.

use buildlink_client::{BuildClient, ClientError, Progress, StaticCredentials};
use buildlink_core::{BuildRequest, BuildSpec, ImageBuild, Platform, RegistryAuth, SolveStatus};
use buildlink_server::manifest::{DOCKER_MANIFEST_LIST, ImageIndex};
use buildlink_server::{
    AppState, Builder, KeyPair, MemoryRegistry, Reference, StagingEngine, Token, TokenVerifier,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    steps: Vec<String>,
    hosts: Vec<String>,
}

impl Progress for Recorder {
    fn display(&mut self, _session_id: &str, status: &SolveStatus) {
        for vertex in &status.vertexes {
            if vertex.completed {
                self.steps.push(vertex.name.clone());
            }
        }
    }

    fn credentials_used(&mut self, hosts: &[String]) {
        self.hosts.extend_from_slice(hosts);
    }
}

struct Executor {
    url: String,
    keys: KeyPair,
    registry: Arc<MemoryRegistry>,
}

async fn start_executor(namespace: Option<&str>) -> Executor {
    start_executor_with(namespace, false).await
}

async fn start_executor_with(namespace: Option<&str>, parallel: bool) -> Executor {
    let keys = KeyPair::generate();
    let registry = Arc::new(MemoryRegistry::new());
    let builder = Builder::new(
        Arc::new(StagingEngine::new(registry.clone())),
        registry.clone(),
    )
    .parallel(parallel);
    let mut state = AppState::new(TokenVerifier::new("builder-1", &keys), builder)
        .with_push_repo("registry.local/acorn/fallback");
    if let Some(namespace) = namespace {
        state = state.with_namespace(namespace);
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(buildlink_server::serve(listener, Arc::new(state)));
    Executor {
        url: format!("http://{addr}/build"),
        keys,
        registry,
    }
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\nCOPY . /app\n").unwrap();
    std::fs::write(dir.path().join("main.go"), "package main\n").unwrap();
    std::fs::write(dir.path().join("debug.log"), "noise\n").unwrap();
    std::fs::create_dir(dir.path().join("worker")).unwrap();
    std::fs::write(dir.path().join("worker/Dockerfile"), "FROM scratch\n").unwrap();
    dir
}

fn request() -> BuildRequest {
    let mut images = BTreeMap::new();
    images.insert("web".to_string(), ImageBuild::new(".", "Dockerfile"));
    images.insert(
        "worker".to_string(),
        ImageBuild::new("worker", "worker/Dockerfile"),
    );
    BuildRequest {
        name: "shop".into(),
        namespace: "acorn".into(),
        uid: "5d0c".into(),
        spec: BuildSpec {
            acornfile: "containers: web: build: \".\"\n".into(),
            platforms: Vec::new(),
            images,
        },
    }
}

#[tokio::test]
async fn build_round_trip_and_replay() {
    let executor = start_executor(Some("builds")).await;
    let dir = workspace();

    let token = Token::new("builder-1", request(), "registry.local/acorn/shop")
        .seal(&executor.keys.public_key())
        .unwrap();

    let mut credentials = StaticCredentials::new();
    credentials.insert("registry.local", RegistryAuth::new("bob", "hunter2"));
    let client = BuildClient::new(dir.path()).with_credentials(Arc::new(credentials));

    let mut progress = Recorder::default();
    let cancel = CancellationToken::new();
    let image = client
        .connect(&executor.url, &token, &mut progress, &cancel)
        .await
        .unwrap();

    assert_eq!(image.digest, format!("sha256:{}", image.id));
    assert_eq!(image.acornfile, request().spec.acornfile);
    assert_eq!(
        image.images.keys().collect::<Vec<_>>(),
        vec!["web", "worker"]
    );
    for data in image.images.values() {
        assert!(data.image.starts_with("registry.local/acorn/shop@sha256:"));
    }
    assert_ne!(image.images["web"], image.images["worker"]);
    assert_eq!(progress.hosts, vec!["registry.local".to_string()]);
    assert!(
        progress
            .steps
            .iter()
            .any(|step| step.ends_with("load build context"))
    );

    let app = Reference::parse("registry.local/acorn/shop")
        .unwrap()
        .with_tag(&image.id);
    let index: ImageIndex =
        serde_json::from_slice(&executor.registry.manifest(&app).unwrap()).unwrap();
    assert_eq!(index.media_type, DOCKER_MANIFEST_LIST);
    assert_eq!(index.manifests.len(), 3);
    assert!(index.manifests[0].platform.is_some());

    // The same sealed bytes are never accepted twice.
    let replay = client
        .connect(&executor.url, &token, &mut Recorder::default(), &cancel)
        .await;
    match replay {
        Err(ClientError::Rejected { status, body }) => {
            assert_eq!(status, 401);
            assert!(!body.contains("already been used"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn identical_contexts_build_identical_images() {
    let executor = start_executor(None).await;
    let dir = workspace();
    let client = BuildClient::new(dir.path());
    let cancel = CancellationToken::new();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let token = Token::new("builder-1", request(), "")
            .seal(&executor.keys.public_key())
            .unwrap();
        let image = client
            .connect(&executor.url, &token, &mut Recorder::default(), &cancel)
            .await
            .unwrap();
        assert!(
            image.images["web"]
                .image
                .starts_with("registry.local/acorn/fallback@")
        );
        ids.push(image.id);
    }
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn multi_platform_images_are_indexed() {
    let executor = start_executor(None).await;
    let dir = workspace();
    let mut build = request();
    build.spec.platforms = vec![
        Platform::new("linux", "amd64"),
        Platform::new("linux", "arm64"),
    ];
    build.spec.images.remove("worker");

    let token = Token::new("builder-1", build, "registry.local/acorn/multi")
        .seal(&executor.keys.public_key())
        .unwrap();
    let image = BuildClient::new(dir.path())
        .connect(
            &executor.url,
            &token,
            &mut Recorder::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let web = Reference::parse(&image.images["web"].image).unwrap();
    let index: ImageIndex =
        serde_json::from_slice(&executor.registry.manifest(&web).unwrap()).unwrap();
    let platforms: Vec<_> = index
        .manifests
        .iter()
        .map(|d| d.platform.as_ref().unwrap().to_string())
        .collect();
    assert_eq!(platforms, vec!["linux/amd64", "linux/arm64"]);
}

#[tokio::test]
async fn parallel_platforms_share_one_connection() {
    const FILES: usize = 40;
    const FILE_SIZE: usize = 70 * 1024;

    let executor = start_executor_with(None, true).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
    for i in 0..FILES {
        let body: Vec<u8> = (0..FILE_SIZE).map(|b| (b * 31 + i) as u8).collect();
        std::fs::write(dir.path().join(format!("blob-{i:03}.bin")), body).unwrap();
    }

    let mut build = request();
    build.spec.images.remove("worker");
    build.spec.platforms = vec![
        Platform::new("linux", "amd64"),
        Platform::new("linux", "arm64"),
        Platform::new("linux", "s390x"),
        Platform::new("linux", "ppc64le"),
    ];
    let token = Token::new("builder-1", build, "registry.local/acorn/par")
        .seal(&executor.keys.public_key())
        .unwrap();
    let image = BuildClient::new(dir.path())
        .connect(
            &executor.url,
            &token,
            &mut Recorder::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let web = Reference::parse(&image.images["web"].image).unwrap();
    let index: ImageIndex =
        serde_json::from_slice(&executor.registry.manifest(&web).unwrap()).unwrap();
    let platforms: Vec<_> = index
        .manifests
        .iter()
        .map(|d| d.platform.as_ref().unwrap().to_string())
        .collect();
    assert_eq!(
        platforms,
        vec!["linux/amd64", "linux/arm64", "linux/s390x", "linux/ppc64le"]
    );

    // Every session received the whole context, whatever the interleaving.
    let mut layers = Vec::new();
    for descriptor in &index.manifests {
        let body = executor
            .registry
            .manifest(&web.with_digest(&descriptor.digest))
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let layer = &manifest["layers"][0];
        assert!(layer["size"].as_u64().unwrap() >= (FILES * FILE_SIZE) as u64);
        layers.push(layer["digest"].as_str().unwrap().to_string());
    }
    layers.dedup();
    assert_eq!(layers.len(), 1);
}

#[tokio::test]
async fn build_failure_is_reported_verbatim() {
    let executor = start_executor(None).await;
    let dir = workspace();
    let mut build = request();
    build
        .spec
        .images
        .insert("broken".into(), ImageBuild::new(".", "Missing.dockerfile"));

    let token = Token::new("builder-1", build, "registry.local/acorn/shop")
        .seal(&executor.keys.public_key())
        .unwrap();
    let result = BuildClient::new(dir.path())
        .connect(
            &executor.url,
            &token,
            &mut Recorder::default(),
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(ClientError::Build(message)) => assert!(message.contains("Missing.dockerfile")),
        other => panic!("expected build error, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_does_not_need_a_token() {
    let executor = start_executor(None).await;
    let url = executor.url.replace("/build", "/ping");
    let addr = url.trim_start_matches("http://").trim_end_matches("/ping");

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("pong"));
}

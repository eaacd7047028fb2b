mod support;

use std::sync::Arc;
use std::time::Duration;

use imgferry::event::{Event, RecordingSink};
use imgferry::metrics::TransferMetrics;
use imgferry::{
    Artifact, BlobTransferEngine, ContentStore, MediaType, OciDigest, Platform, Resolvable,
    Resolver, TransferError, TreeWalker, UploadSession,
};
use opentelemetry::metrics::MeterProvider;

use support::{FakeRegistry, REPO, RecordingStore, with_platform};

fn engine() -> BlobTransferEngine {
    let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
    BlobTransferEngine::new(TransferMetrics::new(&meter))
}

fn walker(sink: &Arc<RecordingSink>) -> TreeWalker {
    TreeWalker::new(engine(), sink.clone())
}

fn resolver(registry: &Arc<FakeRegistry>, sink: &Arc<RecordingSink>) -> Resolver {
    Resolver::new(registry.clone())
        .with_platform(Platform::new("linux", "amd64"))
        .with_sink(sink.clone())
}

async fn copy(
    registry: &Arc<FakeRegistry>,
    sink: &Arc<RecordingSink>,
    reference: &str,
) -> (Arc<RecordingStore>, imgferry::Result<()>) {
    let store = RecordingStore::new().await;
    let dyn_store: Arc<dyn ContentStore> = store.clone();
    let resolvable = resolver(registry, sink).get(reference).await.unwrap();
    let outcome = walker(sink).transfer(&resolvable, &dyn_store).await;
    (store, outcome)
}

#[tokio::test]
async fn test_image_copies_layers_then_config_then_manifest() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("v1"), "app", 3);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:v1")).await;
    outcome.unwrap();

    let committed = store.committed();
    assert_eq!(committed.len(), 5);
    for layer in &image.layers {
        assert!(store.position(&layer.digest) < store.position(&image.config.digest));
    }
    assert_eq!(committed[3], image.config.digest);
    assert_eq!(committed[4], image.descriptor.digest);

    for layer in &image.layers {
        let stored = store.inner.get_blob(&layer.digest).await.unwrap();
        assert_eq!(OciDigest::sha256(&stored), layer.digest);
    }
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn test_short_layer_fails_with_size_mismatch() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let config = registry.add_blob(MediaType::OciConfigJson, b"{}");
    let mut layer = registry.add_blob(MediaType::OciLayer, b"short");
    layer.size += 10;
    registry.add_image_with(Some("v1"), config, vec![layer]);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:v1")).await;

    match outcome {
        Err(TransferError::SizeMismatch { expected, actual }) => {
            assert_eq!(expected, 15);
            assert_eq!(actual, 5);
        }
        other => panic!("expected SizeMismatch, got {:?}", other.err()),
    }
    assert!(store.committed().is_empty());
}

#[tokio::test]
async fn test_oversized_layer_fails_with_size_mismatch() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let config = registry.add_blob(MediaType::OciConfigJson, b"{}");
    let mut layer = registry.add_blob(MediaType::OciLayer, b"longer than declared");
    layer.size = 4;
    registry.add_image_with(Some("v1"), config, vec![layer]);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:v1")).await;

    assert!(matches!(
        outcome,
        Err(TransferError::SizeMismatch { expected: 4, .. })
    ));
    assert!(store.committed().is_empty());
}

#[tokio::test]
async fn test_tampered_layer_fails_digest_check() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("v1"), "app", 1);
    let layer = &image.layers[0];
    let tampered = vec![b'x'; layer.size as usize];
    registry.tamper_blob(&layer.digest, &tampered);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:v1")).await;

    match outcome {
        Err(TransferError::DigestMismatch { expected, actual }) => {
            assert_eq!(expected, layer.digest);
            assert_eq!(actual, OciDigest::sha256(&tampered));
        }
        other => panic!("expected DigestMismatch, got {:?}", other.err()),
    }
    assert!(!store.inner.blob_exists(&layer.digest).await.unwrap());
    assert!(!store.inner.blob_exists(&image.descriptor.digest).await.unwrap());
}

#[tokio::test]
async fn test_failed_layer_blocks_config_and_manifest() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("v1"), "app", 3);
    registry.fail_blob(&image.layers[1].digest, Duration::from_millis(50));

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:v1")).await;

    assert!(matches!(outcome, Err(TransferError::Transport(_))));
    let committed = store.committed();
    assert!(!committed.contains(&image.layers[1].digest));
    assert!(!committed.contains(&image.config.digest));
    assert!(!committed.contains(&image.descriptor.digest));
}

#[tokio::test]
async fn test_failed_layer_cancels_slow_siblings() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("v1"), "app", 2);
    registry.fail_blob(&image.layers[0].digest, Duration::ZERO);
    registry.slow_blob(&image.layers[1].digest, Duration::from_secs(30));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        copy(&registry, &sink, &format!("{REPO}:v1")),
    )
    .await
    .expect("transfer should not wait for the slow layer");
    let (store, outcome) = result;

    assert!(matches!(outcome, Err(TransferError::Transport(_))));
    assert!(store.committed().is_empty());
}

#[tokio::test]
async fn test_index_children_are_visited_once_in_order() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let amd64 = registry.add_image(None, "amd64", 2);
    let arm64 = registry.add_image(None, "arm64", 2);
    let index = registry.add_index(
        Some("multi"),
        vec![
            with_platform(amd64.descriptor.clone(), "linux", "amd64"),
            with_platform(arm64.descriptor.clone(), "linux", "arm64"),
        ],
    );

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:multi")).await;
    outcome.unwrap();

    let committed = store.committed();
    assert_eq!(committed.len(), amd64.digests().len() + arm64.digests().len() + 1);
    for digest in amd64.digests().iter().chain(arm64.digests().iter()) {
        assert_eq!(committed.iter().filter(|d| *d == digest).count(), 1);
    }
    let first_done = store.position(&amd64.descriptor.digest);
    for digest in arm64.digests() {
        assert!(store.position(&digest) > first_done);
    }
    assert_eq!(committed.last(), Some(&index.digest));
}

#[tokio::test]
async fn test_nested_index_is_walked() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(None, "inner", 1);
    let inner = registry.add_index(None, vec![image.descriptor.clone()]);
    let outer = registry.add_index(Some("nested"), vec![inner.clone()]);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:nested")).await;
    outcome.unwrap();

    assert!(store.position(&image.descriptor.digest) < store.position(&inner.digest));
    assert!(store.position(&inner.digest) < store.position(&outer.digest));
}

#[tokio::test]
async fn test_failing_child_stops_the_walk() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let first = registry.add_image(None, "first", 1);
    let second = registry.add_image(None, "second", 1);
    registry.fail_blob(&first.layers[0].digest, Duration::ZERO);
    let index = registry.add_index(
        Some("multi"),
        vec![first.descriptor.clone(), second.descriptor.clone()],
    );

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:multi")).await;

    assert!(matches!(outcome, Err(TransferError::Transport(_))));
    let committed = store.committed();
    for digest in second.digests() {
        assert!(!committed.contains(&digest));
    }
    assert!(!committed.contains(&index.digest));
}

#[tokio::test]
async fn test_legacy_manifest_is_rejected_everywhere() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let legacy = registry.add_manifest(
        Some("old"),
        MediaType::DockerManifestSchema1Signed,
        br#"{"schemaVersion":1,"fsLayers":[]}"#,
    );
    let resolver = resolver(&registry, &sink);

    let err = resolver.resolve(&format!("{REPO}:old")).await.unwrap_err();
    assert!(matches!(err, TransferError::UnsupportedLegacySchema(MediaType::DockerManifestSchema1Signed)));

    let resolvable = Resolvable::from_parts(
        REPO.parse().unwrap(),
        legacy,
        resolver.fetcher(REPO).await.unwrap(),
        Platform::new("linux", "amd64"),
        sink.clone(),
    );
    assert!(matches!(
        resolvable.as_collection(),
        Err(TransferError::UnsupportedLegacySchema(_))
    ));
    assert!(matches!(
        resolvable.as_single_artifact().await,
        Err(TransferError::UnsupportedLegacySchema(_))
    ));
    assert!(matches!(
        resolvable.resolve().await,
        Err(TransferError::UnsupportedLegacySchema(_))
    ));
}

#[tokio::test]
async fn test_legacy_child_fails_the_walk() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let legacy = registry.add_manifest(
        None,
        MediaType::DockerManifestSchema1,
        br#"{"schemaVersion":1,"fsLayers":[]}"#,
    );
    registry.add_index(Some("mixed"), vec![legacy]);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:mixed")).await;

    assert!(matches!(
        outcome,
        Err(TransferError::UnsupportedLegacySchema(MediaType::DockerManifestSchema1))
    ));
    assert!(store.committed().is_empty());
}

#[tokio::test]
async fn test_resolve_offers_accept_list_in_order() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("v1"), "app", 1);

    let (name, descriptor) = resolver(&registry, &sink)
        .resolve(&format!("{REPO}:v1"))
        .await
        .unwrap();

    assert_eq!(name, "registry.test/demo:v1");
    assert_eq!(descriptor, image.descriptor);
    let accepts = registry.accepts();
    assert_eq!(
        accepts[0],
        vec![
            MediaType::DockerManifestSchema1,
            MediaType::DockerManifestSchema1Signed,
            MediaType::OciManifestSchema1,
            MediaType::DockerManifestSchema2,
            MediaType::OciImageIndex,
            MediaType::DockerManifestList,
        ]
    );
}

#[tokio::test]
async fn test_pinned_digest_must_match_content() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let pinned = OciDigest::sha256(b"something else");
    registry.insert_raw(
        &pinned.to_string(),
        MediaType::OciManifestSchema1,
        br#"{"schemaVersion":2,"config":{},"layers":[]}"#,
    );

    let err = resolver(&registry, &sink)
        .resolve(&format!("{REPO}@{pinned}"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::DigestMismatch { expected, .. } if expected == pinned));
}

#[tokio::test]
async fn test_platform_selects_matching_child() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let amd64 = registry.add_image(None, "amd64", 1);
    let arm64 = registry.add_image(None, "arm64", 1);
    registry.add_index(
        Some("multi"),
        vec![
            with_platform(amd64.descriptor.clone(), "linux", "amd64"),
            with_platform(arm64.descriptor.clone(), "linux", "arm64"),
        ],
    );

    let resolvable = Resolver::new(registry.clone())
        .with_platform(Platform::new("linux", "arm64"))
        .with_sink(sink.clone())
        .get(&format!("{REPO}:multi"))
        .await
        .unwrap();
    let image = resolvable.as_single_artifact().await.unwrap();

    assert_eq!(image.descriptor().digest, arm64.descriptor.digest);
    assert_eq!(
        image.mount_hint().map(|hint| hint.origin.to_string()),
        Some(format!("{REPO}:multi"))
    );
    assert_eq!(image.layers().await.unwrap(), arm64.layers);
}

#[tokio::test]
async fn test_missing_platform_is_reported() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let amd64 = registry.add_image(None, "amd64", 1);
    registry.add_index(
        Some("multi"),
        vec![with_platform(amd64.descriptor.clone(), "linux", "amd64")],
    );

    let resolvable = Resolver::new(registry.clone())
        .with_platform(Platform::new("linux", "s390x"))
        .get(&format!("{REPO}:multi"))
        .await
        .unwrap();

    assert!(matches!(
        resolvable.as_single_artifact().await,
        Err(TransferError::NoMatchingPlatform(platform)) if platform == "linux/s390x"
    ));
}

#[tokio::test]
async fn test_image_is_not_a_collection() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    registry.add_image(Some("v1"), "app", 1);

    let resolvable = resolver(&registry, &sink)
        .get(&format!("{REPO}:v1"))
        .await
        .unwrap();

    assert!(matches!(
        resolvable.as_collection(),
        Err(TransferError::MediaTypeMismatch { actual: MediaType::OciManifestSchema1, .. })
    ));
    assert!(resolvable.as_single_artifact().await.is_ok());
}

#[tokio::test]
async fn test_missing_content_type_is_tolerated() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("untyped"), "app", 2);
    registry.serve_untyped("untyped");

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:untyped")).await;
    outcome.unwrap();

    assert!(sink.events().iter().any(|event| matches!(
        event,
        Event::MissingContentType { reference } if reference == "registry.test/demo:untyped"
    )));
    assert_eq!(store.committed().last(), Some(&image.descriptor.digest));
}

#[tokio::test]
async fn test_unrecognized_root_is_classified_by_content() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(None, "app", 1);
    let index = registry.add_index(None, vec![image.descriptor.clone()]);
    let garbage = registry.add_manifest(None, MediaType::from("text/plain"), b"{}");
    let fetcher = resolver(&registry, &sink).fetcher(REPO).await.unwrap();

    let relabel = |mut descriptor: imgferry::Descriptor| {
        descriptor.media_type = MediaType::from("application/octet-stream");
        Resolvable::from_parts(
            REPO.parse().unwrap(),
            descriptor,
            fetcher.clone(),
            Platform::new("linux", "amd64"),
            sink.clone(),
        )
    };

    assert!(matches!(relabel(index).resolve().await, Ok(Artifact::Index(_))));
    assert!(matches!(
        relabel(image.descriptor.clone()).resolve().await,
        Ok(Artifact::Image(_))
    ));
    assert!(matches!(
        relabel(garbage).resolve().await,
        Err(TransferError::NeitherArtifactNorCollection(_))
    ));

    let warnings = sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::UnexpectedMediaType { operation: "resolve", .. }))
        .count();
    assert_eq!(warnings, 3);
}

#[tokio::test]
async fn test_unrecognized_child_is_copied_opaquely() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(None, "app", 1);
    let sbom = registry.add_manifest(
        None,
        MediaType::from("application/vnd.example.sbom+json"),
        br#"{"packages":[]}"#,
    );
    let index = registry.add_index(Some("multi"), vec![image.descriptor.clone(), sbom.clone()]);

    let (store, outcome) = copy(&registry, &sink, &format!("{REPO}:multi")).await;
    outcome.unwrap();

    assert!(store.position(&sbom.digest) < store.position(&index.digest));
    assert!(sink.events().contains(&Event::OpaqueChild {
        parent: index.digest.clone(),
        child: sbom.digest.clone(),
    }));
}

#[tokio::test]
async fn test_existing_blobs_are_skipped() {
    let registry = FakeRegistry::new();
    let sink = RecordingSink::new();
    let image = registry.add_image(Some("v1"), "app", 2);

    let store = RecordingStore::new().await;
    let mut session = store.inner.start_upload(&image.layers[0]).await.unwrap();
    session.write(b"app-layer-0").await.unwrap();
    session
        .commit(image.layers[0].size, &image.layers[0].digest)
        .await
        .unwrap();

    let dyn_store: Arc<dyn ContentStore> = store.clone();
    let resolvable = resolver(&registry, &sink)
        .get(&format!("{REPO}:v1"))
        .await
        .unwrap();
    walker(&sink).transfer(&resolvable, &dyn_store).await.unwrap();

    let committed = store.committed();
    assert!(!committed.contains(&image.layers[0].digest));
    assert!(committed.contains(&image.layers[1].digest));
    assert_eq!(committed.last(), Some(&image.descriptor.digest));

    // A second run finds everything in place.
    walker(&sink).transfer(&resolvable, &dyn_store).await.unwrap();
    assert_eq!(store.committed(), committed);
}

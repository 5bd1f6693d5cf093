//! Tests for the pull-through proxy controller
//!
//! Local-vs-proxy decisions, single-flight manifest pushes, index trimming,
//! the bounded dependency wait, blob mirroring and upstream limits.

mod common;

use bytes::Bytes;
use common::*;
use futures::TryStreamExt;
use pullthrough::controller::{ArtifactInfo, ProxyController};
use pullthrough::error::ProxyError;
use pullthrough::limiter::{upstream_key, ConnectionLimiter, MemoryCounterStore};
use pullthrough::quota::QuotaController;
use pullthrough::registry::manifest::{
    Descriptor, Manifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
};
use pullthrough::registry::{HealthStatus, RegistryManager};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const REGISTRY_ID: i64 = 5;

struct Harness {
    upstream: Arc<MemoryRegistry>,
    local: Arc<MemoryRegistry>,
    registries: Arc<pullthrough::registry::ConfiguredRegistries>,
    controller: ProxyController,
    project: pullthrough::project::Project,
}

fn harness() -> Harness {
    init_test_tracing();
    let upstream = MemoryRegistry::new();
    let local = MemoryRegistry::new();
    let registries = registries(&[REGISTRY_ID]);
    let controller = ProxyController::new(
        registries.clone(),
        StaticFactory::new(upstream.clone()),
        local.clone(),
        fast_timing(),
    );
    Harness {
        upstream,
        local,
        registries,
        controller,
        project: proxy_project(1, "proxy", REGISTRY_ID),
    }
}

/// Poll `check` until it holds or two seconds pass
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn layer(data: &[u8]) -> Descriptor {
    blob_descriptor(data)
}

#[tokio::test]
async fn test_use_local_manifest_without_upstream() {
    let h = harness();
    let art = ArtifactInfo::parse("library/alpine", "latest").unwrap();
    assert!(h.controller.use_local_manifest(&local_project(9, "library"), &art).await);

    // Registry id that is not configured
    let orphan = proxy_project(2, "orphan", 77);
    let art = ArtifactInfo::parse("orphan/alpine", "latest").unwrap();
    assert!(h.controller.use_local_manifest(&orphan, &art).await);
}

#[tokio::test]
async fn test_use_local_manifest_tag_is_proxied_when_healthy() {
    let h = harness();
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();
    assert!(!h.controller.use_local_manifest(&h.project, &art).await);
}

#[tokio::test]
async fn test_use_local_manifest_digest_checks_local_existence() {
    let h = harness();
    let payload = image_manifest(&layer(b"cfg"), &[layer(b"l1")]);
    let digest = h
        .local
        .add_manifest("proxy/library/alpine", "", MEDIA_TYPE_DOCKER_MANIFEST, payload);

    let present = ArtifactInfo::parse("proxy/library/alpine", &digest).unwrap();
    assert!(h.controller.use_local_manifest(&h.project, &present).await);

    let missing = ArtifactInfo::parse(
        "proxy/library/alpine",
        "sha256:0000000000000000000000000000000000000000000000000000000000000000",
    )
    .unwrap();
    assert!(!h.controller.use_local_manifest(&h.project, &missing).await);
}

#[tokio::test]
async fn test_use_local_manifest_when_registry_unhealthy() {
    let h = harness();
    h.registries
        .set_status(REGISTRY_ID, HealthStatus::Unhealthy)
        .await
        .unwrap();
    let art = ArtifactInfo::parse("proxy/library/alpine", "latest").unwrap();
    assert!(h.controller.use_local_manifest(&h.project, &art).await);

    h.registries
        .set_status(REGISTRY_ID, HealthStatus::Healthy)
        .await
        .unwrap();
    assert!(!h.controller.use_local_manifest(&h.project, &art).await);
}

#[tokio::test]
async fn test_use_local_when_adapter_cannot_be_built() {
    let upstream = MemoryRegistry::new();
    let local = MemoryRegistry::new();
    let controller = ProxyController::new(
        registries(&[REGISTRY_ID]),
        StaticFactory::failing(upstream),
        local,
        fast_timing(),
    );
    let project = proxy_project(1, "proxy", REGISTRY_ID);
    let art = ArtifactInfo::parse("proxy/library/alpine", "latest").unwrap();
    assert!(controller.use_local_manifest(&project, &art).await);
    assert!(controller.use_local_blob(&project, "sha256:abcd").await);
}

#[tokio::test]
async fn test_use_local_blob() {
    let h = harness();
    let desc = h.local.add_blob(b"layer-bytes");
    assert!(h.controller.use_local_blob(&h.project, &desc.digest).await);
    assert!(!h.controller.use_local_blob(&h.project, "sha256:abcdef").await);

    // An existence lookup error means "not local"
    h.local.mark_broken("sha256:bad0");
    assert!(!h.controller.use_local_blob(&h.project, "sha256:bad0").await);

    h.registries
        .set_status(REGISTRY_ID, HealthStatus::Unknown)
        .await
        .unwrap();
    assert!(h.controller.use_local_blob(&h.project, "sha256:abcdef").await);
}

#[tokio::test]
async fn test_put_manifest_single_flight() {
    let h = harness();
    h.local.set_push_delay(Duration::from_millis(200));
    let payload = image_manifest(&layer(b"cfg"), &[layer(b"l1")]);
    let manifest = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST), payload).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let controller = h.controller.clone();
        let manifest = manifest.clone();
        handles.push(tokio::spawn(async move {
            controller
                .put_manifest_to_local_repo("proxy/library/alpine", &manifest, "3.19")
                .await
                .unwrap()
        }));
    }

    let mut pushed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            pushed += 1;
        }
    }
    assert_eq!(pushed, 1);
    assert_eq!(h.local.manifest_push_count(), 1);
    assert!(h.controller.inflight().is_empty());

    // The key is free again once the push finished
    h.local.set_push_delay(Duration::ZERO);
    assert!(h
        .controller
        .put_manifest_to_local_repo("proxy/library/alpine", &manifest, "3.19")
        .await
        .unwrap());
    assert_eq!(h.local.manifest_push_count(), 2);
}

#[tokio::test]
async fn test_put_manifest_different_tags_do_not_block() {
    let h = harness();
    h.local.set_push_delay(Duration::from_millis(100));
    let payload = image_manifest(&layer(b"cfg"), &[layer(b"l1")]);
    let manifest = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST), payload).unwrap();

    let (a, b) = tokio::join!(
        h.controller
            .put_manifest_to_local_repo("proxy/library/alpine", &manifest, "3.18"),
        h.controller
            .put_manifest_to_local_repo("proxy/library/alpine", &manifest, "3.19"),
    );
    assert!(a.unwrap());
    assert!(b.unwrap());
    assert_eq!(h.local.manifest_push_count(), 2);
}

#[tokio::test]
async fn test_put_manifest_empty_tag_defaults_to_latest() {
    let h = harness();
    let payload = image_manifest(&layer(b"cfg"), &[layer(b"l1")]);
    let manifest = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST), payload).unwrap();

    assert!(h
        .controller
        .put_manifest_to_local_repo("proxy/library/alpine", &manifest, "")
        .await
        .unwrap());
    let push = h.local.last_manifest_push().unwrap();
    assert_eq!(push.tag, "latest");
    assert_eq!(push.digest, manifest.digest());
}

#[tokio::test]
async fn test_index_trimmed_to_present_children() {
    let h = harness();
    let child_a = Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, "sha256:aaaa", 100);
    let child_b = Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, "sha256:bbbb", 200);
    let child_c = Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, "sha256:cccc", 300);
    h.local.mark_present(&child_a.digest);
    h.local.mark_present(&child_b.digest);

    let payload = manifest_list(&[child_a.clone(), child_b.clone(), child_c]);
    let index = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST_LIST), payload).unwrap();
    let art = ArtifactInfo::parse("proxy/library/alpine", "multi").unwrap();

    h.controller
        .wait_and_push_manifest(&h.project, &art, index, h.upstream.clone())
        .await;

    let push = h.local.last_manifest_push().expect("index pushed");
    assert_eq!(push.repository, "proxy/library/alpine");
    assert_eq!(push.tag, "multi");

    let stored = h.local.manifest_payload(&push.digest).unwrap();
    let Manifest::Index(trimmed) = Manifest::parse(None, stored).unwrap() else {
        panic!("pushed manifest is not an index");
    };
    let digests: Vec<&str> = trimmed.manifests.iter().map(|d| d.digest.as_str()).collect();
    assert_eq!(digests, vec![child_a.digest.as_str(), child_b.digest.as_str()]);
    assert_eq!(trimmed.media_type, MEDIA_TYPE_DOCKER_MANIFEST_LIST);
}

#[tokio::test]
async fn test_index_without_present_children_is_not_pushed() {
    let h = harness();
    let payload = manifest_list(&[
        Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, "sha256:aaaa", 100),
        Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, "sha256:bbbb", 200),
    ]);
    let index = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST_LIST), payload).unwrap();
    let art = ArtifactInfo::parse("proxy/library/alpine", "multi").unwrap();

    h.controller
        .wait_and_push_manifest(&h.project, &art, index, h.upstream.clone())
        .await;
    assert_eq!(h.local.manifest_push_count(), 0);
}

#[tokio::test]
async fn test_image_pushed_once_dependencies_land() {
    let h = harness();
    let config = h.local.add_blob(b"config");
    let l1 = h.local.add_blob(b"layer-one");
    let payload = image_manifest(&config, &[l1]);
    let image = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST), payload).unwrap();
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    let started = Instant::now();
    h.controller
        .wait_and_push_manifest(&h.project, &art, image.clone(), h.upstream.clone())
        .await;

    assert_eq!(h.local.manifest_push_count(), 1);
    assert_eq!(h.local.last_manifest_push().unwrap().digest, image.digest());
    // One polling round only
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.upstream.blob_pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_image_pushed_after_bounded_wait() {
    let h = harness();
    let config = h.local.add_blob(b"config");
    // Missing locally and upstream: the force push fails, the manifest goes out anyway
    let ghost = layer(b"never-arrives");
    let payload = image_manifest(&config, &[ghost.clone()]);
    let image = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST), payload).unwrap();
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    let timing = fast_timing();
    let started = Instant::now();
    h.controller
        .wait_and_push_manifest(&h.project, &art, image, h.upstream.clone())
        .await;

    assert!(started.elapsed() >= timing.sleep_interval() * timing.max_wait);
    assert_eq!(h.local.manifest_push_count(), 1);
    // Exactly max_wait polling rounds, plus the force push's own check on the ghost
    let rounds = timing.max_wait as usize;
    assert_eq!(h.local.exist_count(&config.digest), rounds);
    assert_eq!(h.local.exist_count(&ghost.digest), rounds + 1);
    // Force push tried to fetch the missing layer once
    assert_eq!(h.upstream.blob_pulls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_manifest_pushed_when_force_push_outlasts_wait() {
    let h = harness();
    // Slower than the dependency wait budget
    h.upstream.set_pull_delay(Duration::from_secs(3));
    let config = h.local.add_blob(b"config");
    let slow = h.upstream.add_blob(b"slow-upstream-layer");
    let payload = image_manifest(&config, &[slow.clone()]);
    let digest = h.upstream.add_manifest(
        "library/alpine",
        "3.19",
        MEDIA_TYPE_DOCKER_MANIFEST,
        payload,
    );
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    h.controller.proxy_manifest(&h.project, &art).await.unwrap();
    h.controller.tasks().wait_idle().await;

    let push = h.local.last_manifest_push().expect("manifest pushed after the wait ran out");
    assert_eq!(push.digest, digest);
    assert_eq!(push.tag, "3.19");
    // The layer copy was cut off with the wait
    assert!(!h.local.has_blob(&slow.digest));
    assert_eq!(h.local.blob_push_count(), 0);
}

#[tokio::test]
async fn test_blob_push_reserves_size_when_descriptor_has_none() {
    let h = harness();
    let quota = Arc::new(QuotaController::new());
    quota.set_limit(h.project.id, 100).await;
    let controller = h.controller.clone().with_quota(quota.clone());

    let real = h.upstream.add_blob(&[2u8; 1024]);
    let unsized_desc = Descriptor::new(real.media_type.clone(), real.digest.clone(), 0);
    let art = ArtifactInfo::parse("proxy/library/alpine", &real.digest).unwrap();

    let err = controller
        .push_blob_with_quota(&h.project, &art, &unsized_desc, h.upstream.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Quota(_)));
    assert_eq!(h.local.blob_push_count(), 0);
    assert_eq!(quota.used(h.project.id).await, 0);

    // Within the limit the looked-up size is what stays reserved
    quota.set_limit(h.project.id, 4096).await;
    controller
        .push_blob_with_quota(&h.project, &art, &unsized_desc, h.upstream.clone())
        .await
        .unwrap();
    assert_eq!(h.local.blob_push_count(), 1);
    assert_eq!(quota.used(h.project.id).await, 1024);
}

#[tokio::test]
async fn test_missing_layers_force_pushed_before_final_round() {
    let h = harness();
    let config = h.local.add_blob(b"config");
    let l1 = h.upstream.add_blob(b"upstream-only-layer");
    let payload = image_manifest(&config, &[l1.clone()]);
    let image = Manifest::parse(Some(MEDIA_TYPE_DOCKER_MANIFEST), payload).unwrap();
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    h.controller
        .wait_and_push_manifest(&h.project, &art, image, h.upstream.clone())
        .await;

    assert!(h.local.has_blob(&l1.digest));
    assert_eq!(h.local.blob_push_count(), 1);
    assert_eq!(h.local.manifest_push_count(), 1);
}

#[tokio::test]
async fn test_proxy_manifest_mirrors_in_background() {
    let h = harness();
    let config = h.local.add_blob(b"config");
    let l1 = h.local.add_blob(b"layer");
    let payload = image_manifest(&config, &[l1]);
    let digest = h.upstream.add_manifest(
        "library/alpine",
        "3.19",
        MEDIA_TYPE_DOCKER_MANIFEST,
        payload.clone(),
    );
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    let proxied = h.controller.proxy_manifest(&h.project, &art).await.unwrap();
    assert_eq!(proxied.digest, digest);
    assert_eq!(proxied.media_type, MEDIA_TYPE_DOCKER_MANIFEST);
    assert_eq!(proxied.payload, payload);

    h.controller.tasks().wait_idle().await;
    let push = h.local.last_manifest_push().expect("manifest mirrored");
    assert_eq!(push.repository, "proxy/library/alpine");
    assert_eq!(push.tag, "3.19");
    assert_eq!(push.digest, digest);
}

#[tokio::test]
async fn test_proxy_manifest_head_does_not_mirror() {
    let h = harness();
    let payload = image_manifest(&layer(b"cfg"), &[layer(b"l1")]);
    h.upstream
        .add_manifest("library/alpine", "3.19", MEDIA_TYPE_DOCKER_MANIFEST, payload);
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    h.controller
        .proxy_manifest_head(&h.project, &art)
        .await
        .unwrap();
    assert!(h.controller.tasks().is_empty());
    assert_eq!(h.local.manifest_push_count(), 0);
}

#[tokio::test]
async fn test_upstream_not_found_cleans_local_tag() {
    let h = harness();
    let art = ArtifactInfo::parse("proxy/library/alpine", "gone").unwrap();

    let err = h
        .controller
        .proxy_manifest(&h.project, &art)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    h.controller.tasks().wait_idle().await;
    let deleted = h.local.deleted_tags.lock().unwrap().clone();
    assert_eq!(
        deleted,
        vec![("proxy/library/alpine".to_string(), "gone".to_string())]
    );
}

#[tokio::test]
async fn test_proxy_blob_streams_and_mirrors_once() {
    let h = harness();
    let digest = "sha256:deadbeef";
    let data = Bytes::from(vec![7u8; 1024]);
    h.upstream.add_blob_with_digest(digest, data.clone());
    let art = ArtifactInfo::parse("proxy/library/alpine", digest).unwrap();

    let blob = h
        .controller
        .proxy_blob(&h.project, &art, digest)
        .await
        .unwrap();
    assert_eq!(blob.descriptor.size, 1024);
    assert_eq!(blob.descriptor.digest, digest);

    let chunks: Vec<Bytes> = blob.body.try_collect().await.unwrap();
    let received: usize = chunks.iter().map(|c| c.len()).sum();
    assert_eq!(received, 1024);

    let local = h.local.clone();
    assert!(eventually(|| local.blob_push_count() == 1).await);
    h.controller.tasks().wait_idle().await;

    assert_eq!(h.local.blob_push_count(), 1);
    assert!(h.local.has_blob(digest));
    let pushes = h.local.blob_pushes.lock().unwrap().clone();
    assert_eq!(pushes[0], ("proxy/library/alpine".to_string(), digest.to_string()));

    // Now served locally
    assert!(h.controller.use_local_blob(&h.project, digest).await);
}

#[tokio::test]
async fn test_blob_push_skipped_when_already_local() {
    let h = harness();
    let desc = h.upstream.add_blob(b"shared-layer");
    h.local.add_blob(b"shared-layer");
    let art = ArtifactInfo::parse("proxy/library/alpine", &desc.digest).unwrap();

    h.controller
        .push_blob_with_quota(&h.project, &art, &desc, h.upstream.clone())
        .await
        .unwrap();
    assert_eq!(h.local.blob_push_count(), 0);
    assert_eq!(h.upstream.blob_pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_blob_push_denied_over_quota() {
    let h = harness();
    let quota = Arc::new(QuotaController::new());
    quota.set_limit(h.project.id, 100).await;
    let controller = h.controller.clone().with_quota(quota.clone());

    let desc = h.upstream.add_blob(&[1u8; 1024]);
    let art = ArtifactInfo::parse("proxy/library/alpine", &desc.digest).unwrap();

    let err = controller
        .push_blob_with_quota(&h.project, &art, &desc, h.upstream.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Quota(_)));
    assert_eq!(h.local.blob_push_count(), 0);
    assert_eq!(h.upstream.blob_pulls.load(Ordering::SeqCst), 0);
    assert_eq!(quota.used(h.project.id).await, 0);
}

#[tokio::test]
async fn test_upstream_connection_limit() {
    let h = harness();
    let limiter = Arc::new(ConnectionLimiter::new(Arc::new(MemoryCounterStore::new())));
    let controller = h.controller.clone().with_limiter(limiter.clone());
    let mut project = h.project.clone();
    project.max_upstream_connections = 1;

    let payload = image_manifest(&layer(b"cfg"), &[layer(b"l1")]);
    h.upstream
        .add_manifest("library/alpine", "3.19", MEDIA_TYPE_DOCKER_MANIFEST, payload);
    let art = ArtifactInfo::parse("proxy/library/alpine", "3.19").unwrap();

    let held = limiter
        .permit(&upstream_key(REGISTRY_ID), 1)
        .await
        .expect("first slot");
    let err = controller
        .proxy_manifest_head(&project, &art)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::TooManyRequests(_)));
    assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);

    held.release().await;
    controller
        .proxy_manifest_head(&project, &art)
        .await
        .unwrap();
    // The foreground pull released its slot
    assert_eq!(limiter.in_use(&upstream_key(REGISTRY_ID)).await.unwrap(), 0);
}

//! Tests for manifest parsing and index trimming

mod common;

use bytes::Bytes;
use common::{blob_descriptor, image_manifest, manifest_list};
use pullthrough::registry::manifest::{
    digest_of, is_digest, is_index_media_type, Descriptor, Manifest, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_DOCKER_SCHEMA1, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};

fn child(digest: &str) -> Descriptor {
    Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, digest, 500)
}

#[test]
fn test_parse_image_manifest() {
    let config = blob_descriptor(b"config");
    let l1 = blob_descriptor(b"layer-1");
    let l2 = blob_descriptor(b"layer-2");
    let payload = image_manifest(&config, &[l1.clone(), l2.clone()]);

    let manifest = Manifest::parse(None, payload.clone()).unwrap();
    assert!(!manifest.is_index());
    assert_eq!(manifest.media_type(), MEDIA_TYPE_DOCKER_MANIFEST);
    assert_eq!(manifest.payload(), &payload);
    assert_eq!(manifest.digest(), digest_of(&payload));

    let refs: Vec<String> = manifest.references().into_iter().map(|d| d.digest).collect();
    assert_eq!(refs, vec![config.digest, l1.digest, l2.digest]);
}

#[test]
fn test_parse_manifest_list() {
    let payload = manifest_list(&[child("sha256:aa"), child("sha256:bb")]);
    let manifest = Manifest::parse(None, payload).unwrap();

    let Manifest::Index(index) = &manifest else {
        panic!("expected an index");
    };
    assert_eq!(index.media_type, MEDIA_TYPE_DOCKER_MANIFEST_LIST);
    assert_eq!(index.manifests.len(), 2);
    assert_eq!(manifest.references().len(), 2);
}

#[test]
fn test_oci_index_without_media_type_field() {
    let payload = Bytes::from_static(
        br#"{"schemaVersion":2,"manifests":[{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"sha256:aa","size":10}]}"#,
    );
    let manifest = Manifest::parse(None, payload).unwrap();
    assert!(manifest.is_index());
    assert_eq!(manifest.media_type(), MEDIA_TYPE_OCI_INDEX);
}

#[test]
fn test_content_type_wins_over_embedded_media_type() {
    let payload = image_manifest(&blob_descriptor(b"cfg"), &[blob_descriptor(b"l")]);
    let manifest = Manifest::parse(
        Some("application/vnd.oci.image.manifest.v1+json; charset=utf-8"),
        payload.clone(),
    )
    .unwrap();
    assert_eq!(manifest.media_type(), MEDIA_TYPE_OCI_MANIFEST);

    // Generic JSON content types fall back to the payload
    let manifest = Manifest::parse(Some("application/json"), payload).unwrap();
    assert_eq!(manifest.media_type(), MEDIA_TYPE_DOCKER_MANIFEST);
}

#[test]
fn test_parse_schema1_dedups_layers() {
    let payload = Bytes::from_static(
        br#"{"schemaVersion":1,"name":"library/alpine","tag":"3","fsLayers":[{"blobSum":"sha256:aa"},{"blobSum":"sha256:bb"},{"blobSum":"sha256:aa"}]}"#,
    );
    let manifest = Manifest::parse(None, payload).unwrap();
    assert_eq!(manifest.media_type(), MEDIA_TYPE_DOCKER_SCHEMA1);

    let refs: Vec<String> = manifest.references().into_iter().map(|d| d.digest).collect();
    assert_eq!(refs, vec!["sha256:aa".to_string(), "sha256:bb".to_string()]);
}

#[test]
fn test_parse_rejects_invalid_payloads() {
    assert!(Manifest::parse(None, Bytes::from_static(b"not json")).is_err());
    assert!(Manifest::parse(None, Bytes::from_static(br#"{"schemaVersion":2}"#)).is_err());
}

#[test]
fn test_retain_subset_rewrites_payload() {
    let payload = manifest_list(&[child("sha256:aa"), child("sha256:bb"), child("sha256:cc")]);
    let Manifest::Index(index) = Manifest::parse(None, payload.clone()).unwrap() else {
        panic!("expected an index");
    };

    let trimmed = index
        .retain(|d| d.digest != "sha256:bb")
        .unwrap()
        .expect("children left");
    let kept: Vec<&str> = trimmed.manifests.iter().map(|d| d.digest.as_str()).collect();
    assert_eq!(kept, vec!["sha256:aa", "sha256:cc"]);
    assert_ne!(trimmed.payload(), &payload);

    // The new payload parses back to the same children
    let reparsed = Manifest::parse(None, trimmed.payload().clone()).unwrap();
    assert_eq!(reparsed.references().len(), 2);
    assert_eq!(reparsed.media_type(), MEDIA_TYPE_DOCKER_MANIFEST_LIST);
}

#[test]
fn test_retain_all_keeps_payload() {
    let payload = manifest_list(&[child("sha256:aa"), child("sha256:bb")]);
    let Manifest::Index(index) = Manifest::parse(None, payload.clone()).unwrap() else {
        panic!("expected an index");
    };
    let same = index.retain(|_| true).unwrap().unwrap();
    assert_eq!(same.payload(), &payload);
}

#[test]
fn test_retain_nothing_yields_none() {
    let payload = manifest_list(&[child("sha256:aa")]);
    let Manifest::Index(index) = Manifest::parse(None, payload).unwrap() else {
        panic!("expected an index");
    };
    assert!(index.retain(|_| false).unwrap().is_none());
}

#[test]
fn test_digest_helpers() {
    assert_eq!(
        digest_of(b""),
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert!(is_digest("sha256:deadbeef"));
    assert!(!is_digest("latest"));
    assert!(!is_digest("sha256:"));
    assert!(!is_digest("v1:not-hex"));

    assert!(is_index_media_type(MEDIA_TYPE_OCI_INDEX));
    assert!(is_index_media_type(
        "application/vnd.docker.distribution.manifest.list.v2+json; charset=utf-8"
    ));
    assert!(!is_index_media_type(MEDIA_TYPE_DOCKER_MANIFEST));
}

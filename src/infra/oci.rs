//! Media types, annotations and index lookups over `oci_spec` documents.

use oci_spec::image::{Descriptor, ImageIndex};

use crate::domain::Platform;

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_INTOTO: &str = "application/vnd.in-toto+json";

/// Every manifest media type the client is willing to receive
pub const MANIFEST_ACCEPT: &[&str] = &[
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST,
];

pub const ANNOTATION_REFERENCE_TYPE: &str = "vnd.docker.reference.type";
pub const ANNOTATION_REFERENCE_DIGEST: &str = "vnd.docker.reference.digest";
pub const ANNOTATION_PREDICATE_TYPE: &str = "in-toto.io/predicate-type";
pub const ANNOTATION_TUF_FILENAME: &str = "tuf.io/filename";

pub const ATTESTATION_MANIFEST_TYPE: &str = "attestation-manifest";

/// Value of one descriptor annotation
pub fn annotation<'a>(descriptor: &'a Descriptor, key: &str) -> Option<&'a str> {
    descriptor
        .annotations()
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Whether a descriptor declares `artifact_type`
pub fn has_artifact_type(descriptor: &Descriptor, artifact_type: &str) -> bool {
    descriptor
        .artifact_type()
        .as_ref()
        .is_some_and(|declared| declared.to_string() == artifact_type)
}

fn is_attestation_manifest(descriptor: &Descriptor) -> bool {
    annotation(descriptor, ANNOTATION_REFERENCE_TYPE) == Some(ATTESTATION_MANIFEST_TYPE)
}

fn matches_platform(descriptor: &Descriptor, platform: &Platform) -> bool {
    descriptor.platform().as_ref().is_some_and(|p| {
        p.os().to_string() == platform.os
            && p.architecture().to_string() == platform.architecture
            && (platform.variant.is_none() || p.variant() == &platform.variant)
    })
}

/// The manifest built for `platform`, ignoring attestation manifests
pub fn manifest_for<'a>(index: &'a ImageIndex, platform: &Platform) -> Option<&'a Descriptor> {
    index
        .manifests()
        .iter()
        .find(|m| !is_attestation_manifest(m) && matches_platform(m, platform))
}

/// The attestation manifest attached for the image manifest `digest`
pub fn attestation_manifest_for<'a>(index: &'a ImageIndex, digest: &str) -> Option<&'a Descriptor> {
    index.manifests().iter().find(|m| {
        is_attestation_manifest(m) && annotation(m, ANNOTATION_REFERENCE_DIGEST) == Some(digest)
    })
}

/// Whether a media type names an index rather than a single manifest
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_LIST
}

//! Parsing of the [`SERVICE_TAGS`] annotation.
//!
//! Tags are registered twice: on the sidecar proxy ("mesh") registration and on the plain service
//! registration. Fabio routes HTTP traffic based on `urlprefix-` tags, and it must not route to
//! the sidecar proxy, so these tags are only added to the plain service unless
//! [`SKIP_FABIO_TAGS`] is set to `false`.
use crate::annotations::{SERVICE_TAGS, SKIP_FABIO_TAGS, WorkloadMetadata};

/// Tags starting with this prefix are reserved for Fabio.
pub const FORWARDING_TAG_PREFIX: &str = "urlprefix-";

/// The tags of both service registrations, in annotation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSet {
    /// Tags of the sidecar proxy registration.
    pub mesh_tags: Vec<String>,

    /// Tags of the plain service registration.
    pub host_tags: Vec<String>,
}

impl TagSet {
    pub fn is_empty(&self) -> bool {
        self.mesh_tags.is_empty() && self.host_tags.is_empty()
    }
}

/// Returns whether forwarding tags should be excluded from the mesh registration.
pub fn exclude_forwarding_tags(metadata: &WorkloadMetadata) -> bool {
    metadata.flag(SKIP_FABIO_TAGS, true)
}

pub fn is_forwarding_tag(tag: &str) -> bool {
    tag.starts_with(FORWARDING_TAG_PREFIX)
}

/// Splits the tag annotation into the [`TagSet`].
///
/// Tags are used verbatim, no whitespace is trimmed.
pub fn parse_tags(metadata: &WorkloadMetadata, exclude_forwarding_tags: bool) -> TagSet {
    let mut tag_set = TagSet::default();

    let Some(raw) = metadata.get_non_empty(SERVICE_TAGS) else {
        return tag_set;
    };

    for tag in raw.split(',') {
        if !(exclude_forwarding_tags && is_forwarding_tag(tag)) {
            tag_set.mesh_tags.push(tag.to_owned());
        }
        tag_set.host_tags.push(tag.to_owned());
    }

    tag_set
}

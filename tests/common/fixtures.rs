//! Payload and NZB fixtures

use media_acquire::InMemoryConnector;
use media_acquire::provider::{PostedSegment, nzb_document};

/// Deterministic bytes that differ per `seed`
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// A file posted to the store
pub struct Posted {
    pub name: String,
    pub data: Vec<u8>,
    pub segments: Vec<PostedSegment>,
}

/// Post `data` as `name` in parts of `part_size` to every listed provider
pub fn post(
    connector: &InMemoryConnector,
    providers: &[&str],
    name: &str,
    data: Vec<u8>,
    part_size: usize,
) -> Posted {
    let segments = connector
        .post_file(providers, name, &data, part_size)
        .unwrap();
    Posted {
        name: name.to_string(),
        data,
        segments,
    }
}

/// NZB document listing every posted file in order
pub fn nzb_for(files: &[&Posted]) -> Vec<u8> {
    let listed: Vec<(&str, &[PostedSegment])> = files
        .iter()
        .map(|f| (f.name.as_str(), f.segments.as_slice()))
        .collect();
    nzb_document(&listed)
}

//! Term segmentation.

use talon_common::schema::SegmentType;
use xxhash_rust::xxh3::xxh3_64;

/// Split a document value into index terms.
pub fn segment_text(text: &str, segment_type: SegmentType) -> Vec<String> {
    let mut terms: Vec<String> = match segment_type {
        SegmentType::NoSegment => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text.to_string()]
            }
        }
        SegmentType::Unigrams => text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_lowercase().collect())
            .collect(),
        SegmentType::Words => {
            text.split_whitespace().map(|w| w.to_lowercase()).collect()
        }
    };
    terms.sort_unstable();
    terms.dedup();
    terms
}

/// Cache key for a document value's segmentation.
pub fn word_sign(text: &str) -> u64 {
    xxh3_64(text.as_bytes())
}

//! Scale correction along a segment's ancestor chain.
//!
//! A segment's local translation is expressed in its parent's frame, which is
//! stretched by the static scale of every ancestor. Dividing by the product of
//! those scales recovers an unscaled translation. The chain is re-read from
//! the backend on every call so nothing leaks across frames.

use tracing::warn;

use crate::{Output, StreamBackend};

/// Upper bound on ancestors visited, guarding against cyclic parent data.
pub const MAX_CHAIN_DEPTH: usize = 128;

/// Product of the static scales of every ancestor of `segment`.
///
/// Zero axes are skipped rather than multiplied in. Ancestors whose scale
/// query fails contribute nothing. The walk ends at the first failed or empty
/// parent lookup.
pub fn accumulated_scale(backend: &dyn StreamBackend, subject: &str, segment: &str) -> [f64; 3] {
    let mut scale = [1.0_f64; 3];
    let mut current = segment.to_string();

    for _ in 0..MAX_CHAIN_DEPTH {
        let parent = match backend.segment_parent_name(subject, &current).ok() {
            Some(parent) if !parent.is_empty() => parent,
            _ => return scale,
        };

        if let Some(parent_scale) = backend.segment_static_scale(subject, &parent).ok() {
            for (acc, factor) in scale.iter_mut().zip(parent_scale) {
                if factor != 0.0 {
                    *acc *= factor;
                }
            }
        }
        current = parent;
    }

    warn!(
        subject,
        segment,
        depth = MAX_CHAIN_DEPTH,
        "segment hierarchy too deep, scale truncated"
    );
    scale
}

/// Local translation of `segment` with the ancestor scale divided out.
///
/// The status is the status of the translation query; failures while walking
/// the chain only shorten the accumulated scale.
pub fn scaled_translation(
    backend: &dyn StreamBackend,
    subject: &str,
    segment: &str,
) -> Output<[f64; 3]> {
    let scale = accumulated_scale(backend, subject, segment);
    backend
        .segment_local_translation(subject, segment)
        .map(|raw| [raw[0] / scale[0], raw[1] / scale[1], raw[2] / scale[2]])
}

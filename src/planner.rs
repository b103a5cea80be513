//! Fragment planner
//!
//! Computes fragment count, byte ranges and sidecar paths from the content
//! length and the planner bounds. This is the sole source of truth for
//! fragment ranges; the same inputs always produce the same plan.

use std::collections::BTreeMap;
use std::path::Path;

use crate::model::Fragment;

/// Outcome of planning one download
#[derive(Debug, Clone)]
pub struct FragmentPlan {
    /// Effective concurrency bound; forced to 1 for single-fragment plans
    pub max_conc_fragments: usize,
    pub fragments: BTreeMap<usize, Fragment>,
}

/// Plan the fragments for a download.
///
/// - A file at or below `min_fragment_size` (including the unknown-size case
///   of 0) yields exactly one fragment and a concurrency of 1.
/// - A file below `max_fragment_size` is split relative to the concurrency
///   bound; a bound of 1 falls back to the single-fragment case.
/// - Anything larger is cut into `max_fragment_size` pieces.
///
/// The trailing fragment absorbs the remainder and may be shorter; when the
/// size divides evenly it is zero-length (`end < start`) and is never fetched.
pub fn plan(
    file: &Path,
    file_size: u64,
    max_fragment_size: u64,
    min_fragment_size: u64,
    max_conc_fragments: usize,
) -> FragmentPlan {
    if file_size <= min_fragment_size {
        return single_fragment(file, file_size);
    }

    let fragment_size = if file_size < max_fragment_size {
        if max_conc_fragments <= 1 {
            return single_fragment(file, file_size);
        }
        (file_size / (max_conc_fragments as u64 - 1)).max(1)
    } else {
        max_fragment_size
    };

    let count = (file_size / fragment_size) as usize + 1;
    let mut fragments = BTreeMap::new();
    for i in 0..count {
        let start = i as u64 * fragment_size;
        let end = if i == count - 1 {
            file_size - 1
        } else {
            start + fragment_size - 1
        };
        fragments.insert(i, Fragment::new(i, start, end, sidecar_path(file, i)));
    }

    FragmentPlan {
        max_conc_fragments,
        fragments,
    }
}

fn single_fragment(file: &Path, file_size: u64) -> FragmentPlan {
    let mut fragments = BTreeMap::new();
    fragments.insert(
        0,
        Fragment::new(0, 0, file_size.saturating_sub(1), sidecar_path(file, 0)),
    );
    FragmentPlan {
        max_conc_fragments: 1,
        fragments,
    }
}

/// Sidecar file path `<artefact>.<index>`
fn sidecar_path(file: &Path, index: usize) -> std::path::PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    name.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MIB: u64 = 1024 * 1024;

    fn target() -> PathBuf {
        PathBuf::from("/tmp/artefact.bin")
    }

    /// Non-empty fragments must partition [0, file_size)
    fn assert_partition(plan: &FragmentPlan, file_size: u64) {
        let mut expected_start = 0u64;
        for fragment in plan.fragments.values().filter(|f| !f.is_empty()) {
            assert_eq!(fragment.start, expected_start);
            assert!(fragment.end < file_size);
            expected_start = fragment.end + 1;
        }
        assert_eq!(expected_start, file_size);
    }

    #[test]
    fn small_file_is_a_single_fragment() {
        let plan = plan(&target(), 1024, 8 * MIB, 4096, 4);
        assert_eq!(plan.fragments.len(), 1);
        assert_eq!(plan.max_conc_fragments, 1);
        let fragment = &plan.fragments[&0];
        assert_eq!((fragment.start, fragment.end), (0, 1023));
        assert_eq!(fragment.filename, PathBuf::from("/tmp/artefact.bin.0"));
        assert_partition(&plan, 1024);
    }

    #[test]
    fn unknown_size_is_a_single_fragment() {
        let plan = plan(&target(), 0, 8 * MIB, MIB, 4);
        assert_eq!(plan.fragments.len(), 1);
        assert_eq!(plan.max_conc_fragments, 1);
        assert_eq!(plan.fragments[&0].start, 0);
        assert_eq!(plan.fragments[&0].end, 0);
    }

    #[test]
    fn large_file_cuts_at_max_fragment_size() {
        // 10 MiB at 1 MiB pieces: ten full fragments plus a zero-length tail
        let plan = plan(&target(), 10 * MIB, MIB, 4096, 4);
        assert_eq!(plan.fragments.len(), 11);
        assert_eq!(plan.max_conc_fragments, 4);
        for i in 0..10 {
            let fragment = &plan.fragments[&i];
            assert_eq!(fragment.start, i as u64 * MIB);
            assert_eq!(fragment.end, (i as u64 + 1) * MIB - 1);
            assert_eq!(fragment.size(), MIB);
        }
        let tail = &plan.fragments[&10];
        assert!(tail.is_empty());
        assert_eq!(tail.size(), 0);
        assert_partition(&plan, 10 * MIB);
    }

    #[test]
    fn mid_size_file_splits_by_concurrency() {
        // 5000 bytes, bounds (min 1000, max 10000), concurrency 4:
        // fragment size 5000 / 3 = 1666
        let plan = plan(&target(), 5000, 10000, 1000, 4);
        assert_eq!(plan.fragments.len(), 4);
        assert_eq!(plan.fragments[&0].size(), 1666);
        assert_eq!(plan.fragments[&3].end, 4999);
        assert_partition(&plan, 5000);
    }

    #[test]
    fn mid_size_with_single_concurrency_falls_back() {
        // guard against division by zero in the middle branch
        let plan = plan(&target(), 5000, 10000, 1000, 1);
        assert_eq!(plan.fragments.len(), 1);
        assert_eq!(plan.max_conc_fragments, 1);
        assert_partition(&plan, 5000);
    }

    #[test]
    fn remainder_lands_in_the_tail() {
        let plan = plan(&target(), 2500, 1000, 100, 4);
        assert_eq!(plan.fragments.len(), 3);
        assert_eq!(plan.fragments[&2].size(), 500);
        assert_partition(&plan, 2500);
    }

    #[test]
    fn planner_is_deterministic() {
        let a = plan(&target(), 123_456_789, 8 * MIB, MIB, 7);
        let b = plan(&target(), 123_456_789, 8 * MIB, MIB, 7);
        assert_eq!(a.fragments.len(), b.fragments.len());
        for (i, fragment) in a.fragments.iter() {
            assert_eq!(fragment.start, b.fragments[i].start);
            assert_eq!(fragment.end, b.fragments[i].end);
        }
        assert_partition(&a, 123_456_789);
    }
}

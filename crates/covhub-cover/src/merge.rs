//! Merge engine
//!
//! Consolidates the profiles reported by many agents running the same build
//! into one profile. Every agent must have been instrumented identically, so
//! any disagreement on mode or block layout is a hard error.

use std::collections::HashMap;

use tracing::debug;

use crate::error::CoverError;
use crate::profile::{CoverageBlock, Profile};

/// Merge profiles into one
///
/// Files appear in first-seen order. Counters are combined with the mode of
/// the first profile.
pub fn merge(profiles: &[Profile]) -> Result<Profile, CoverError> {
    let first = profiles.first().ok_or(CoverError::NoProfiles)?;
    let mode = first.mode();

    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Vec<CoverageBlock>> = HashMap::new();

    for profile in profiles {
        let groups = profile.by_file();

        if profile.mode() != mode {
            let file = groups
                .first()
                .map(|(file, _)| file.to_string())
                .unwrap_or_default();
            return Err(CoverError::ModeMismatch {
                file,
                expected: mode,
                found: profile.mode(),
            });
        }

        for (file, blocks) in groups {
            match merged.get_mut(file) {
                Some(existing) => merge_file_blocks(file, existing, blocks, profile)?,
                None => {
                    order.push(file.to_string());
                    merged.insert(file.to_string(), blocks.to_vec());
                }
            }
        }
    }

    let mut blocks = Vec::new();
    for file in &order {
        if let Some(file_blocks) = merged.remove(file) {
            blocks.extend(file_blocks);
        }
    }

    if blocks.is_empty() {
        return Err(CoverError::EmptyProfile);
    }

    debug!(
        profiles = profiles.len(),
        files = order.len(),
        blocks = blocks.len(),
        "Merged coverage profiles"
    );

    Ok(Profile::from_flattened(mode, blocks))
}

fn merge_file_blocks(
    file: &str,
    existing: &mut [CoverageBlock],
    incoming: &[CoverageBlock],
    profile: &Profile,
) -> Result<(), CoverError> {
    if existing.len() != incoming.len() {
        return Err(CoverError::BlockMismatch {
            file: file.to_string(),
            detail: format!(
                "block count differs: {} vs {}",
                existing.len(),
                incoming.len()
            ),
        });
    }

    for (dst, src) in existing.iter_mut().zip(incoming) {
        if !dst.same_position(src) || dst.num_stmt != src.num_stmt {
            return Err(CoverError::BlockMismatch {
                file: file.to_string(),
                detail: format!("{} vs {}", block_location(dst), block_location(src)),
            });
        }
        dst.count = profile.mode().combine(dst.count, src.count);
    }

    Ok(())
}

fn block_location(block: &CoverageBlock) -> String {
    format!(
        "{}.{},{}.{} ({} stmts)",
        block.start_line, block.start_col, block.end_line, block.end_col, block.num_stmt
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Mode;

    fn parse(text: &str) -> Profile {
        Profile::parse(text).unwrap()
    }

    #[test]
    fn test_merge_count_sums() {
        let a = parse("mode: count\nqiniu.com/app/main.go:32.49,33.13 1 30\n");
        let b = parse("mode: count\nqiniu.com/app/main.go:32.49,33.13 1 0\n");

        let merged = merge(&[a, b]).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.blocks()[0].count, 30);
        assert_eq!(
            merged.serialize().unwrap(),
            "mode: count\nqiniu.com/app/main.go:32.49,33.13 1 30\n"
        );
    }

    #[test]
    fn test_merge_set_is_or() {
        let a = parse("mode: set\nm.go:1.1,2.2 1 0\nm.go:3.1,4.2 1 1\n");
        let b = parse("mode: set\nm.go:1.1,2.2 1 1\nm.go:3.1,4.2 1 1\n");

        let merged = merge(&[a, b]).unwrap();
        let counts: Vec<u32> = merged.blocks().iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 1]);
    }

    #[test]
    fn test_merge_atomic_saturates() {
        let a = parse(&format!("mode: atomic\nm.go:1.1,2.2 1 {}\n", u32::MAX - 1));
        let b = parse("mode: atomic\nm.go:1.1,2.2 1 5\n");

        let merged = merge(&[a, b]).unwrap();
        assert_eq!(merged.blocks()[0].count, u32::MAX);
    }

    #[test]
    fn test_merge_single_profile_is_identity() {
        let text = "mode: count\na.go:1.1,2.2 1 3\nb.go:4.1,5.2 2 0\n";
        let merged = merge(&[parse(text)]).unwrap();
        assert_eq!(merged.serialize().unwrap(), text);
    }

    #[test]
    fn test_merge_keeps_first_seen_file_order() {
        let a = parse("mode: set\nz.go:1.1,2.2 1 1\n");
        let b = parse("mode: set\na.go:1.1,2.2 1 0\nz.go:1.1,2.2 1 0\n");

        let merged = merge(&[a, b]).unwrap();
        assert_eq!(merged.files(), vec!["z.go", "a.go"]);
        assert_eq!(merged.blocks()[0].count, 1);
    }

    #[test]
    fn test_merge_mode_mismatch_names_file() {
        let a = parse("mode: set\nm.go:1.1,2.2 1 1\n");
        let b = parse("mode: count\nother.go:1.1,2.2 1 1\n");

        let err = merge(&[a, b]).unwrap_err();
        assert_eq!(
            err,
            CoverError::ModeMismatch {
                file: "other.go".to_string(),
                expected: Mode::Set,
                found: Mode::Count,
            }
        );
        assert!(err.to_string().contains("other.go"));
    }

    #[test]
    fn test_merge_block_mismatch() {
        let a = parse("mode: count\nm.go:1.1,2.2 1 1\n");
        let b = parse("mode: count\nm.go:1.1,2.9 1 1\n");
        let err = merge(&[a, b]).unwrap_err();
        assert!(matches!(err, CoverError::BlockMismatch { ref file, .. } if file == "m.go"));
        assert!(err.to_string().contains("coverage block mismatch"));

        let a = parse("mode: count\nm.go:1.1,2.2 1 1\n");
        let b = parse("mode: count\nm.go:1.1,2.2 3 1\n");
        assert!(matches!(merge(&[a, b]), Err(CoverError::BlockMismatch { .. })));

        let a = parse("mode: count\nm.go:1.1,2.2 1 1\n");
        let b = parse("mode: count\nm.go:1.1,2.2 1 1\nm.go:3.1,4.2 1 1\n");
        assert!(matches!(merge(&[a, b]), Err(CoverError::BlockMismatch { .. })));
    }

    #[test]
    fn test_merge_nothing() {
        let err = merge(&[]).unwrap_err();
        assert_eq!(err, CoverError::NoProfiles);
        assert_eq!(err.to_string(), "expected at least one coverage file");
    }

    #[test]
    fn test_merge_empty_profile() {
        let err = merge(&[Profile::new(Mode::Count)]).unwrap_err();
        assert_eq!(err, CoverError::EmptyProfile);
        assert!(err.to_string().contains("failed to dump profile"));
    }
}

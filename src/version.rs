use std::cmp::Ordering;

/// Normalize version string by removing 'v' prefix and cleaning up.
pub fn normalize_version(version: &str) -> String {
    version.trim().trim_start_matches('v').to_owned()
}

/// Compare two dotted versions numerically; missing parts count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts_a = parse_version_parts(a);
    let parts_b = parse_version_parts(b);

    let max_len = parts_a.len().max(parts_b.len());
    for i in 0..max_len {
        let a_part = parts_a.get(i).copied().unwrap_or(0);
        let b_part = parts_b.get(i).copied().unwrap_or(0);
        match a_part.cmp(&b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Parse version string into parts (e.g., "1.5.0" -> [1, 5, 0]).
fn parse_version_parts(version: &str) -> Vec<u32> {
    normalize_version(version)
        .split(['.', '-', '+'])
        .map_while(|part| part.parse::<u32>().ok())
        .collect()
}

/// Pull the first dotted version out of `--version` output such as
/// `zenohd v1.5.0 built with rustc 1.85.0`.
pub fn extract_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(normalize_version)
        .map(|token| {
            token
                .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
                .to_owned()
        })
        .find(|token| {
            token.contains('.')
                && token
                    .split('.')
                    .next()
                    .is_some_and(|head| !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()))
        })
}

/// True when the router's `--version` output reports the expected release.
pub fn version_matches(output: &str, expected: &str) -> bool {
    let expected = normalize_version(expected);
    extract_version(output)
        .is_some_and(|found| compare_versions(&found, &expected) == Ordering::Equal)
}

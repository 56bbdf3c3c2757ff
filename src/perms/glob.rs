//! Glob matching for permission rules.
//!
//! `*` matches any run of characters within one path segment; `**`
//! matches zero or more whole segments; everything else is literal.
//! Patterns are anchored at the directory of the policy file that
//! declares them.

/// Match `pattern` against a relative path.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => {
            // `**` absorbs zero or more whole segments.
            match_segments(rest, path)
                || (!path.is_empty() && match_segments(pattern, &path[1..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((segment, path_rest)) => {
                match_one_segment(first, segment) && match_segments(rest, path_rest)
            }
            None => false,
        },
    }
}

/// Match a single pattern segment where `*` spans any run of characters.
fn match_one_segment(pattern: &str, segment: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let segment: Vec<char> = segment.chars().collect();
    match_chars(&pattern, &segment)
}

fn match_chars(pattern: &[char], segment: &[char]) -> bool {
    match pattern.split_first() {
        None => segment.is_empty(),
        Some(('*', rest)) => {
            match_chars(rest, segment) || (!segment.is_empty() && match_chars(pattern, &segment[1..]))
        }
        Some((ch, rest)) => match segment.split_first() {
            Some((sch, segment_rest)) => ch == sch && match_chars(rest, segment_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        assert!(glob_match("data/file.csv", "data/file.csv"));
        assert!(!glob_match("data/file.csv", "data/other.csv"));
        assert!(!glob_match("data/file.csv", "data/file.csv/extra"));
    }

    #[test]
    fn test_star_within_segment() {
        assert!(glob_match("*.request", "abc.request"));
        assert!(glob_match("data/*.csv", "data/file.csv"));
        assert!(!glob_match("data/*.csv", "data/sub/file.csv"));
        assert!(glob_match("a*c", "abc"));
        assert!(glob_match("a*c", "ac"));
        assert!(!glob_match("a*c", "ab"));
    }

    #[test]
    fn test_double_star_spans_segments() {
        assert!(glob_match("**/*.request", "ep/alice@x.org/id.request"));
        assert!(glob_match("**/*.request", "id.request"));
        assert!(glob_match("a/**/z", "a/z"));
        assert!(glob_match("a/**/z", "a/b/c/z"));
        assert!(!glob_match("a/**/z", "a/b/c"));
    }

    #[test]
    fn test_double_star_alone_matches_everything() {
        assert!(glob_match("**", ""));
        assert!(glob_match("**", "a"));
        assert!(glob_match("**", "a/b/c/d"));
    }

    #[test]
    fn test_multiple_stars() {
        assert!(glob_match("*@*/app_data/*", "bob@x.org/app_data/ping"));
        assert!(!glob_match("*@*/app_data/*", "bob/app_data/ping"));
    }
}

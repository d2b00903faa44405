//! Include/exclude filtering for synced paths.
//!
//! Patterns are slash-separated globs relative to the synced root. `*` and `?`
//! match within one path segment, `**` matches any number of segments. An
//! exclude pattern also excludes everything below a matching directory, and a
//! leading `!` re-includes what an earlier exclude removed.

#[derive(Debug, Clone)]
struct ExcludePattern {
    segments: Vec<String>,
    negated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<Vec<String>>,
    excludes: Vec<ExcludePattern>,
}

fn split(pattern: &str) -> Option<Vec<String>> {
    let trimmed = pattern
        .trim()
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return None;
    }
    Some(
        trimmed
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect(),
    )
}

impl PathFilter {
    pub fn new<I, E>(includes: I, excludes: E) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let includes = includes
            .into_iter()
            .filter_map(|p| split(p.as_ref()))
            .collect();
        let excludes = excludes
            .into_iter()
            .filter_map(|p| {
                let p = p.as_ref().trim();
                let (negated, p) = match p.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, p),
                };
                split(p).map(|segments| ExcludePattern { segments, negated })
            })
            .collect();
        Self { includes, excludes }
    }

    pub fn has_negations(&self) -> bool {
        self.excludes.iter().any(|p| p.negated)
    }

    /// The last matching exclude pattern wins.
    pub fn is_excluded(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('/').collect();
        let mut excluded = false;
        for pattern in &self.excludes {
            if matches_self_or_parent(&pattern.segments, &segments) {
                excluded = !pattern.negated;
            }
        }
        excluded
    }

    /// True when there are no include patterns, or one names this path or a
    /// directory above it.
    pub fn is_included(&self, path: &str) -> bool {
        if self.includes.is_empty() {
            return true;
        }
        let segments: Vec<&str> = path.split('/').collect();
        self.includes
            .iter()
            .any(|pattern| matches_self_or_parent(pattern, &segments))
    }

    /// True when something below `dir` could be included.
    pub fn may_contain_included(&self, dir: &str) -> bool {
        if self.includes.is_empty() {
            return true;
        }
        let segments: Vec<&str> = dir.split('/').collect();
        self.includes
            .iter()
            .any(|pattern| is_prefix_of(pattern, &segments))
    }
}

fn matches_self_or_parent(pattern: &[String], segments: &[&str]) -> bool {
    (1..=segments.len()).any(|n| glob_match(pattern, &segments[..n]))
}

fn is_prefix_of(pattern: &[String], dir: &[&str]) -> bool {
    for (i, segment) in dir.iter().enumerate() {
        match pattern.get(i) {
            Some(p) if p == "**" => return true,
            Some(p) if segment_match(p.as_bytes(), segment.as_bytes()) => {}
            _ => return false,
        }
    }
    pattern.len() > dir.len()
}

fn glob_match(pattern: &[String], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((first, rest)) if first == "**" => {
            (0..=path.len()).any(|skip| glob_match(rest, &path[skip..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((segment, path_rest)) => {
                segment_match(first.as_bytes(), segment.as_bytes()) && glob_match(rest, path_rest)
            }
            None => false,
        },
    }
}

/// Single-segment wildcard match with backtracking on the last `*`.
fn segment_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

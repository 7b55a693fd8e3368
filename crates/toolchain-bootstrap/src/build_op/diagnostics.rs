use std::sync::LazyLock;

use regex::Regex;

struct Marker {
    pattern: Regex,
    hint: &'static str,
}

static MARKERS: LazyLock<Vec<Marker>> = LazyLock::new(|| {
    [
        (r"undefined reference to", "undefined reference (missing library or link order)"),
        (
            r"unrecognized (command[- ]line )?option|unknown (argument|option)",
            "unrecognized option (tool does not support a flag)",
        ),
        (
            r"fatal error: .*: No such file or directory",
            "missing header or source file",
        ),
        (r"cannot find -l\S+", "missing library"),
        (r"configure: error:", "configure failed"),
        (
            r"virtual memory exhausted|Cannot allocate memory|out of memory|Killed signal terminated",
            "out of memory (try fewer jobs)",
        ),
    ]
    .into_iter()
    .filter_map(|(re, hint)| {
        Regex::new(re).ok().map(|pattern| Marker { pattern, hint })
    })
    .collect()
});

/// Best-effort scan of captured output for known failure markers. Each marker is reported once,
/// with the first line that matched it.
pub fn scan<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for line in lines {
        for (i, m) in MARKERS.iter().enumerate() {
            if found.iter().any(|(seen, _)| *seen == i) {
                continue;
            }
            if m.pattern.is_match(line) {
                found.push((i, format!("{}: {}", m.hint, line.trim())));
            }
        }
    }
    found.sort_by_key(|(i, _)| *i);
    found.into_iter().map(|(_, h)| h).collect()
}

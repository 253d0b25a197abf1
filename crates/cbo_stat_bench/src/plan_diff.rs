//! Line diff between the source plan and the simulated plan.

/// One line of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine<'a> {
    Same(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

/// Longest-common-subsequence line diff of `expected` against `actual`.
pub fn diff_lines<'a>(expected: &'a str, actual: &'a str) -> Vec<DiffLine<'a>> {
    let left: Vec<&str> = expected.lines().collect();
    let right: Vec<&str> = actual.lines().collect();

    // lcs[i][j] = common length of left[i..] and right[j..].
    let mut lcs = vec![vec![0usize; right.len() + 1]; left.len() + 1];
    for i in (0..left.len()).rev() {
        for j in (0..right.len()).rev() {
            lcs[i][j] = if left[i] == right[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(left.len().max(right.len()));
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if left[i] == right[j] {
            out.push(DiffLine::Same(left[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(DiffLine::Removed(left[i]));
            i += 1;
        } else {
            out.push(DiffLine::Added(right[j]));
            j += 1;
        }
    }
    out.extend(left[i..].iter().copied().map(DiffLine::Removed));
    out.extend(right[j..].iter().copied().map(DiffLine::Added));
    out
}

/// `None` when both plans are identical, otherwise the rendered diff with
/// `-` for source-only lines and `+` for simulated-only lines.
pub fn render_plan_diff(expected: &str, actual: &str) -> Option<String> {
    if expected == actual {
        return None;
    }
    let mut rendered = String::new();
    for line in diff_lines(expected, actual) {
        let (marker, text) = match line {
            DiffLine::Same(text) => (' ', text),
            DiffLine::Removed(text) => ('-', text),
            DiffLine::Added(text) => ('+', text),
        };
        rendered.push(marker);
        rendered.push(' ');
        rendered.push_str(text);
        rendered.push('\n');
    }
    Some(rendered)
}

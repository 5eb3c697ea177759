//! Literal color detection and rewriting.
//!
//! Colors belong in the `:root` custom-property block. Anywhere else a
//! literal (`#abc`, `#aabbcc`, `rgb()/rgba()/hsl()/hsla()` with numeric
//! arguments) is flagged, and [`sanitize_colors`] rewrites it into a
//! `var(--…)` reference.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

static COLOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)#(?:[0-9a-f]{6}|[0-9a-f]{3})\b|\b(?:rgba?|hsla?)\(\s*[0-9.]+(?:deg|%)?(?:\s*[,/]?\s*[0-9.]+(?:deg|%)?)*\s*\)",
    )
    .expect("Invalid color regex")
});

static STYLE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>(.*?)</style>").expect("Invalid style block regex"));

static CUSTOM_PROP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"--([A-Za-z0-9_-]+)\s*:\s*([^;}]+)").expect("Invalid custom property regex")
});

const AUTO_PREFIX: &str = "color-auto-";

/// A color literal found outside `:root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorMatch {
    pub range: Range<usize>,
    pub literal: String,
}

/// Which part of a file holds CSS.
fn css_regions(path: &str, content: &str) -> Vec<Range<usize>> {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".css") {
        vec![0..content.len()]
    } else if lower.ends_with(".html") || lower.ends_with(".htm") {
        STYLE_BLOCK_RE
            .captures_iter(content)
            .filter_map(|c| c.get(1).map(|m| m.range()))
            .collect()
    } else {
        Vec::new()
    }
}

/// Byte ranges of every outermost `:root { … }` body.
fn root_bodies(css: &str) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    // (opens a root block, body start)
    let mut stack: Vec<(bool, usize)> = Vec::new();
    let mut segment_start = 0;
    for (i, b) in css.bytes().enumerate() {
        match b {
            b'{' => {
                let inside_root = stack.iter().any(|(root, _)| *root);
                let opens_root = !inside_root && css[segment_start..i].contains(":root");
                stack.push((opens_root, i + 1));
                segment_start = i + 1;
            }
            b'}' => {
                if let Some((true, open)) = stack.pop() {
                    out.push(open..i);
                }
                segment_start = i + 1;
            }
            b';' => segment_start = i + 1,
            _ => {}
        }
    }
    out
}

/// Color literals in a CSS text that sit in a declaration outside `:root`.
pub fn find_color_literals(css: &str) -> Vec<ColorMatch> {
    let roots = root_bodies(css);
    let mut out = Vec::new();

    for m in COLOR_RE.find_iter(css) {
        if roots.iter().any(|r| r.contains(&m.start())) {
            continue;
        }
        if depth_at(css, m.start()) == 0 {
            continue;
        }
        if is_selector(&css[m.end()..]) {
            continue;
        }
        out.push(ColorMatch {
            range: m.range(),
            literal: m.as_str().to_string(),
        });
    }
    out
}

fn depth_at(css: &str, pos: usize) -> u32 {
    let mut depth: u32 = 0;
    for b in css[..pos].bytes() {
        match b {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    depth
}

/// A match followed by `{` before any `;` or `}` is part of a selector.
fn is_selector(rest: &str) -> bool {
    for b in rest.bytes() {
        match b {
            b'{' => return true,
            b';' | b'}' => return false,
            _ => {}
        }
    }
    false
}

/// Color literals outside `:root` across the CSS-bearing files of an artifact.
pub fn scan_files(files: &BTreeMap<String, String>) -> Vec<(String, ColorMatch)> {
    let mut out = Vec::new();
    for (path, content) in files {
        for region in css_regions(path, content) {
            let css = &content[region.clone()];
            for mut m in find_color_literals(css) {
                m.range = (m.range.start + region.start)..(m.range.end + region.start);
                out.push((path.clone(), m));
            }
        }
    }
    out
}

/// Custom property names declared in `:root` blocks, in file order, deduplicated.
pub fn root_custom_properties(files: &BTreeMap<String, String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (path, content) in files {
        for region in css_regions(path, content) {
            let css = &content[region];
            for root in root_bodies(css) {
                for cap in CUSTOM_PROP_RE.captures_iter(&css[root]) {
                    let name = cap[1].to_string();
                    if !out.contains(&name) {
                        out.push(name);
                    }
                }
            }
        }
    }
    out
}

fn normalize(literal: &str) -> String {
    literal
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub replaced: usize,
    /// New custom properties as `(name, literal)`, name without the `--`.
    pub declared: Vec<(String, String)>,
}

/// Rewrite out-of-root color literals into `var(--…)` references.
///
/// Identical literals share one property; a literal already declared in a
/// `:root` block reuses that property. New declarations go into the first
/// `:root` block of the first `.css` file, or a new block is prepended to it.
pub fn sanitize_colors(files: &mut BTreeMap<String, String>) -> SanitizeReport {
    sanitize_colors_into(files, None)
}

/// [`sanitize_colors`] with the declarations steered into `root_file` when
/// that file exists in `files`.
///
/// Run it once over every file that shares a stylesheet, so generated names
/// never collide across files.
pub fn sanitize_colors_into(files: &mut BTreeMap<String, String>, root_file: Option<&str>) -> SanitizeReport {
    let mut report = SanitizeReport::default();

    // Existing root declarations: normalized value -> name.
    let mut by_value: HashMap<String, String> = HashMap::new();
    let mut taken: Vec<String> = Vec::new();
    for (path, content) in files.iter() {
        for region in css_regions(path, content) {
            let css = &content[region];
            for root in root_bodies(css) {
                for cap in CUSTOM_PROP_RE.captures_iter(&css[root]) {
                    let name = cap[1].to_string();
                    by_value.entry(normalize(&cap[2])).or_insert_with(|| name.clone());
                    taken.push(name);
                }
            }
        }
    }

    let mut next_index = 1usize;
    let mut allocate = |taken: &mut Vec<String>| loop {
        let candidate = format!("{AUTO_PREFIX}{next_index}");
        next_index += 1;
        if !taken.contains(&candidate) {
            taken.push(candidate.clone());
            return candidate;
        }
    };

    let paths: Vec<String> = files.keys().cloned().collect();
    for path in &paths {
        let Some(content) = files.get(path) else {
            continue;
        };
        let mut hits: Vec<ColorMatch> = Vec::new();
        for region in css_regions(path, content) {
            for mut m in find_color_literals(&content[region.clone()]) {
                m.range = (m.range.start + region.start)..(m.range.end + region.start);
                hits.push(m);
            }
        }
        if hits.is_empty() {
            continue;
        }

        // Names are assigned in source order; replacement runs back to front
        // so earlier ranges stay valid.
        let mut names = Vec::with_capacity(hits.len());
        for m in &hits {
            let key = normalize(&m.literal);
            let name = match by_value.get(&key) {
                Some(name) => name.clone(),
                None => {
                    let name = allocate(&mut taken);
                    report.declared.push((name.clone(), m.literal.clone()));
                    by_value.insert(key, name.clone());
                    name
                }
            };
            names.push(name);
        }

        let mut rewritten = content.clone();
        for (m, name) in hits.iter().zip(&names).rev() {
            rewritten.replace_range(m.range.clone(), &format!("var(--{name})"));
            report.replaced += 1;
        }
        files.insert(path.clone(), rewritten);
    }

    if !report.declared.is_empty() {
        insert_declarations(files, &report.declared, root_file);
    }
    report
}

/// Append to the first `:root` body of a CSS text, or prepend a new block.
fn add_to_root(css: &mut String, decls: &str) {
    if let Some(root) = root_bodies(css).into_iter().next() {
        let mut insert = String::new();
        if !css[..root.end].ends_with('\n') {
            insert.push('\n');
        }
        insert.push_str(decls);
        css.insert_str(root.end, &insert);
    } else {
        css.insert_str(0, &format!(":root {{\n{decls}}}\n\n"));
    }
}

fn insert_declarations(files: &mut BTreeMap<String, String>, declared: &[(String, String)], root_file: Option<&str>) {
    let decls: String = declared
        .iter()
        .map(|(name, literal)| format!("  --{name}: {literal};\n"))
        .collect();

    if let Some(path) = root_file {
        if let Some(content) = files.get_mut(path) {
            if add_to_file(path, content, &decls) {
                return;
            }
        }
    }

    // First :root block in a .css file, else the first .css file.
    let css_paths: Vec<String> = files
        .keys()
        .filter(|p| p.to_ascii_lowercase().ends_with(".css"))
        .cloned()
        .collect();
    let target = css_paths
        .iter()
        .find(|p| files.get(*p).is_some_and(|c| !root_bodies(c).is_empty()))
        .or_else(|| css_paths.first())
        .cloned();
    if let Some(path) = target {
        if let Some(content) = files.get_mut(&path) {
            add_to_root(content, &decls);
        }
        return;
    }

    // No stylesheet at all: the first inline style block takes the root.
    for (path, content) in files.iter_mut() {
        if add_to_file(path, content, &decls) {
            return;
        }
    }
}

/// Add declarations to a stylesheet or the first `<style>` block of a page.
fn add_to_file(path: &str, content: &mut String, decls: &str) -> bool {
    let Some(region) = css_regions(path, content).into_iter().next() else {
        return false;
    };
    let mut css = content[region.clone()].to_string();
    add_to_root(&mut css, decls);
    content.replace_range(region, &css);
    true
}

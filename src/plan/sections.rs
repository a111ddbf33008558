//! Fence-aware markdown section scanning.
//!
//! Heading markers inside fenced code blocks are content, not structure:
//! a plan that embeds example markdown must not grow phantom sections.

/// A heading and the line range it governs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Heading depth (1 for `#`, 2 for `##`, ...)
    pub level: usize,
    /// Heading text with the markers stripped
    pub title: String,
    /// Line index of the heading itself
    pub heading_line: usize,
    /// Exclusive end line including nested subsections
    pub end: usize,
}

/// A fenced code block found within a line range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// Info string after the opening fence (e.g. `json`)
    pub info: String,
    pub content: String,
}

/// A parsed markdown document: its lines plus fence and heading structure.
#[derive(Debug, Clone)]
pub struct MarkdownDoc<'a> {
    lines: Vec<&'a str>,
    in_fence: Vec<bool>,
    sections: Vec<Section>,
}

#[derive(Debug, Clone, Copy)]
struct Fence {
    marker: char,
    len: usize,
}

fn fence_open(line: &str) -> Option<(Fence, &str)> {
    let trimmed = line.trim_start();
    let marker = trimmed.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let len = trimmed.chars().take_while(|c| *c == marker).count();
    if len < 3 {
        return None;
    }
    let info = trimmed[len..].trim();
    // Backtick fences may not carry backticks in their info string
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some((Fence { marker, len }, info))
}

fn fence_closes(line: &str, fence: Fence) -> bool {
    let trimmed = line.trim();
    let len = trimmed.chars().take_while(|c| *c == fence.marker).count();
    len >= fence.len && trimmed.chars().all(|c| c == fence.marker)
}

/// Parse an ATX heading into (level, title).
pub fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim().to_string();
    Some((level, title))
}

impl<'a> MarkdownDoc<'a> {
    pub fn parse(text: &'a str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let mut in_fence = vec![false; lines.len()];
        let mut headings: Vec<(usize, usize, String)> = Vec::new();
        let mut open: Option<Fence> = None;

        for (i, line) in lines.iter().enumerate() {
            match open {
                Some(fence) => {
                    in_fence[i] = true;
                    if fence_closes(line, fence) {
                        open = None;
                    }
                }
                None => {
                    if let Some((fence, _)) = fence_open(line) {
                        in_fence[i] = true;
                        open = Some(fence);
                    } else if let Some((level, title)) = parse_heading(line) {
                        headings.push((i, level, title));
                    }
                }
            }
        }

        let sections = headings
            .iter()
            .enumerate()
            .map(|(idx, (line, level, title))| {
                let end = headings[idx + 1..]
                    .iter()
                    .find(|(_, l, _)| l <= level)
                    .map_or(lines.len(), |(next, _, _)| *next);
                Section {
                    level: *level,
                    title: title.clone(),
                    heading_line: *line,
                    end,
                }
            })
            .collect();

        Self {
            lines,
            in_fence,
            sections,
        }
    }

    pub fn lines(&self) -> &[&'a str] {
        &self.lines
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Whether line `index` is part of a fenced block (fence lines included).
    pub fn is_fenced(&self, index: usize) -> bool {
        self.in_fence.get(index).copied().unwrap_or(false)
    }

    /// First section whose title satisfies `pred`.
    pub fn find_section<F>(&self, pred: F) -> Option<&Section>
    where
        F: Fn(&str) -> bool,
    {
        self.sections.iter().find(|s| pred(&s.title))
    }

    /// Body of a section (without its heading), nested subsections included.
    pub fn section_body(&self, section: &Section) -> String {
        self.join_lines(section.heading_line + 1, section.end)
            .trim()
            .to_string()
    }

    /// Heading plus body of a section.
    pub fn section_text(&self, section: &Section) -> String {
        self.join_lines(section.heading_line, section.end)
            .trim_end()
            .to_string()
    }

    pub fn join_lines(&self, start: usize, end: usize) -> String {
        let end = end.min(self.lines.len());
        if start >= end {
            return String::new();
        }
        self.lines[start..end].join("\n")
    }

    /// Text before the first heading.
    pub fn preamble(&self) -> String {
        let end = self
            .sections
            .first()
            .map_or(self.lines.len(), |s| s.heading_line);
        self.join_lines(0, end).trim().to_string()
    }

    /// Fenced blocks whose opening fence lies in `[start, end)`.
    pub fn fenced_blocks(&self, start: usize, end: usize) -> Vec<FencedBlock> {
        let end = end.min(self.lines.len());
        let mut blocks = Vec::new();
        let mut i = start;
        while i < end {
            if let Some((fence, info)) = fence_open(self.lines[i]) {
                let mut content = Vec::new();
                let mut j = i + 1;
                while j < self.lines.len() && !fence_closes(self.lines[j], fence) {
                    content.push(self.lines[j]);
                    j += 1;
                }
                blocks.push(FencedBlock {
                    info: info.to_string(),
                    content: content.join("\n"),
                });
                i = j + 1;
            } else {
                i += 1;
            }
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "# Plan\n\
intro\n\
\n\
## Objective\n\
Ship it.\n\
\n\
## Changes\n\
### `src/a.rs`\n\
edit a\n\
```markdown\n\
## Not A Heading\n\
```\n\
## Risks\n\
none\n";

    #[test]
    fn test_headings_inside_fences_are_ignored() {
        let doc = MarkdownDoc::parse(PLAN);
        let titles: Vec<&str> = doc.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Plan", "Objective", "Changes", "`src/a.rs`", "Risks"]);
    }

    #[test]
    fn test_section_body_includes_subsections() {
        let doc = MarkdownDoc::parse(PLAN);
        let changes = doc.find_section(|t| t == "Changes").unwrap();
        let body = doc.section_body(changes);
        assert!(body.contains("edit a"));
        assert!(body.contains("## Not A Heading"));
        assert!(!body.contains("none"));
    }

    #[test]
    fn test_nested_section_ends_at_sibling() {
        let doc = MarkdownDoc::parse(PLAN);
        let objective = doc.find_section(|t| t == "Objective").unwrap();
        assert_eq!(doc.section_body(objective), "Ship it.");
    }

    #[test]
    fn test_fenced_blocks_in_range() {
        let text = "## Change Manifest\n```json\n[\"a.rs\"]\n```\n";
        let doc = MarkdownDoc::parse(text);
        let blocks = doc.fenced_blocks(0, doc.lines().len());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].info, "json");
        assert_eq!(blocks[0].content, "[\"a.rs\"]");
    }

    #[test]
    fn test_tilde_fence_with_backticks_inside() {
        let text = "~~~~\n```\n# inner\n```\n~~~~\n# Real\n";
        let doc = MarkdownDoc::parse(text);
        assert_eq!(doc.sections().len(), 1);
        assert_eq!(doc.sections()[0].title, "Real");
    }

    #[test]
    fn test_parse_heading_requires_space() {
        assert_eq!(parse_heading("## Title"), Some((2, "Title".to_string())));
        assert_eq!(parse_heading("#hashtag"), None);
        assert_eq!(parse_heading("####### too deep"), None);
        assert_eq!(parse_heading("## Closed ##"), Some((2, "Closed".to_string())));
    }

    #[test]
    fn test_preamble() {
        let doc = MarkdownDoc::parse("hello\nworld\n# H\n");
        assert_eq!(doc.preamble(), "hello\nworld");
    }
}

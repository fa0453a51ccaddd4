//! Coverage profile model and text codec
//!
//! A profile is one `mode:` line followed by one line per coverage block:
//!
//! ```text
//! mode: count
//! example.com/app/main.go:32.49,33.13 1 30
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoverError;

/// Counter mode an instrumented binary was built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Set,
    Count,
    Atomic,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Set => "set",
            Mode::Count => "count",
            Mode::Atomic => "atomic",
        }
    }

    /// Combine two counters for the same block.
    ///
    /// `set` keeps a hit flag; `count` and `atomic` add, clamping at `u32::MAX`.
    pub fn combine(&self, a: u32, b: u32) -> u32 {
        match self {
            Mode::Set => u32::from(a > 0 || b > 0),
            Mode::Count | Mode::Atomic => a.saturating_add(b),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = CoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(Mode::Set),
            "count" => Ok(Mode::Count),
            "atomic" => Ok(Mode::Atomic),
            other => Err(CoverError::InvalidMode(other.to_string())),
        }
    }
}

/// One instrumented source range and its execution counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageBlock {
    pub file: String,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub num_stmt: u16,
    pub count: u32,
}

impl CoverageBlock {
    /// Whether both blocks cover the same source range of the same file
    pub fn same_position(&self, other: &CoverageBlock) -> bool {
        self.file == other.file
            && self.start_line == other.start_line
            && self.start_col == other.start_col
            && self.end_line == other.end_line
            && self.end_col == other.end_col
    }

    fn sort_key(&self) -> (&str, u32, u32, u32, u32) {
        (
            self.file.as_str(),
            self.start_line,
            self.start_col,
            self.end_line,
            self.end_col,
        )
    }

    fn parse(line: &str) -> Option<Self> {
        // The file name may itself contain spaces or colons, so split from the right.
        let mut fields = line.rsplitn(3, ' ');
        let count = fields.next()?.parse().ok()?;
        let num_stmt = fields.next()?.parse().ok()?;
        let location = fields.next()?;

        let (file, range) = location.rsplit_once(':')?;
        if file.is_empty() {
            return None;
        }
        let (start, end) = range.split_once(',')?;
        let (start_line, start_col) = start.split_once('.')?;
        let (end_line, end_col) = end.split_once('.')?;

        Some(Self {
            file: file.to_string(),
            start_line: start_line.parse().ok()?,
            start_col: start_col.parse().ok()?,
            end_line: end_line.parse().ok()?,
            end_col: end_col.parse().ok()?,
            num_stmt,
            count,
        })
    }
}

impl fmt::Display for CoverageBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{},{}.{} {} {}",
            self.file,
            self.start_line,
            self.start_col,
            self.end_line,
            self.end_col,
            self.num_stmt,
            self.count
        )
    }
}

/// A flattened coverage profile
///
/// Blocks of one file are contiguous and ordered by position, and no two
/// blocks share a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    mode: Mode,
    blocks: Vec<CoverageBlock>,
}

impl Profile {
    /// Create a profile with no blocks
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            blocks: Vec::new(),
        }
    }

    /// Build a profile from unordered blocks, folding duplicate positions
    pub fn from_blocks(mode: Mode, mut blocks: Vec<CoverageBlock>) -> Result<Self, CoverError> {
        blocks.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut flattened: Vec<CoverageBlock> = Vec::with_capacity(blocks.len());
        for block in blocks {
            match flattened.last_mut() {
                Some(last) if last.same_position(&block) => {
                    if last.num_stmt != block.num_stmt {
                        return Err(CoverError::BlockMismatch {
                            file: block.file.clone(),
                            detail: format!(
                                "inconsistent statement count at {}.{}: {} vs {}",
                                block.start_line, block.start_col, last.num_stmt, block.num_stmt
                            ),
                        });
                    }
                    last.count = mode.combine(last.count, block.count);
                }
                _ => flattened.push(block),
            }
        }

        Ok(Self {
            mode,
            blocks: flattened,
        })
    }

    /// Build a profile from blocks already grouped per file and ordered
    pub(crate) fn from_flattened(mode: Mode, blocks: Vec<CoverageBlock>) -> Self {
        Self { mode, blocks }
    }

    /// Parse profile text
    pub fn parse(text: &str) -> Result<Self, CoverError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim_end()))
            .filter(|(_, line)| !line.is_empty());

        let mode = match lines.next() {
            Some((_, line)) => parse_mode_line(line)?,
            None => return Err(CoverError::InvalidMode(String::new())),
        };

        let mut blocks = Vec::new();
        for (line_no, line) in lines {
            if line.starts_with("mode:") {
                // Concatenated profiles repeat the header.
                let repeated = parse_mode_line(line)?;
                if repeated != mode {
                    let file = blocks
                        .last()
                        .map(|b: &CoverageBlock| b.file.clone())
                        .unwrap_or_default();
                    return Err(CoverError::ModeMismatch {
                        file,
                        expected: mode,
                        found: repeated,
                    });
                }
                continue;
            }

            let block = CoverageBlock::parse(line).ok_or_else(|| CoverError::MalformedLine {
                line_no,
                line: line.to_string(),
            })?;
            blocks.push(block);
        }

        Self::from_blocks(mode, blocks)
    }

    /// Serialize to profile text
    ///
    /// A profile without blocks cannot be dumped.
    pub fn serialize(&self) -> Result<String, CoverError> {
        if self.blocks.is_empty() {
            return Err(CoverError::EmptyProfile);
        }

        let mut out = format!("mode: {}\n", self.mode);
        for block in &self.blocks {
            out.push_str(&block.to_string());
            out.push('\n');
        }
        Ok(out)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn blocks(&self) -> &[CoverageBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Distinct file names in profile order
    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for block in &self.blocks {
            if files.last() != Some(&block.file.as_str()) {
                files.push(&block.file);
            }
        }
        files
    }

    /// Contiguous block runs, one per file, in profile order
    pub fn by_file(&self) -> Vec<(&str, &[CoverageBlock])> {
        let mut groups = Vec::new();
        let mut start = 0;
        for end in 1..=self.blocks.len() {
            if end == self.blocks.len() || self.blocks[end].file != self.blocks[start].file {
                groups.push((self.blocks[start].file.as_str(), &self.blocks[start..end]));
                start = end;
            }
        }
        groups
    }

    /// Blocks belonging to one file
    pub fn blocks_for<'a>(&'a self, file: &'a str) -> impl Iterator<Item = &'a CoverageBlock> {
        self.blocks.iter().filter(move |b| b.file == file)
    }

    /// Keep only the blocks whose file satisfies `keep`
    pub fn retain_files<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.blocks.retain(|b| keep(&b.file));
    }
}

fn parse_mode_line(line: &str) -> Result<Mode, CoverError> {
    let value = line
        .strip_prefix("mode:")
        .ok_or_else(|| CoverError::InvalidMode(line.to_string()))?;
    value.trim().parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(file: &str, start: (u32, u32), end: (u32, u32), stmts: u16, count: u32) -> CoverageBlock {
        CoverageBlock {
            file: file.to_string(),
            start_line: start.0,
            start_col: start.1,
            end_line: end.0,
            end_col: end.1,
            num_stmt: stmts,
            count,
        }
    }

    #[test]
    fn test_parse_basic_profile() {
        let text = "mode: count\nqiniu.com/app/main.go:32.49,33.13 1 30\nqiniu.com/app/main.go:35.2,36.10 2 0\n";
        let profile = Profile::parse(text).unwrap();

        assert_eq!(profile.mode(), Mode::Count);
        assert_eq!(profile.len(), 2);
        assert_eq!(
            profile.blocks()[0],
            block("qiniu.com/app/main.go", (32, 49), (33, 13), 1, 30)
        );
        assert_eq!(profile.blocks()[1].num_stmt, 2);
    }

    #[test]
    fn test_serialize_is_bit_exact() {
        let text = "mode: atomic\na/b.go:1.2,3.4 5 6\na/c.go:7.8,9.10 11 0\n";
        let profile = Profile::parse(text).unwrap();
        assert_eq!(profile.serialize().unwrap(), text);
    }

    #[test]
    fn test_parse_sorts_by_file_then_position() {
        let text = "mode: set\nz.go:10.1,11.2 1 1\na.go:5.1,6.2 1 0\na.go:1.1,2.2 1 1\n";
        let profile = Profile::parse(text).unwrap();

        assert_eq!(profile.files(), vec!["a.go", "z.go"]);
        assert_eq!(profile.blocks()[0].start_line, 1);
        assert_eq!(profile.blocks()[1].start_line, 5);
    }

    #[test]
    fn test_parse_folds_duplicate_blocks() {
        let text = "mode: count\nm.go:1.1,2.2 1 3\nm.go:1.1,2.2 1 4\n";
        let profile = Profile::parse(text).unwrap();
        assert_eq!(profile.len(), 1);
        assert_eq!(profile.blocks()[0].count, 7);

        let text = "mode: set\nm.go:1.1,2.2 1 3\nm.go:1.1,2.2 1 0\n";
        let profile = Profile::parse(text).unwrap();
        assert_eq!(profile.blocks()[0].count, 1);
    }

    #[test]
    fn test_parse_rejects_inconsistent_duplicate() {
        let text = "mode: count\nm.go:1.1,2.2 1 3\nm.go:1.1,2.2 2 4\n";
        assert!(matches!(
            Profile::parse(text),
            Err(CoverError::BlockMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_missing_mode() {
        assert!(matches!(Profile::parse(""), Err(CoverError::InvalidMode(_))));
        assert!(matches!(
            Profile::parse("m.go:1.1,2.2 1 3\n"),
            Err(CoverError::InvalidMode(_))
        ));
        assert!(matches!(
            Profile::parse("mode: sometimes\n"),
            Err(CoverError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_parse_malformed_block_reports_line() {
        let text = "mode: set\nm.go:1.1,2.2 1 1\nm.go:1.1-2.2 1 1\n";
        match Profile::parse(text) {
            Err(CoverError::MalformedLine { line_no, line }) => {
                assert_eq!(line_no, 3);
                assert_eq!(line, "m.go:1.1-2.2 1 1");
            }
            other => panic!("expected malformed line error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_trailing_blank_lines_and_crlf() {
        let text = "mode: set\r\nm.go:1.1,2.2 1 1\r\n\n\n";
        let profile = Profile::parse(text).unwrap();
        assert_eq!(profile.len(), 1);
    }

    #[test]
    fn test_repeated_mode_line() {
        let text = "mode: set\na.go:1.1,2.2 1 1\nmode: set\nb.go:1.1,2.2 1 0\n";
        assert_eq!(Profile::parse(text).unwrap().len(), 2);

        let text = "mode: set\na.go:1.1,2.2 1 1\nmode: count\n";
        match Profile::parse(text) {
            Err(CoverError::ModeMismatch { file, expected, found }) => {
                assert_eq!(file, "a.go");
                assert_eq!(expected, Mode::Set);
                assert_eq!(found, Mode::Count);
            }
            other => panic!("expected mode mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_file_name_with_colon() {
        let text = "mode: set\nC:/src/main.go:1.1,2.2 1 1\n";
        let profile = Profile::parse(text).unwrap();
        assert_eq!(profile.blocks()[0].file, "C:/src/main.go");
    }

    #[test]
    fn test_mode_only_profile_cannot_be_dumped() {
        let profile = Profile::parse("mode: count\n").unwrap();
        assert!(profile.is_empty());
        let err = profile.serialize().unwrap_err();
        assert_eq!(err, CoverError::EmptyProfile);
        assert!(err.to_string().contains("failed to dump profile"));
    }

    #[test]
    fn test_retain_files() {
        let text = "mode: set\na/x.go:1.1,2.2 1 1\nb/y.go:1.1,2.2 1 1\n";
        let mut profile = Profile::parse(text).unwrap();
        profile.retain_files(|f| !f.contains("b/"));
        assert_eq!(profile.files(), vec!["a/x.go"]);
    }

    #[test]
    fn test_mode_combine() {
        assert_eq!(Mode::Set.combine(0, 0), 0);
        assert_eq!(Mode::Set.combine(5, 0), 1);
        assert_eq!(Mode::Count.combine(30, 0), 30);
        assert_eq!(Mode::Atomic.combine(u32::MAX, 10), u32::MAX);
    }
}

//! Chunk extraction boundary.
//!
//! Language-aware extractors live outside this crate; they plug in through
//! [`ChunkExtractor`]. [`BlockExtractor`] is the built-in fallback: it splits
//! on blank lines and caps each block at a fixed number of lines.

use std::path::Path;

use crate::chunk::Chunk;
use crate::error::IndexError;

pub trait ChunkExtractor: Send + Sync {
    /// Split `content` into ordered, non-overlapping chunks.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Extraction`] when the file cannot be chunked.
    fn extract(&self, file_path: &str, content: &str) -> Result<Vec<Chunk>, IndexError>;
}

/// Language id stored with each chunk, derived from the file extension.
#[must_use]
pub fn detect_language(path: &str) -> &'static str {
    let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) else {
        return "text";
    };
    match ext {
        "rs" => "rust",
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "sh" | "bash" | "zsh" => "bash",
        "toml" => "toml",
        "json" | "jsonc" => "json",
        "md" | "markdown" => "markdown",
        _ => "text",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockExtractor {
    pub max_lines: usize,
}

impl Default for BlockExtractor {
    fn default() -> Self {
        Self { max_lines: 60 }
    }
}

impl BlockExtractor {
    #[must_use]
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
        }
    }

    fn push_block(
        &self,
        file_path: &str,
        language: &str,
        lines: &[(usize, &str)],
        out: &mut Vec<Chunk>,
    ) {
        for window in lines.chunks(self.max_lines.max(1)) {
            let (Some(&(start, _)), Some(&(end, _))) = (window.first(), window.last()) else {
                continue;
            };
            let content = window
                .iter()
                .map(|(_, l)| *l)
                .collect::<Vec<_>>()
                .join("\n");
            out.push(Chunk::new(
                file_path,
                content,
                language,
                (start, end),
                "block",
            ));
        }
    }
}

impl ChunkExtractor for BlockExtractor {
    fn extract(&self, file_path: &str, content: &str) -> Result<Vec<Chunk>, IndexError> {
        if content.contains('\0') {
            return Err(IndexError::Extraction {
                path: file_path.to_owned(),
                reason: "binary content".into(),
            });
        }

        let language = detect_language(file_path);
        let mut out = Vec::new();
        let mut block: Vec<(usize, &str)> = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                self.push_block(file_path, language, &block, &mut out);
                block.clear();
            } else {
                block.push((idx + 1, line));
            }
        }
        self.push_block(file_path, language, &block, &mut out);

        if let [only] = out.as_mut_slice() {
            only.chunk_type = "file".into();
        }
        Ok(out)
    }
}

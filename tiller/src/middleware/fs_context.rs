//! Packs a snapshot of the working directory into the system prompt.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{Middleware, ModelNext};
use crate::error::Result;
use crate::provider::{ChatRequest, Completion};

/// Middleware appending a file-system context section to the system
/// prompt: a file listing plus excerpts, bounded by `max_bytes`.
#[derive(Debug)]
pub struct FsContextPacker {
    root: PathBuf,
    include: Vec<String>,
    ignore: Vec<String>,
    max_bytes: usize,
}

impl FsContextPacker {
    /// Pack files under `root` matching the `include` globs.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, include: Vec<String>) -> Self {
        Self {
            root: root.into(),
            include,
            ignore: vec!["**/.git/**".into(), "**/target/**".into(), "**/node_modules/**".into()],
            max_bytes: 16 * 1024,
        }
    }

    /// Add ignore patterns on top of the defaults.
    #[must_use]
    pub fn with_ignore<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.ignore.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Bound the packed section size.
    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignore
            .iter()
            .any(|pattern| glob::Pattern::new(pattern).is_ok_and(|p| p.matches(path)))
    }

    /// Build the context section. Files are listed in sorted order;
    /// excerpts stop once the byte budget is spent.
    #[must_use]
    pub fn pack(&self) -> String {
        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in &self.include {
            let full = self.root.join(pattern);
            let Some(full) = full.to_str() else { continue };
            let Ok(paths) = glob::glob(full) else { continue };
            for path in paths.flatten() {
                let relative = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                if path.is_file() && !self.is_ignored(&relative) {
                    files.push(path);
                }
            }
        }
        files.sort();
        files.dedup();

        let mut section = String::from("## Workspace files\n");
        let mut spent = section.len();
        for path in &files {
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let line = format!("- {}\n", relative.display());
            spent += line.len();
            if spent > self.max_bytes {
                section.push_str("- ...\n");
                return section;
            }
            section.push_str(&line);
        }

        for path in &files {
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let excerpt: String = content.chars().take(1024).collect();
            let block = format!("\n### {}\n```\n{excerpt}\n```\n", relative.display());
            if spent + block.len() > self.max_bytes {
                break;
            }
            spent += block.len();
            section.push_str(&block);
        }
        section
    }
}

#[async_trait]
impl Middleware for FsContextPacker {
    fn name(&self) -> &str {
        "fs-context"
    }

    fn priority(&self) -> i32 {
        30
    }

    async fn wrap_model_call(
        &self,
        mut request: ChatRequest,
        next: ModelNext<'_>,
    ) -> Result<Completion> {
        let section = self.pack();
        if section.lines().count() > 1 {
            debug!(bytes = section.len(), "packing workspace context");
            request.system = Some(match request.system.take() {
                Some(system) => format!("{system}\n\n{section}"),
                None => section,
            });
        }
        next.run(request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes").unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/out.rs"), "generated").unwrap();
        dir
    }

    #[test]
    fn packs_matching_files() {
        let dir = workspace();
        let packer = FsContextPacker::new(dir.path(), vec!["*.rs".into(), "*.md".into()]);
        let section = packer.pack();

        assert!(section.contains("- main.rs"));
        assert!(section.contains("- notes.md"));
        assert!(section.contains("fn main() {}"));
    }

    #[test]
    fn ignores_default_directories() {
        let dir = workspace();
        let packer = FsContextPacker::new(dir.path(), vec!["**/*.rs".into()]);
        let section = packer.pack();

        assert!(section.contains("- main.rs"));
        assert!(!section.contains("target/out.rs"));
    }

    #[test]
    fn respects_byte_budget() {
        let dir = workspace();
        std::fs::write(dir.path().join("big.rs"), "x".repeat(64 * 1024)).unwrap();
        let packer =
            FsContextPacker::new(dir.path(), vec!["*.rs".into()]).with_max_bytes(256);
        let section = packer.pack();
        assert!(section.len() <= 512, "section was {} bytes", section.len());
    }

    #[tokio::test]
    async fn appends_to_system_prompt() {
        use crate::message::Message;
        use crate::middleware::{MiddlewareChain, ModelTerminal};
        use crate::provider::StopReason;
        use std::sync::Arc;

        let dir = workspace();
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(FsContextPacker::new(
            dir.path(),
            vec!["*.rs".into()],
        )));

        let terminal: ModelTerminal<'_> = &|request| {
            Box::pin(async move {
                let system = request.system.unwrap_or_default();
                assert!(system.starts_with("base"));
                assert!(system.contains("## Workspace files"));
                Ok(Completion {
                    message: Message::assistant("ok"),
                    stop_reason: StopReason::EndTurn,
                    usage: None,
                })
            })
        };
        chain
            .model_call(ChatRequest::default().system("base"), terminal)
            .await
            .unwrap();
    }
}

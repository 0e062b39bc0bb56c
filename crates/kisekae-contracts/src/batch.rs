use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Appended to the prompt when reference outfit images are supplied. The
/// images themselves are never transmitted to the editing service; they only
/// steer the edit through this instruction.
pub const REFERENCE_PROMPT_SUFFIX: &str =
    "\nUse the outfit from the reference image(s). Keep hair, face, and background unchanged.";

/// Derives the prompt actually sent to the editing service.
pub fn effective_prompt(prompt: &str, reference_images: &[PathBuf]) -> String {
    if reference_images.is_empty() {
        prompt.to_string()
    } else {
        format!("{prompt}{REFERENCE_PROMPT_SUFFIX}")
    }
}

/// One edit call for one source image. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub source: PathBuf,
    pub prompt: String,
    pub reference_images: Vec<PathBuf>,
}

impl EditRequest {
    pub fn effective_prompt(&self) -> String {
        effective_prompt(&self.prompt, &self.reference_images)
    }
}

/// A server-issued handle that must be asked for its download location.
pub trait ArtifactHandle: Send + Sync {
    fn resolve(&self) -> Result<String>;
}

/// An opaque reference to one generated output image: either a URL the server
/// returned directly, or a handle that resolves to one.
pub enum ArtifactRef {
    Direct(String),
    Resolvable(Box<dyn ArtifactHandle>),
}

impl ArtifactRef {
    /// Normalizes either variant to a fetchable URL.
    pub fn url(&self) -> Result<String> {
        match self {
            Self::Direct(url) => Ok(url.clone()),
            Self::Resolvable(handle) => handle.resolve(),
        }
    }
}

impl fmt::Debug for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(url) => f.debug_tuple("Direct").field(url).finish(),
            Self::Resolvable(_) => f.write_str("Resolvable(..)"),
        }
    }
}

/// The editing service may answer with one reference or a sequence of them.
#[derive(Debug)]
pub enum EditOutput {
    Single(ArtifactRef),
    Many(Vec<ArtifactRef>),
}

impl EditOutput {
    /// Normalizes to an ordered sequence, preserving server order.
    pub fn into_refs(self) -> Vec<ArtifactRef> {
        match self {
            Self::Single(artifact) => vec![artifact],
            Self::Many(artifacts) => artifacts,
        }
    }
}

/// Persistence options for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub autosave: bool,
    pub save_dir: PathBuf,
    pub make_archive: bool,
}

/// Record of one artifact successfully fetched and written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedArtifact {
    pub source_index: usize,
    pub artifact_index: usize,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub dimensions: Option<(u32, u32)>,
}

/// Append-only, ordered log of one run's meaningful events, consumed at the
/// end as a flat report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            "Done.".to_string()
        } else {
            self.lines.join("\n")
        }
    }
}

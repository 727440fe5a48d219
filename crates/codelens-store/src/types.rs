use chrono::{DateTime, Utc};
use codelens_llm::Role;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub root_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            root_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_root_path(mut self, path: impl Into<String>) -> Self {
        self.root_path = Some(path.into());
        self
    }
}

/// A file belonging to a repository, addressed by its path relative to the
/// repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub repository_id: String,
    pub path: String,
    pub language: String,
    pub content: String,
}

/// A contiguous line range of one file, the unit of embedding and retrieval.
///
/// Lines are 1-based and inclusive. `vector_id` and `embedded_at` are set
/// together once the chunk's embedding has been written to the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: String,
    pub repository_id: String,
    pub file_path: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub content_hash: String,
    /// Function, type and identifier names detected in the chunk.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub vector_id: Option<String>,
    #[serde(default)]
    pub embedded_at: Option<DateTime<Utc>>,
}

impl CodeChunk {
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        self.vector_id.is_some()
    }

    #[must_use]
    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    #[must_use]
    pub fn to_ref(&self, score: f32) -> ChunkRef {
        ChunkRef {
            chunk_id: self.id.clone(),
            file_path: self.file_path.clone(),
            start_line: self.start_line,
            end_line: self.end_line,
            score,
        }
    }
}

/// A ranked hit from the lexical index.
#[derive(Debug, Clone, PartialEq)]
pub struct TextHit {
    pub chunk: CodeChunk,
    /// Higher is better; unbounded.
    pub score: f32,
    pub snippet: Option<String>,
}

/// Reference to a chunk that was placed into a chat prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub token_count: Option<u32>,
    #[serde(default)]
    pub chunk_refs: Vec<ChunkRef>,
    /// Set when the turn failed; `content` then holds whatever was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            token_count: None,
            chunk_refs: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub repository_id: Option<String>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        repository_id: Option<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            repository_id,
            title: title.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

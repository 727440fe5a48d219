//! Language detection by file extension.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Languages the importer recognises. Anything else is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Kotlin,
    CSharp,
    C,
    Cpp,
    Ruby,
    Php,
    Swift,
    Scala,
    Bash,
    Sql,
    Toml,
    Yaml,
    Json,
    Markdown,
}

impl Lang {
    /// Identifier stored on files and chunks and used in vector payloads.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Kotlin => "kotlin",
            Self::CSharp => "csharp",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Scala => "scala",
            Self::Bash => "bash",
            Self::Sql => "sql",
            Self::Toml => "toml",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }

    /// Inverse of [`Lang::id`].
    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        ALL.iter().copied().find(|l| l.id() == id)
    }
}

const ALL: [Lang; 20] = [
    Lang::Rust,
    Lang::Python,
    Lang::JavaScript,
    Lang::TypeScript,
    Lang::Go,
    Lang::Java,
    Lang::Kotlin,
    Lang::CSharp,
    Lang::C,
    Lang::Cpp,
    Lang::Ruby,
    Lang::Php,
    Lang::Swift,
    Lang::Scala,
    Lang::Bash,
    Lang::Sql,
    Lang::Toml,
    Lang::Yaml,
    Lang::Json,
    Lang::Markdown,
];

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "rs" => Some(Lang::Rust),
        "py" | "pyi" => Some(Lang::Python),
        "js" | "jsx" | "mjs" | "cjs" => Some(Lang::JavaScript),
        "ts" | "tsx" | "mts" | "cts" => Some(Lang::TypeScript),
        "go" => Some(Lang::Go),
        "java" => Some(Lang::Java),
        "kt" | "kts" => Some(Lang::Kotlin),
        "cs" => Some(Lang::CSharp),
        "c" | "h" => Some(Lang::C),
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => Some(Lang::Cpp),
        "rb" => Some(Lang::Ruby),
        "php" => Some(Lang::Php),
        "swift" => Some(Lang::Swift),
        "scala" | "sc" => Some(Lang::Scala),
        "sh" | "bash" | "zsh" => Some(Lang::Bash),
        "sql" => Some(Lang::Sql),
        "toml" => Some(Lang::Toml),
        "yaml" | "yml" => Some(Lang::Yaml),
        "json" | "jsonc" => Some(Lang::Json),
        "md" | "markdown" => Some(Lang::Markdown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_known_extensions() {
        assert_eq!(detect_language(Path::new("src/main.rs")), Some(Lang::Rust));
        assert_eq!(detect_language(Path::new("app.PY")), Some(Lang::Python));
        assert_eq!(detect_language(Path::new("index.tsx")), Some(Lang::TypeScript));
        assert_eq!(detect_language(Path::new("lib/foo.hpp")), Some(Lang::Cpp));
        assert_eq!(detect_language(Path::new(".github/ci.yml")), Some(Lang::Yaml));
    }

    #[test]
    fn detect_unknown_returns_none() {
        assert_eq!(detect_language(Path::new("image.png")), None);
        assert_eq!(detect_language(Path::new("Makefile")), None);
    }

    #[test]
    fn id_round_trips() {
        for lang in ALL {
            assert_eq!(Lang::from_id(lang.id()), Some(lang));
        }
        assert_eq!(Lang::from_id("cobol"), None);
    }

    #[test]
    fn serde_uses_id() {
        let json = serde_json::to_string(&Lang::JavaScript).unwrap();
        assert_eq!(json, "\"javascript\"");
        let json = serde_json::to_string(&Lang::CSharp).unwrap();
        assert_eq!(json, "\"csharp\"");
    }
}

//! Line-oriented symbol detection.
//!
//! A cheap regex pass per language picks up function, type and class names so
//! chunks carry searchable identifiers without a full parser.

use std::sync::LazyLock;

use regex::Regex;

use crate::languages::Lang;

/// Upper bound on symbols recorded per chunk.
const MAX_SYMBOLS: usize = 32;

static RUST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|const|unsafe|extern\s+"[^"]*")\s+)*(?:(?:fn|struct|enum|trait|type|mod|union)\s+|macro_rules!\s*)([A-Za-z_][A-Za-z0-9_]*)"#,
    )
    .unwrap()
});

static PYTHON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)").unwrap());

static JS_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:async\s+)?(?:function\*?|class|interface|type|enum)\s+([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});

static JS_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=>",
    )
    .unwrap()
});

static GO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:func\s+(?:\([^)]*\)\s*)?|type\s+)([A-Za-z_]\w*)").unwrap()
});

static JVM_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|internal|static|final|abstract|sealed|open|data|partial|case|enum|annotation)\s+)*(?:class|interface|enum|record|struct|object|trait|protocol|extension)\s+([A-Za-z_]\w*)",
    )
    .unwrap()
});

static JVM_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|internal|static|final|abstract|open|override|suspend|inline|async|virtual|synchronized)\s+)*(?:fun|func|def)\s+(?:<[^>]*>\s*)?(?:[A-Za-z_]\w*\.)?([A-Za-z_]\w*)",
    )
    .unwrap()
});

static JAVA_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|override|virtual|async)\s+)+[\w<>\[\],.?]+\s+([A-Za-z_]\w*)\s*\(",
    )
    .unwrap()
});

static C_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:typedef\s+)?(?:class|struct|union|enum|namespace)\s+([A-Za-z_]\w*)")
        .unwrap()
});

static C_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z_][\w:<>]*[\s*&]+)+([A-Za-z_][\w:~]*)\s*\([^;]*$").unwrap()
});

static RUBY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:def|class|module)\s+(?:self\.)?([A-Za-z_]\w*[?!]?)").unwrap()
});

static PHP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|abstract|final)\s+)*(?:function|class|interface|trait|enum)\s+([A-Za-z_]\w*)",
    )
    .unwrap()
});

static SHELL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:function\s+([A-Za-z_][\w-]*)|([A-Za-z_][\w-]*)\s*\(\)\s*\{)").unwrap()
});

static SQL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*create\s+(?:or\s+replace\s+)?(?:table|view|function|procedure|index|trigger)\s+(?:if\s+not\s+exists\s+)?([A-Za-z_][\w.]*)",
    )
    .unwrap()
});

const C_KEYWORDS: &[&str] = &["if", "for", "while", "switch", "return", "sizeof", "else"];

fn patterns(lang: Lang) -> Vec<&'static Regex> {
    match lang {
        Lang::Rust => vec![&*RUST_RE],
        Lang::Python => vec![&*PYTHON_RE],
        Lang::JavaScript | Lang::TypeScript => vec![&*JS_DECL_RE, &*JS_ARROW_RE],
        Lang::Go => vec![&*GO_RE],
        Lang::Java | Lang::CSharp => vec![&*JVM_TYPE_RE, &*JAVA_METHOD_RE],
        Lang::Kotlin | Lang::Swift | Lang::Scala => vec![&*JVM_TYPE_RE, &*JVM_FN_RE],
        Lang::C | Lang::Cpp => vec![&*C_TYPE_RE, &*C_FN_RE],
        Lang::Ruby => vec![&*RUBY_RE],
        Lang::Php => vec![&*PHP_RE],
        Lang::Bash => vec![&*SHELL_RE],
        Lang::Sql => vec![&*SQL_RE],
        Lang::Toml | Lang::Yaml | Lang::Json | Lang::Markdown => Vec::new(),
    }
}

/// Detect declared names in `content`, in order of first appearance.
///
/// Unknown language tags yield no symbols.
#[must_use]
pub fn extract_symbols(language: &str, content: &str) -> Vec<String> {
    let Some(lang) = Lang::from_id(language) else {
        return Vec::new();
    };
    let patterns = patterns(lang);
    if patterns.is_empty() {
        return Vec::new();
    }

    let mut symbols: Vec<String> = Vec::new();
    for line in content.lines() {
        for re in &patterns {
            let Some(caps) = re.captures(line) else {
                continue;
            };
            let Some(name) = caps.iter().skip(1).flatten().next() else {
                continue;
            };
            let name = name.as_str();
            if matches!(lang, Lang::C | Lang::Cpp) && C_KEYWORDS.contains(&name) {
                continue;
            }
            if !symbols.iter().any(|s| s == name) {
                symbols.push(name.to_owned());
            }
            break;
        }
        if symbols.len() >= MAX_SYMBOLS {
            break;
        }
    }
    symbols
}

//! Fast in-process syntax checks, run before any model-based audit.
//!
//! Data formats are parsed for real. Source files get a delimiter balance
//! check that skips strings and comments; it catches truncated output,
//! the most common generation failure, without a language toolchain.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lang {
    /// `#` comments, triple-quoted strings
    Python,
    /// `//` and `/* */` comments, `'`, `"` and `` ` `` strings
    CLike,
    /// Like `CLike`, but `'` starts a lifetime or char literal
    Rust,
}

impl Lang {
    fn slash_comments(self) -> bool {
        matches!(self, Self::CLike | Self::Rust)
    }
}

/// Check `content` as the language implied by `path`. `Err` carries a
/// human-readable reason.
pub fn check(path: &str, content: &str) -> Result<(), String> {
    let lower = path.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "json" => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid JSON: {}", e)),
        "toml" => toml::from_str::<toml::Table>(content)
            .map(|_| ())
            .map_err(|e| format!("invalid TOML: {}", e)),
        "yml" | "yaml" => check_yaml(content),
        "py" => check_delimiters(content, Lang::Python),
        "rs" => check_delimiters(content, Lang::Rust),
        "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "go" | "java" | "c" | "h" | "cpp" | "cs"
        | "css" => check_delimiters(content, Lang::CLike),
        _ => Ok(()),
    }
}

fn check_yaml(content: &str) -> Result<(), String> {
    for document in serde_yaml::Deserializer::from_str(content) {
        serde_yaml::Value::deserialize(document).map_err(|e| format!("invalid YAML: {}", e))?;
    }
    Ok(())
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn check_delimiters(content: &str, lang: Lang) -> Result<(), String> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '#' if lang == Lang::Python => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if lang.slash_comments() && next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if lang.slash_comments() && next == Some('*') => {
                let start = line;
                i += 2;
                loop {
                    if i >= chars.len() {
                        return Err(format!("unterminated block comment starting on line {}", start));
                    }
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            '`' if lang == Lang::Python => {}
            '\'' if lang == Lang::Rust => {
                i = skip_rust_quote(&chars, i);
                continue;
            }
            '"' | '\'' | '`' => {
                let triple = lang == Lang::Python
                    && c != '`'
                    && next == Some(c)
                    && chars.get(i + 2) == Some(&c);
                let start = line;
                match skip_string(&chars, i, c, triple, &mut line) {
                    Some(end) => i = end,
                    // A stray apostrophe (JSX text, prose in templates) is not a string.
                    None if c == '\'' && lang == Lang::CLike => i += 1,
                    None => return Err(format!("unterminated string starting on line {}", start)),
                }
                continue;
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closing_for(open) == c => {}
                Some((open, open_line)) => {
                    return Err(format!(
                        "mismatched '{}' on line {} (opened '{}' on line {})",
                        c, line, open, open_line
                    ));
                }
                None => return Err(format!("unexpected '{}' on line {}", c, line)),
            },
            _ => {}
        }
        i += 1;
    }

    match stack.last() {
        Some((open, open_line)) => Err(format!("unclosed '{}' opened on line {}", open, open_line)),
        None => Ok(()),
    }
}

/// Index just past the closing quote, or `None` when the string never ends.
fn skip_string(
    chars: &[char],
    start: usize,
    quote: char,
    triple: bool,
    line: &mut usize,
) -> Option<usize> {
    let mut i = start + if triple { 3 } else { 1 };
    let mut lines = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if chars.get(i + 1) == Some(&'\n') {
                lines += 1;
            }
            i += 2;
            continue;
        }
        if c == '\n' {
            lines += 1;
            // Only triple-quoted and template strings span lines.
            if !triple && quote != '`' {
                return None;
            }
        }
        if c == quote {
            if !triple {
                *line += lines;
                return Some(i + 1);
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                *line += lines;
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

/// Skip a Rust char literal (`'x'`, `'\n'`, `'\u{1F600}'`) or a lifetime tick.
fn skip_rust_quote(chars: &[char], start: usize) -> usize {
    match chars.get(start + 1) {
        Some('\\') => {
            let limit = (start + 12).min(chars.len());
            (start + 2..limit)
                .find(|&j| chars[j] == '\'')
                .map(|j| j + 1)
                .unwrap_or(start + 1)
        }
        Some(_) if chars.get(start + 2) == Some(&'\'') => start + 3,
        _ => start + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_formats() {
        assert!(check("package.json", r#"{"name": "x"}"#).is_ok());
        assert!(check("package.json", r#"{"name": }"#).is_err());
        assert!(check("pyproject.toml", "[project]\nname = \"x\"\n").is_ok());
        assert!(check("pyproject.toml", "[project\n").is_err());
        assert!(check("ci.yml", "a: 1\n---\nb: [1, 2]\n").is_ok());
        assert!(check("ci.yml", "a: [1, 2\n").is_err());
    }

    #[test]
    fn test_python_balanced_with_strings_and_comments() {
        let src = r#"
def f(x):
    s = "unbalanced ( in string"
    t = '''triple
    with ] bracket'''
    # comment with {
    return [x, {"k": (1, 2)}]
"#;
        assert!(check("app/main.py", src).is_ok());
    }

    #[test]
    fn test_python_truncated_output() {
        let err = check("app/main.py", "def f(x):\n    return [1, 2,\n").unwrap_err();
        assert!(err.contains("unclosed '['"));
        let err = check("app/main.py", "x = \"abc\n").unwrap_err();
        assert!(err.contains("unterminated string"));
    }

    #[test]
    fn test_slash_languages() {
        assert!(check("web/app.ts", "const a = `x ${b}`; // {\n/* ( */ f(a);\n").is_ok());
        let err = check("web/app.ts", "function f() {\n  return (1;\n}\n").unwrap_err();
        assert!(err.contains("mismatched"));
        assert!(check("web/App.jsx", "const p = <p>don't panic</p>;\n").is_ok());
    }

    #[test]
    fn test_rust_lifetimes_and_chars() {
        assert!(check("src/lib.rs", "fn f<'a>(x: &'a str) -> char { '(' }\n").is_ok());
        assert!(check("src/lib.rs", "fn g() -> char { '\\n' }\n").is_ok());
        assert!(check("src/lib.rs", "fn h() {\n").is_err());
    }

    #[test]
    fn test_unknown_extension_passes() {
        assert!(check("README.md", "((((").is_ok());
        assert!(check("Dockerfile", "RUN echo {").is_ok());
    }
}

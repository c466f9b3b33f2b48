//! Import extraction and dependency-manifest reading for the G2/G3 checks.

use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

static PY_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+([A-Za-z_][\w.]*(?:\s*,\s*[A-Za-z_][\w.]*)*)").unwrap());

static PY_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+(\.*)([A-Za-z_][\w.]*)?\s+import\b").unwrap());

static JS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:import\s[^'"]*?from\s*|import\s*\(?\s*|require\s*\(\s*|export\s[^'"]*?from\s*)['"]([^'"]+)['"]"#)
        .unwrap()
});

static REQUIREMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._\-]*)").unwrap());

/// Import name → distribution name, for the common mismatches.
const PYTHON_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("yaml", "pyyaml"),
    ("sklearn", "scikit-learn"),
    ("cv2", "opencv-python"),
    ("bs4", "beautifulsoup4"),
    ("jwt", "pyjwt"),
    ("dotenv", "python-dotenv"),
    ("jose", "python-jose"),
    ("dateutil", "python-dateutil"),
    ("multipart", "python-multipart"),
    ("psycopg2", "psycopg2-binary"),
    ("magic", "python-magic"),
    ("google", "google-api-python-client"),
    ("attr", "attrs"),
    ("pydantic_settings", "pydantic-settings"),
];

/// Packages that satisfy an import besides the aliased name.
const PYTHON_PROVIDERS: &[(&str, &[&str])] = &[
    ("psycopg2", &["psycopg2", "psycopg2-binary"]),
    ("jose", &["python-jose", "jose"]),
    ("jwt", &["pyjwt", "python-jose"]),
    ("starlette", &["starlette", "fastapi"]),
    ("pydantic", &["pydantic", "fastapi", "pydantic-settings"]),
    ("uvicorn", &["uvicorn", "uvicorn[standard]"]),
    ("sqlalchemy", &["sqlalchemy", "sqlmodel"]),
    ("pytest", &["pytest", "pytest-asyncio", "pytest-cov"]),
];

const PYTHON_STDLIB: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "atexit", "base64", "binascii",
    "bisect", "builtins", "bz2", "calendar", "cgi", "cmath", "codecs", "collections",
    "colorsys", "concurrent", "configparser", "contextlib", "contextvars", "copy", "copyreg",
    "csv", "ctypes", "dataclasses", "datetime", "decimal", "difflib", "dis", "email",
    "encodings", "enum", "errno", "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch",
    "fractions", "ftplib", "functools", "gc", "getpass", "gettext", "glob", "graphlib", "gzip",
    "hashlib", "heapq", "hmac", "html", "http", "imaplib", "importlib", "inspect", "io",
    "ipaddress", "itertools", "json", "keyword", "linecache", "locale", "logging", "lzma",
    "mailbox", "marshal", "math", "mimetypes", "mmap", "multiprocessing", "netrc", "numbers",
    "operator", "os", "pathlib", "pdb", "pickle", "pkgutil", "platform", "plistlib", "pprint",
    "profile", "pstats", "queue", "quopri", "random", "re", "reprlib", "resource", "sched",
    "secrets", "select", "selectors", "shelve", "shlex", "shutil", "signal", "site", "smtplib",
    "socket", "socketserver", "sqlite3", "ssl", "stat", "statistics", "string", "stringprep",
    "struct", "subprocess", "sys", "sysconfig", "tarfile", "tempfile", "textwrap", "threading",
    "time", "timeit", "tkinter", "token", "tokenize", "tomllib", "trace", "traceback",
    "tracemalloc", "types", "typing", "unicodedata", "unittest", "urllib", "uuid", "venv",
    "warnings", "wave", "weakref", "webbrowser", "wsgiref", "xml", "xmlrpc", "zipfile",
    "zipimport", "zlib", "zoneinfo",
];

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "cluster", "crypto", "dgram", "dns", "events", "fs",
    "http", "http2", "https", "net", "os", "path", "perf_hooks", "process", "querystring",
    "readline", "stream", "string_decoder", "timers", "tls", "tty", "url", "util", "v8", "vm",
    "worker_threads", "zlib",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ecosystem {
    Python,
    Node,
}

/// A third-party candidate import.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportRef {
    pub ecosystem: Ecosystem,
    /// Top-level module or package name as written
    pub name: String,
}

pub fn ecosystem_for(path: &str) -> Option<Ecosystem> {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_lowercase())?;
    match ext.as_str() {
        "py" => Some(Ecosystem::Python),
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Ecosystem::Node),
        _ => None,
    }
}

/// Absolute top-level imports of a file. Relative imports are skipped.
pub fn extract_imports(path: &str, content: &str) -> Vec<String> {
    let mut names = BTreeSet::new();
    match ecosystem_for(path) {
        Some(Ecosystem::Python) => {
            for line in content.lines() {
                if let Some(caps) = PY_FROM.captures(line) {
                    if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
                        continue;
                    }
                    if let Some(module) = caps.get(2) {
                        names.insert(top_level(module.as_str(), '.'));
                    }
                } else if let Some(caps) = PY_IMPORT.captures(line) {
                    for module in caps[1].split(',') {
                        names.insert(top_level(module.trim(), '.'));
                    }
                }
            }
        }
        Some(Ecosystem::Node) => {
            for caps in JS_IMPORT.captures_iter(content) {
                let spec = &caps[1];
                if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("@/") || spec.starts_with("~/") {
                    continue;
                }
                names.insert(node_package(spec));
            }
        }
        None => {}
    }
    names.into_iter().filter(|n| !n.is_empty()).collect()
}

fn top_level(module: &str, sep: char) -> String {
    module.split(sep).next().unwrap_or("").trim().to_string()
}

fn node_package(spec: &str) -> String {
    let spec = spec.strip_prefix("node:").unwrap_or(spec);
    let mut parts = spec.split('/');
    match parts.next() {
        Some(scope) if scope.starts_with('@') => match parts.next() {
            Some(name) => format!("{}/{}", scope, name),
            None => scope.to_string(),
        },
        Some(name) => name.to_string(),
        None => String::new(),
    }
}

pub fn is_stdlib(ecosystem: Ecosystem, name: &str) -> bool {
    match ecosystem {
        Ecosystem::Python => PYTHON_STDLIB.contains(&name),
        Ecosystem::Node => NODE_BUILTINS.contains(&name),
    }
}

/// Normalise a distribution name for comparison (PEP 503 style).
pub fn normalize_package(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let base = lower.split('[').next().unwrap_or(&lower);
    base.replace(['_', '.'], "-")
}

/// Package names that would satisfy `import_name`.
pub fn candidate_packages(
    ecosystem: Ecosystem,
    import_name: &str,
    extra_aliases: &HashMap<String, String>,
) -> Vec<String> {
    if ecosystem == Ecosystem::Node {
        return vec![import_name.to_lowercase()];
    }
    let mut out = vec![normalize_package(import_name)];
    if let Some(pkg) = extra_aliases.get(import_name) {
        out.push(normalize_package(pkg));
    }
    if let Some((_, pkg)) = PYTHON_ALIASES.iter().find(|(imp, _)| *imp == import_name) {
        out.push(normalize_package(pkg));
    }
    let lower = import_name.to_lowercase();
    if let Some((_, pkgs)) = PYTHON_PROVIDERS.iter().find(|(imp, _)| *imp == lower) {
        out.extend(pkgs.iter().map(|p| normalize_package(p)));
    }
    out.sort();
    out.dedup();
    out
}

/// Packages declared in the project's dependency manifests.
#[derive(Debug, Default, Clone)]
pub struct DeclaredDeps {
    pub python: HashSet<String>,
    pub node: HashSet<String>,
    /// Manifest files that were found
    pub sources: Vec<String>,
}

impl DeclaredDeps {
    pub fn has_manifest(&self, ecosystem: Ecosystem) -> bool {
        self.sources.iter().any(|s| match ecosystem {
            Ecosystem::Python => s.ends_with(".txt") || s.ends_with("pyproject.toml"),
            Ecosystem::Node => s.ends_with("package.json"),
        })
    }

    pub fn satisfies(&self, ecosystem: Ecosystem, candidates: &[String]) -> bool {
        let set = match ecosystem {
            Ecosystem::Python => &self.python,
            Ecosystem::Node => &self.node,
        };
        candidates.iter().any(|c| set.contains(c))
    }
}

/// Read `requirements*.txt`, `pyproject.toml` and `package.json` at the root.
pub fn read_declared_deps(root: &Path) -> DeclaredDeps {
    let mut deps = DeclaredDeps::default();
    for name in ["requirements.txt", "requirements-dev.txt", "requirements/base.txt"] {
        if let Ok(content) = std::fs::read_to_string(root.join(name)) {
            deps.sources.push(name.to_string());
            deps.python.extend(parse_requirements(&content));
        }
    }
    if let Ok(content) = std::fs::read_to_string(root.join("pyproject.toml")) {
        deps.sources.push("pyproject.toml".to_string());
        deps.python.extend(parse_pyproject(&content));
    }
    if let Ok(content) = std::fs::read_to_string(root.join("package.json")) {
        deps.sources.push("package.json".to_string());
        deps.node.extend(parse_package_json(&content));
    }
    deps
}

pub fn parse_requirements(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty() && !l.starts_with('-'))
        .filter_map(|l| REQUIREMENT_NAME.captures(l).map(|c| normalize_package(&c[1])))
        .collect()
}

fn parse_pyproject(content: &str) -> Vec<String> {
    let Ok(doc) = toml::from_str::<toml::Table>(content) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let project = doc.get("project").and_then(|p| p.as_table());
    if let Some(project) = project {
        let mut specs: Vec<&toml::Value> = project
            .get("dependencies")
            .and_then(|d| d.as_array())
            .map(|a| a.iter().collect())
            .unwrap_or_default();
        if let Some(optional) = project.get("optional-dependencies").and_then(|o| o.as_table()) {
            for group in optional.values().filter_map(|g| g.as_array()) {
                specs.extend(group.iter());
            }
        }
        for spec in specs.into_iter().filter_map(|s| s.as_str()) {
            if let Some(c) = REQUIREMENT_NAME.captures(spec) {
                out.push(normalize_package(&c[1]));
            }
        }
    }
    let poetry = doc
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.as_table());
    if let Some(poetry) = poetry {
        for key in ["dependencies", "dev-dependencies"] {
            if let Some(table) = poetry.get(key).and_then(|d| d.as_table()) {
                out.extend(table.keys().filter(|k| *k != "python").map(|k| normalize_package(k)));
            }
        }
        if let Some(groups) = poetry.get("group").and_then(|g| g.as_table()) {
            for group in groups.values() {
                if let Some(table) = group.get("dependencies").and_then(|d| d.as_table()) {
                    out.extend(table.keys().map(|k| normalize_package(k)));
                }
            }
        }
    }
    out
}

fn parse_package_json(content: &str) -> Vec<String> {
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(content) else {
        return Vec::new();
    };
    ["dependencies", "devDependencies", "peerDependencies", "optionalDependencies"]
        .iter()
        .filter_map(|key| doc.get(*key).and_then(|d| d.as_object()))
        .flat_map(|deps| deps.keys().map(|k| k.to_lowercase()))
        .collect()
}

/// Top-level names that resolve to project code rather than packages.
pub fn local_modules(files: &[String]) -> HashSet<String> {
    let mut local = HashSet::new();
    for file in files {
        let first = file.split('/').next().unwrap_or("");
        if file.contains('/') {
            local.insert(first.to_string());
            // src-layout packages
            if first == "src"
                && let Some(pkg) = file.split('/').nth(1)
            {
                local.insert(pkg.trim_end_matches(".py").to_string());
            }
        } else if let Some(stem) = file.strip_suffix(".py") {
            local.insert(stem.to_string());
        }
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_imports() {
        let src = "\
import os, sys
import numpy as np
from fastapi import APIRouter
from app.core.config import settings
from . import sibling
from ..models import User
    import yaml
";
        assert_eq!(
            extract_imports("app/main.py", src),
            vec!["app", "fastapi", "numpy", "os", "sys", "yaml"]
        );
    }

    #[test]
    fn test_node_imports() {
        let src = r#"
import React from 'react';
import { z } from "zod";
import './styles.css';
const fs = require('fs');
import type { X } from '@tanstack/react-query/build';
export { y } from 'lodash/fp';
const m = await import('node:path');
import api from '@/lib/api';
"#;
        assert_eq!(
            extract_imports("web/src/App.tsx", src),
            vec!["@tanstack/react-query", "fs", "lodash", "path", "react", "zod"]
        );
    }

    #[test]
    fn test_alias_candidates() {
        let none = HashMap::new();
        let c = candidate_packages(Ecosystem::Python, "PIL", &none);
        assert!(c.contains(&"pillow".to_string()));
        let c = candidate_packages(Ecosystem::Python, "yaml", &none);
        assert!(c.contains(&"pyyaml".to_string()));
        let mut extra = HashMap::new();
        extra.insert("foo".to_string(), "Foo_Bar".to_string());
        assert!(candidate_packages(Ecosystem::Python, "foo", &extra).contains(&"foo-bar".to_string()));
    }

    #[test]
    fn test_requirements_parsing() {
        let reqs = parse_requirements(
            "fastapi==0.110\nuvicorn[standard]>=0.29  # server\n-r base.txt\n\nSQLAlchemy\npython_dotenv\n",
        );
        assert_eq!(reqs, vec!["fastapi", "uvicorn", "sqlalchemy", "python-dotenv"]);
    }

    #[test]
    fn test_pyproject_and_package_json() {
        let py = parse_pyproject(
            "[project]\ndependencies = [\"httpx>=0.27\", \"Pydantic\"]\n[tool.poetry.dependencies]\npython = \"^3.12\"\nredis = \"*\"\n",
        );
        assert!(py.contains(&"httpx".to_string()));
        assert!(py.contains(&"pydantic".to_string()));
        assert!(py.contains(&"redis".to_string()));
        assert!(!py.contains(&"python".to_string()));

        let js = parse_package_json(r#"{"dependencies":{"react":"^18"},"devDependencies":{"Vitest":"1"}}"#);
        assert!(js.contains(&"react".to_string()));
        assert!(js.contains(&"vitest".to_string()));
    }

    #[test]
    fn test_local_modules() {
        let files = vec![
            "app/main.py".to_string(),
            "settings.py".to_string(),
            "src/mypkg/__init__.py".to_string(),
        ];
        let local = local_modules(&files);
        assert!(local.contains("app"));
        assert!(local.contains("settings"));
        assert!(local.contains("mypkg"));
    }
}

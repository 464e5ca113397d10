use std::collections::HashMap;
use std::sync::Arc;

use crate::core::errors::JudgeError;
use crate::core::traits::adapter::{CodeAdapter, VerbatimAdapter};

/// Multi-language runtime image shared by the most common languages.
pub const JUDGE_IMAGE: &str = "judge-runtime:latest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageSpec {
    /// Canonical display name, e.g. `C++`.
    pub name: String,
    pub image: String,
    pub source_file: String,
    pub compile_command: Option<String>,
    pub run_command: String,
    /// Stdout is a single JSON value rather than free text.
    pub auto_wrap: bool,
    /// Memory the compile step needs when it exceeds the run limit.
    pub compile_memory_mb: Option<u64>,
    /// Applied to a caller-supplied time limit.
    pub time_multiplier: u64,
}

impl LanguageSpec {
    fn new(name: &str, image: &str, source_file: &str, run_command: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            source_file: source_file.to_string(),
            compile_command: None,
            run_command: run_command.to_string(),
            auto_wrap: false,
            compile_memory_mb: None,
            time_multiplier: 3,
        }
    }

    fn compiled(mut self, command: &str) -> Self {
        self.compile_command = Some(command.to_string());
        self
    }

    fn auto_wrap(mut self) -> Self {
        self.auto_wrap = true;
        self
    }

    fn multiplier(mut self, factor: u64) -> Self {
        self.time_multiplier = factor;
        self
    }

    fn compile_memory(mut self, memory_mb: u64) -> Self {
        self.compile_memory_mb = Some(memory_mb);
        self
    }
}

#[derive(Debug)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageSpec>,
    /// Lowercase key -> canonical name.
    keys: HashMap<String, String>,
    adapter: Arc<dyn CodeAdapter>,
}

impl LanguageRegistry {
    pub fn new(adapter: Arc<dyn CodeAdapter>) -> Self {
        Self {
            languages: HashMap::new(),
            keys: HashMap::new(),
            adapter,
        }
    }

    pub fn with_defaults(adapter: Arc<dyn CodeAdapter>) -> Self {
        let mut registry = Self::new(adapter);
        for (key, spec) in default_languages() {
            registry.register(key, spec);
        }
        registry
    }

    pub fn register(&mut self, key: &str, spec: LanguageSpec) {
        let name = spec.name.clone();
        self.keys.insert(key.to_lowercase(), name.clone());
        self.keys.insert(name.to_lowercase(), name.clone());
        self.languages.insert(name, spec);
    }

    /// Maps a caller-supplied identifier (`python3`, `CPP`, `C++`) to its spec.
    pub fn resolve(&self, language: &str) -> Result<&LanguageSpec, JudgeError> {
        if let Some(spec) = self.languages.get(language) {
            return Ok(spec);
        }
        self.keys
            .get(&language.trim().to_lowercase())
            .and_then(|name| self.languages.get(name))
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    pub fn wrap(&self, language: &LanguageSpec, source: &str) -> String {
        self.adapter.wrap(language, source)
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::with_defaults(Arc::new(VerbatimAdapter))
    }
}

fn default_languages() -> Vec<(&'static str, LanguageSpec)> {
    vec![
        (
            "javascript",
            LanguageSpec::new("JavaScript", "node:20-alpine", "solution.js", "node /w/solution.js")
                .auto_wrap(),
        ),
        (
            "typescript",
            LanguageSpec::new("TypeScript", "node-ts:20", "solution.ts", "node /w/solution.js")
                .compiled("esbuild /w/solution.ts --bundle --platform=node --outfile=/w/solution.js 2>/dev/null")
                .auto_wrap(),
        ),
        (
            "python3",
            LanguageSpec::new("Python3", JUDGE_IMAGE, "solution.py", "python3 /w/solution.py")
                .auto_wrap(),
        ),
        (
            "python",
            LanguageSpec::new("Python", JUDGE_IMAGE, "solution.py", "python3 /w/solution.py")
                .auto_wrap(),
        ),
        (
            "cpp",
            LanguageSpec::new("C++", JUDGE_IMAGE, "solution.cpp", "/w/prog")
                .compiled("g++ -O2 -std=c++23 -o /w/prog /w/solution.cpp")
                .auto_wrap()
                .multiplier(1)
                .compile_memory(768),
        ),
        (
            "c",
            LanguageSpec::new("C", "gcc:13", "solution.c", "/w/prog")
                .compiled("gcc -O2 -o /w/prog /w/solution.c")
                .multiplier(1),
        ),
        (
            "java",
            LanguageSpec::new(
                "Java",
                JUDGE_IMAGE,
                "Solution.java",
                "java -cp /usr/local/lib/gson.jar:/w Solution",
            )
            .compiled("javac -encoding UTF-8 -cp /usr/local/lib/gson.jar -d /w /w/Solution.java")
            .auto_wrap()
            .multiplier(2),
        ),
        (
            "csharp",
            LanguageSpec::new(
                "C#",
                "mcr.microsoft.com/dotnet/sdk:8.0",
                "solution.csx",
                "dotnet script /w/solution.csx",
            ),
        ),
        (
            "go",
            LanguageSpec::new("Go", "golang:1.21-alpine", "solution.go", "go run /w/solution.go")
                .multiplier(2),
        ),
        (
            "kotlin",
            LanguageSpec::new(
                "Kotlin",
                "eclipse-temurin:21-jdk-alpine",
                "solution.kt",
                "java -jar /w/prog.jar",
            )
            .compiled("kotlinc /w/solution.kt -include-runtime -d /w/prog.jar")
            .multiplier(2),
        ),
        (
            "swift",
            LanguageSpec::new(
                "Swift",
                "swift:5.9-slim",
                "solution.swift",
                "swift /w/solution.swift",
            ),
        ),
        (
            "rust",
            LanguageSpec::new("Rust", "rust:1.74-alpine", "solution.rs", "/w/prog")
                .compiled("rustc -o /w/prog /w/solution.rs")
                .multiplier(1),
        ),
        (
            "ruby",
            LanguageSpec::new("Ruby", "ruby:3.2-alpine", "solution.rb", "ruby /w/solution.rb")
                .auto_wrap(),
        ),
        (
            "php",
            LanguageSpec::new("PHP", "php:8.2-alpine", "solution.php", "php /w/solution.php")
                .auto_wrap(),
        ),
        (
            "dart",
            LanguageSpec::new("Dart", "dart:stable", "solution.dart", "dart /w/solution.dart"),
        ),
        (
            "scala",
            LanguageSpec::new(
                "Scala",
                "sbtscala/scala-sbt",
                "solution.scala",
                "scala -cp /w Solution",
            )
            .compiled("scalac /w/solution.scala -d /w")
            .multiplier(2),
        ),
        (
            "elixir",
            LanguageSpec::new(
                "Elixir",
                "elixir:1.15-alpine",
                "solution.exs",
                "elixir /w/solution.exs",
            ),
        ),
        (
            "erlang",
            LanguageSpec::new(
                "Erlang",
                "erlang:26-alpine",
                "solution.erl",
                "erl -noshell -pa /w -s solution main -s init stop",
            )
            .compiled("erlc /w/solution.erl -o /w"),
        ),
        (
            "racket",
            LanguageSpec::new("Racket", "racket:latest", "solution.rkt", "racket /w/solution.rkt"),
        ),
    ]
}

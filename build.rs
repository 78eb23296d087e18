use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are linted.
const SOURCE_ROOTS: [&str; 4] = ["combat", "cli", "tests", "benches"];

/// A house rule checked line by line over every source file.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    advice: &'static str,
    skip_comments_and_strings: bool,
}

const RULES: [Rule; 3] = [
    Rule {
        name: "underscore-prefixed bindings",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        advice: "Either use the binding (removing the underscore) or remove it completely.",
        skip_comments_and_strings: true,
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        advice: "Either use the code (removing the attribute) or remove it completely.",
        skip_comments_and_strings: false,
    },
    Rule {
        name: "change-log comments",
        pattern: r"(//|/\*).*\b(?:FIXED|CORRECTED|FIX|CHANGED|MODIFIED|UPDATED)\b",
        advice: "Comments describe the code as it is, not how it got there. Remove them.",
        skip_comments_and_strings: false,
    },
];

// Collects every matching line of one file so a single error lists them all.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    skip_comments_and_strings: bool,
}

impl ViolationCollector {
    fn new(file_path: &Path, rule: &Rule) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            skip_comments_and_strings: rule.skip_comments_and_strings,
        }
    }

    fn check_and_get_error_message(&self, rule: &Rule) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            rule.name,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!(
            "\n⚠️ {} are not allowed in this project.\n   {}\n",
            rule.name, rule.advice
        ));

        Some(error_msg)
    }
}

fn is_comment_or_string(line_text: &str) -> bool {
    let trimmed = line_text.trim_start();
    if trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*') {
        return true;
    }
    // Odd-numbered segments between quotes are string contents.
    line_text
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_comments_and_strings && is_comment_or_string(line_text) {
            return Ok(true);
        }

        // Same shape as `rg -n` output.
        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS.into_iter().flat_map(|root| {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn enforce(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = ViolationCollector::new(&path, rule);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message(rule) {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    for rule in &RULES {
        if let Err(e) = enforce(rule) {
            // `eprintln!` is what surfaces the message in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

//! Project tooling detection
//!
//! Looks at repository markers to guess the build / test / lint commands the
//! fixer should run. User-declared commands always win over detection.

use sift_core::ProjectConfig;
use std::fs;
use std::path::Path;

/// Commands passed explicitly on `sift init`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectOverrides {
    pub build: Option<String>,
    pub test: Option<String>,
    pub lint: Option<String>,
}

impl ProjectOverrides {
    pub fn is_empty(&self) -> bool {
        self.build.is_none() && self.test.is_none() && self.lint.is_none()
    }
}

/// Detect tooling, then layer overrides on top.
pub fn resolve_project_config(repo_root: &Path, overrides: &ProjectOverrides) -> ProjectConfig {
    let mut config = detect_project_config(repo_root);
    let pick = |value: &Option<String>| value.as_ref().filter(|v| !v.trim().is_empty()).cloned();
    if let Some(build) = pick(&overrides.build) {
        config.build_command = Some(build);
    }
    if let Some(test) = pick(&overrides.test) {
        config.test_command = Some(test);
    }
    if let Some(lint) = pick(&overrides.lint) {
        config.lint_command = Some(lint);
    }
    if !overrides.is_empty() && config.detected_from.is_none() {
        config.detected_from = Some("user".to_string());
    }
    config
}

pub fn detect_project_config(repo_root: &Path) -> ProjectConfig {
    if repo_root.join("Cargo.toml").exists() {
        let locked = if repo_root.join("Cargo.lock").exists() {
            " --locked"
        } else {
            ""
        };
        return ProjectConfig {
            build_command: Some(format!("cargo check{}", locked)),
            test_command: Some(format!("cargo test{}", locked)),
            lint_command: Some("cargo clippy --all-targets".to_string()),
            detected_from: Some("cargo".to_string()),
        };
    }

    if let Some(config) = detect_js(repo_root) {
        return config;
    }

    if repo_root.join("go.mod").exists() {
        return ProjectConfig {
            build_command: Some("go build ./...".to_string()),
            test_command: Some("go test ./...".to_string()),
            lint_command: Some("go vet ./...".to_string()),
            detected_from: Some("go".to_string()),
        };
    }

    if let Some(config) = detect_python(repo_root) {
        return config;
    }

    ProjectConfig::default()
}

fn detect_js(repo_root: &Path) -> Option<ProjectConfig> {
    let content = fs::read_to_string(repo_root.join("package.json")).ok()?;
    let parsed: serde_json::Value = match serde_json::from_str(&content) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, "package.json is not valid JSON; skipping detection");
            return None;
        }
    };
    let scripts = parsed.get("scripts").and_then(|v| v.as_object());
    let runner = js_runner(repo_root);
    let script = |candidates: &[&str]| {
        scripts.and_then(|scripts| {
            candidates
                .iter()
                .find(|name| scripts.get(**name).and_then(|v| v.as_str()).is_some())
                .map(|name| format!("{} {}", runner, name))
        })
    };

    Some(ProjectConfig {
        build_command: script(&["build", "typecheck", "type-check"]),
        test_command: script(&["test:once", "test"]),
        lint_command: script(&["lint", "check:lint"]),
        detected_from: Some("npm".to_string()),
    })
}

fn js_runner(repo_root: &Path) -> &'static str {
    if repo_root.join("pnpm-lock.yaml").exists() {
        "pnpm"
    } else if repo_root.join("yarn.lock").exists() {
        "yarn"
    } else if repo_root.join("bun.lockb").exists() || repo_root.join("bun.lock").exists() {
        "bun run"
    } else {
        "npm run"
    }
}

fn detect_python(repo_root: &Path) -> Option<ProjectConfig> {
    let pyproject = repo_root.join("pyproject.toml");
    let has_marker = pyproject.exists()
        || repo_root.join("requirements.txt").exists()
        || repo_root.join("setup.py").exists()
        || repo_root.join("setup.cfg").exists();
    if !has_marker {
        return None;
    }

    let tool = fs::read_to_string(&pyproject)
        .ok()
        .and_then(|content| match content.parse::<toml::Table>() {
            Ok(table) => Some(table),
            Err(err) => {
                tracing::warn!(error = %err, "pyproject.toml did not parse; using defaults");
                None
            }
        })
        .and_then(|table| table.get("tool").and_then(|t| t.as_table()).cloned())
        .unwrap_or_default();

    let prefix = if tool.contains_key("poetry") {
        "poetry run "
    } else if tool.contains_key("uv") {
        "uv run "
    } else {
        ""
    };
    let lint = if tool.contains_key("ruff") {
        Some(format!("{}ruff check .", prefix))
    } else if tool.contains_key("flake8") {
        Some(format!("{}flake8", prefix))
    } else {
        None
    };

    Some(ProjectConfig {
        build_command: Some(format!("{}python3 -m compileall -q .", prefix)),
        test_command: Some(format!("{}python3 -m pytest -q", prefix)),
        lint_command: lint,
        detected_from: Some("python".to_string()),
    })
}

//! Language-specific behaviour confined to a tagged variant, per the
//! "adding a language is a data change" design note: the orchestrator itself
//! never branches on language beyond looking up a recipe.

use crate::config::RuntimeSpec;
use crate::utils::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// A language tag, validated against the configured `runtimes` map at lookup
/// time rather than restricted to a closed Rust enum — new languages are a
/// config change, not a code change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Language(pub String);

impl Language {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Language {
    fn from(value: String) -> Self {
        Language(value)
    }
}

/// Compile step, run step, and entry-point convention for one language,
/// derived from `Config.runtimes[language]`.
#[derive(Debug, Clone)]
pub struct ExecRecipe {
    pub image: String,
    /// Optional compile invocation, run before `run_command` if present.
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
}

impl ExecRecipe {
    /// Build the recipe for `language` from its configured `RuntimeSpec` and
    /// the project's declared entry path. The entry convention is one of a
    /// small fixed set of tagged variants (spec.md §9 "represent as a tagged
    /// variant"); new conventions are added here, not scattered through the
    /// orchestrator.
    pub fn for_language(spec: &RuntimeSpec, entry_path: &str) -> Result<Self> {
        match spec.entry_convention.as_str() {
            "main.py" | "python" => Ok(ExecRecipe {
                image: spec.image.clone(),
                compile_command: None,
                run_command: vec!["python3".to_string(), entry_path.to_string()],
            }),
            "index.js" | "node" => Ok(ExecRecipe {
                image: spec.image.clone(),
                compile_command: None,
                run_command: vec!["node".to_string(), entry_path.to_string()],
            }),
            "main.go" | "go" => Ok(ExecRecipe {
                image: spec.image.clone(),
                compile_command: Some(vec![
                    "go".to_string(),
                    "build".to_string(),
                    "-o".to_string(),
                    "/workspace/.out".to_string(),
                    entry_path.to_string(),
                ]),
                run_command: vec!["/workspace/.out".to_string()],
            }),
            "main.rs" | "rust" => Ok(ExecRecipe {
                image: spec.image.clone(),
                compile_command: Some(vec![
                    "rustc".to_string(),
                    "-O".to_string(),
                    "-o".to_string(),
                    "/workspace/.out".to_string(),
                    entry_path.to_string(),
                ]),
                run_command: vec!["/workspace/.out".to_string()],
            }),
            "main.c" | "c" => Ok(ExecRecipe {
                image: spec.image.clone(),
                compile_command: Some(vec![
                    "cc".to_string(),
                    "-O2".to_string(),
                    "-o".to_string(),
                    "/workspace/.out".to_string(),
                    entry_path.to_string(),
                ]),
                run_command: vec!["/workspace/.out".to_string()],
            }),
            other => Err(CoreError::LanguageUnsupported(format!(
                "unrecognized entry convention '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_recipe_has_no_compile_step() {
        let spec = RuntimeSpec {
            image: "coderunner-runtime-python:latest".to_string(),
            entry_convention: "main.py".to_string(),
        };
        let recipe = ExecRecipe::for_language(&spec, "main.py").unwrap();
        assert!(recipe.compile_command.is_none());
        assert_eq!(recipe.run_command, vec!["python3", "main.py"]);
    }

    #[test]
    fn go_recipe_has_a_compile_step() {
        let spec = RuntimeSpec {
            image: "coderunner-runtime-go:latest".to_string(),
            entry_convention: "main.go".to_string(),
        };
        let recipe = ExecRecipe::for_language(&spec, "main.go").unwrap();
        assert!(recipe.compile_command.is_some());
    }

    #[test]
    fn unknown_entry_convention_is_language_unsupported() {
        let spec = RuntimeSpec {
            image: "x".to_string(),
            entry_convention: "cobol".to_string(),
        };
        assert!(matches!(
            ExecRecipe::for_language(&spec, "main.cob"),
            Err(CoreError::LanguageUnsupported(_))
        ));
    }
}

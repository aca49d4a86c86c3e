//! Orchestrator configuration (`conform.toml`).
//!
//! Relative paths are resolved against the directory holding the
//! configuration file, so a checkout can be run from anywhere.
//!
//! ```toml
//! rulebook = "rulebook.json"
//! workspace = ".conform"
//! substrates_dir = "substrates"
//!
//! [defaults]
//! timeout_secs = 120
//! on_failure = "continue"
//!
//! [[substrate]]
//! name = "python"
//! dir = "python"
//! command = ["python3", "take-test.py", "{blank_dir}", "{output_dir}"]
//!
//! [[substrate]]
//! name = "english"
//! dir = "english"
//! mode = "fuzzy"
//! artifacts = ["english.md"]
//!
//! [judge]
//! provider = "anthropic"
//! ```

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use conform_core::JudgeConfig;
use conform_state::SubstrateMode;
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conform.toml";

/// What the orchestrator does after a substrate fails to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Carry on with the remaining substrates
    #[default]
    Continue,
    /// Stop after the failed substrate
    Stop,
    /// Ask the operator
    Prompt,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::Continue),
            "stop" => Ok(FailurePolicy::Stop),
            "prompt" => Ok(FailurePolicy::Prompt),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

/// `[defaults]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    pub timeout_secs: u64,
    pub on_failure: FailurePolicy,
    /// Substrates run concurrently
    pub jobs: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            on_failure: FailurePolicy::Continue,
            jobs: 1,
        }
    }
}

fn executable() -> SubstrateMode {
    SubstrateMode::Executable
}

fn enabled() -> bool {
    true
}

/// One `[[substrate]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubstrateConfig {
    pub name: String,
    /// Working directory of the substrate process
    pub dir: PathBuf,
    /// Argv with `{blank_dir}`, `{output_dir}`, `{substrate_dir}` placeholders
    #[serde(default)]
    pub command: Vec<String>,
    /// Defaults to `<dir>/test-answers`
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "executable")]
    pub mode: SubstrateMode,
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Files making up a fuzzy substrate's artifact
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl SubstrateConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.dir.join("test-answers"))
    }

    pub fn timeout(&self, defaults: &Defaults) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(defaults.timeout_secs).max(1))
    }

    /// Command with placeholders substituted.
    pub fn render_command(&self, blank_dir: &Path, output_dir: &Path) -> Vec<String> {
        let blank = blank_dir.display().to_string();
        let output = output_dir.display().to_string();
        let substrate = self.dir.display().to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{blank_dir}", &blank)
                    .replace("{output_dir}", &output)
                    .replace("{substrate_dir}", &substrate)
            })
            .collect()
    }

    pub fn is_fuzzy(&self) -> bool {
        self.mode == SubstrateMode::Fuzzy
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".conform")
}

/// Parsed `conform.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub rulebook: PathBuf,
    /// Root for run directories, backups, locks and the ledger
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Base for relative substrate directories
    #[serde(default)]
    pub substrates_dir: Option<PathBuf>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default, rename = "substrate")]
    pub substrates: Vec<SubstrateConfig>,
    #[serde(default)]
    pub judge: Option<JudgeConfig>,
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    lexically_normal(&joined)
}

/// Drop `.` and fold `..` into its parent without touching the filesystem.
fn lexically_normal(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

impl OrchestratorConfig {
    /// Read, resolve and validate a configuration file.
    pub fn load(path: &Path) -> RunnerResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml_str(&text, &base)
    }

    /// Parse configuration text; relative paths are resolved against `base`.
    pub fn from_toml_str(text: &str, base: &Path) -> RunnerResult<Self> {
        let mut config: OrchestratorConfig =
            toml::from_str(text).map_err(|e| RunnerError::Config(e.to_string()))?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.rulebook = absolutize(base, &self.rulebook);
        self.workspace = absolutize(base, &self.workspace);
        let substrates_base = match &self.substrates_dir {
            Some(dir) => absolutize(base, dir),
            None => base.to_path_buf(),
        };
        self.substrates_dir = Some(substrates_base.clone());
        for s in &mut self.substrates {
            s.dir = absolutize(&substrates_base, &s.dir);
            if let Some(out) = &s.output_dir {
                s.output_dir = Some(absolutize(&s.dir, out));
            }
            s.artifacts = s.artifacts.iter().map(|a| absolutize(&s.dir, a)).collect();
        }
    }

    fn validate(&self) -> RunnerResult<()> {
        if self.defaults.jobs == 0 {
            return Err(RunnerError::Config("defaults.jobs must be at least 1".into()));
        }
        let mut names = BTreeSet::new();
        for s in &self.substrates {
            let valid_name = !s.name.is_empty()
                && s
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !valid_name {
                return Err(RunnerError::Config(format!(
                    "substrate name {:?} must be non-empty and use only letters, digits, '-', '_' or '.'",
                    s.name
                )));
            }
            if !names.insert(s.name.as_str()) {
                return Err(RunnerError::Config(format!(
                    "substrate {} is declared twice",
                    s.name
                )));
            }
            match s.mode {
                SubstrateMode::Executable if s.command.is_empty() => {
                    return Err(RunnerError::Config(format!(
                        "substrate {} has no command",
                        s.name
                    )))
                }
                SubstrateMode::Fuzzy if s.artifacts.is_empty() => {
                    return Err(RunnerError::Config(format!(
                        "fuzzy substrate {} lists no artifacts",
                        s.name
                    )))
                }
                _ => {}
            }
        }
        self.validate_output_dirs()
    }

    /// Each output directory is wiped at the start of a run, so it must not
    /// contain a substrate's sources, the workspace, or another substrate's
    /// output.
    fn validate_output_dirs(&self) -> RunnerResult<()> {
        for s in &self.substrates {
            let out = s.output_dir();
            if self.workspace.starts_with(&out) {
                return Err(RunnerError::Config(format!(
                    "output_dir {} of substrate {} contains the workspace",
                    out.display(),
                    s.name
                )));
            }
            for other in &self.substrates {
                if other.dir.starts_with(&out) {
                    return Err(RunnerError::Config(format!(
                        "output_dir {} of substrate {} contains the directory of substrate {}",
                        out.display(),
                        s.name,
                        other.name
                    )));
                }
                if other.name != s.name && other.output_dir().starts_with(&out) {
                    return Err(RunnerError::Config(format!(
                        "substrates {} and {} share output directory {}",
                        s.name,
                        other.name,
                        out.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.workspace.join("ledger.jsonl")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.workspace.join("backups")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.workspace.join("locks")
    }

    pub fn substrate(&self, name: &str) -> Option<&SubstrateConfig> {
        self.substrates.iter().find(|s| s.name == name)
    }

    /// Substrates to run: one by name (even if disabled), or every enabled one.
    pub fn select(&self, name: Option<&str>) -> RunnerResult<Vec<SubstrateConfig>> {
        match name {
            Some(name) => self
                .substrate(name)
                .cloned()
                .map(|s| vec![s])
                .ok_or_else(|| RunnerError::Config(format!("no substrate named {name}"))),
            None => Ok(self.substrates.iter().filter(|s| s.enabled).cloned().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
rulebook = "rulebook.json"
substrates_dir = "substrates"

[defaults]
timeout_secs = 30
on_failure = "stop"

[[substrate]]
name = "python"
dir = "python"
command = ["python3", "take-test.py", "{blank_dir}", "{output_dir}"]

[[substrate]]
name = "golang"
dir = "/opt/golang"
command = ["./take-test"]
timeout_secs = 5
enabled = false

[[substrate]]
name = "english"
dir = "english"
mode = "fuzzy"
artifacts = ["english.md"]

[judge]
provider = "ollama"
"#;

    #[test]
    fn paths_resolve_against_config_dir() {
        let cfg = OrchestratorConfig::from_toml_str(SAMPLE, Path::new("/repo")).unwrap();
        assert_eq!(cfg.rulebook, PathBuf::from("/repo/rulebook.json"));
        assert_eq!(cfg.workspace, PathBuf::from("/repo/.conform"));
        let python = cfg.substrate("python").unwrap();
        assert_eq!(python.dir, PathBuf::from("/repo/substrates/python"));
        assert_eq!(
            python.output_dir(),
            PathBuf::from("/repo/substrates/python/test-answers")
        );
        assert_eq!(cfg.substrate("golang").unwrap().dir, PathBuf::from("/opt/golang"));
        assert_eq!(
            cfg.substrate("english").unwrap().artifacts,
            vec![PathBuf::from("/repo/substrates/english/english.md")]
        );
    }

    #[test]
    fn defaults_and_overrides() {
        let cfg = OrchestratorConfig::from_toml_str(SAMPLE, Path::new("/repo")).unwrap();
        assert_eq!(cfg.defaults.on_failure, FailurePolicy::Stop);
        assert_eq!(cfg.defaults.jobs, 1);
        let python = cfg.substrate("python").unwrap();
        assert_eq!(python.timeout(&cfg.defaults), Duration::from_secs(30));
        let golang = cfg.substrate("golang").unwrap();
        assert_eq!(golang.timeout(&cfg.defaults), Duration::from_secs(5));
        assert_eq!(cfg.judge.as_ref().unwrap().model_name(), "llama3.2");
    }

    #[test]
    fn select_skips_disabled_unless_named() {
        let cfg = OrchestratorConfig::from_toml_str(SAMPLE, Path::new("/repo")).unwrap();
        let all: Vec<_> = cfg.select(None).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(all, vec!["python", "english"]);
        assert_eq!(cfg.select(Some("golang")).unwrap()[0].name, "golang");
        assert!(cfg.select(Some("cobol")).is_err());
    }

    #[test]
    fn placeholders_are_substituted() {
        let cfg = OrchestratorConfig::from_toml_str(SAMPLE, Path::new("/repo")).unwrap();
        let argv = cfg
            .substrate("python")
            .unwrap()
            .render_command(Path::new("/run/blank"), Path::new("/out"));
        assert_eq!(argv, vec!["python3", "take-test.py", "/run/blank", "/out"]);
    }

    #[test]
    fn rejects_bad_configurations() {
        let missing_command = r#"
rulebook = "r.json"
[[substrate]]
name = "python"
dir = "python"
"#;
        let dup = r#"
rulebook = "r.json"
[[substrate]]
name = "a"
dir = "a"
command = ["true"]
[[substrate]]
name = "a"
dir = "b"
command = ["true"]
"#;
        let unknown_key = r#"
rulebook = "r.json"
colour = "blue"
"#;
        for text in [missing_command, dup, unknown_key] {
            let err = OrchestratorConfig::from_toml_str(text, Path::new("/")).unwrap_err();
            assert!(err.is_configuration(), "{err}");
        }
    }

    fn with_substrates(body: &str) -> RunnerResult<OrchestratorConfig> {
        let text = format!("rulebook = \"r.json\"\nsubstrates_dir = \"subs\"\n{body}");
        OrchestratorConfig::from_toml_str(&text, Path::new("/repo"))
    }

    #[test]
    fn output_dir_may_not_contain_the_substrate_sources() {
        for output_dir in [".", "..", "../..", "/repo", "nested/../."] {
            let body = format!(
                "[[substrate]]\nname = \"python\"\ndir = \"python\"\ncommand = [\"true\"]\noutput_dir = \"{output_dir}\"\n"
            );
            let err = with_substrates(&body).unwrap_err();
            assert!(err.is_configuration(), "{output_dir}: {err}");
        }
    }

    #[test]
    fn output_dir_may_not_be_shared_or_nested() {
        let shared = r#"
[[substrate]]
name = "a"
dir = "a"
command = ["true"]
output_dir = "/out/answers"
[[substrate]]
name = "b"
dir = "b"
command = ["true"]
output_dir = "../a/../../../out/answers"
"#;
        let nested = r#"
[[substrate]]
name = "a"
dir = "a"
command = ["true"]
output_dir = "/out"
[[substrate]]
name = "b"
dir = "b"
command = ["true"]
output_dir = "/out/b"
"#;
        let holds_workspace = r#"
[[substrate]]
name = "a"
dir = "a"
command = ["true"]
output_dir = "/repo/.conform/.."
"#;
        for body in [shared, nested, holds_workspace] {
            let err = with_substrates(body).unwrap_err();
            assert!(err.is_configuration(), "{err}");
        }
    }

    #[test]
    fn separate_output_dirs_are_accepted() {
        let body = r#"
[[substrate]]
name = "a"
dir = "a"
command = ["true"]
[[substrate]]
name = "b"
dir = "b"
command = ["true"]
output_dir = "/out/b"
"#;
        let cfg = with_substrates(body).unwrap();
        assert_eq!(
            cfg.substrate("a").unwrap().output_dir(),
            PathBuf::from("/repo/subs/a/test-answers")
        );
        assert_eq!(cfg.substrate("b").unwrap().output_dir(), PathBuf::from("/out/b"));
    }

    #[test]
    fn failure_policy_parses() {
        assert_eq!("Prompt".parse::<FailurePolicy>().unwrap(), FailurePolicy::Prompt);
        assert!("later".parse::<FailurePolicy>().is_err());
    }
}

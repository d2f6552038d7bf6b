//! Catalog configuration with YAML loading and validation

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The declarative catalog: stacks contain groups, groups contain processes.
///
/// Immutable after load. Names are globally unique across all three kinds so
/// a bare name on the command line resolves unambiguously.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub stacks: BTreeMap<String, Stack>,

    #[serde(default)]
    pub groups: BTreeMap<String, Group>,

    #[serde(default)]
    pub processes: BTreeMap<String, Process>,
}

/// A named collection of groups for one-shot startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stack {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub groups: Vec<String>,
}

/// A logical grouping of related processes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub processes: Vec<String>,
}

/// One managed process definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub command: String,

    /// Working directory, after `~` and `$VAR` expansion.
    #[serde(default)]
    pub working_dir: String,

    /// Environment overrides merged on top of the parent environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Exponential-backoff retry policy for a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// 0 means unbounded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "duration_str")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "duration_str")]
    pub max_backoff: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Serde adapter for human duration strings like `"2s"`, `"500ms"`, `"1m"`.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ser.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(de)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a duration string like `"500ms"`, `"2s"`, `"1m"`, `"1h"`.
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("empty duration string"));
    }

    let split = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(split);

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow!("invalid duration {:?}", s))?;

    let secs = match suffix.trim() {
        "ms" => num / 1000.0,
        "" | "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        other => return Err(anyhow!("invalid duration {:?}: unknown unit {:?}", s, other)),
    };

    Ok(Duration::from_secs_f64(secs))
}

/// Render a duration back into the shortest matching string form.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Default config file location: `~/.config/shepherd/config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shepherd")
        .join("config.yaml")
}

impl Config {
    /// Read and parse a YAML catalog, then expand `~` and `$VAR` in working
    /// directories and environment values.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;

        cfg.expand_paths();
        Ok(cfg)
    }

    /// Check the catalog for referential integrity and invalid values.
    /// Collects every validation error rather than stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        // Names must be unique across stacks, groups, and processes.
        let mut all_names: HashMap<&str, &str> = HashMap::new();
        for name in self.stacks.keys() {
            all_names.insert(name, "stack");
        }
        for name in self.groups.keys() {
            if let Some(existing) = all_names.get(name.as_str()) {
                errs.push(format!(
                    "name {:?} is used as both a {} and a group",
                    name, existing
                ));
            }
            all_names.insert(name, "group");
        }
        for name in self.processes.keys() {
            if let Some(existing) = all_names.get(name.as_str()) {
                errs.push(format!(
                    "name {:?} is used as both a {} and a process",
                    name, existing
                ));
            }
            all_names.insert(name, "process");
        }

        for (stack_name, stack) in &self.stacks {
            for group_name in &stack.groups {
                if !self.groups.contains_key(group_name) {
                    errs.push(format!(
                        "stack {:?} references undefined group {:?}",
                        stack_name, group_name
                    ));
                }
            }
        }

        for (group_name, group) in &self.groups {
            for proc_name in &group.processes {
                if !self.processes.contains_key(proc_name) {
                    errs.push(format!(
                        "group {:?} references undefined process {:?}",
                        group_name, proc_name
                    ));
                }
            }
        }

        for (proc_name, proc) in &self.processes {
            for dep in &proc.depends_on {
                if !self.processes.contains_key(dep) {
                    errs.push(format!(
                        "process {:?} depends on undefined process {:?}",
                        proc_name, dep
                    ));
                }
                if dep == proc_name {
                    errs.push(format!("process {:?} depends on itself", proc_name));
                }
            }

            if proc.retry.enabled {
                if proc.retry.initial_backoff.is_zero() {
                    errs.push(format!(
                        "process {:?}: initial_backoff must be positive",
                        proc_name
                    ));
                }
                if proc.retry.max_backoff.is_zero() {
                    errs.push(format!(
                        "process {:?}: max_backoff must be positive",
                        proc_name
                    ));
                }
                if proc.retry.initial_backoff > proc.retry.max_backoff {
                    errs.push(format!(
                        "process {:?}: initial_backoff ({}) must be <= max_backoff ({})",
                        proc_name,
                        format_duration(proc.retry.initial_backoff),
                        format_duration(proc.retry.max_backoff)
                    ));
                }
                if proc.retry.backoff_multiplier < 1.0 {
                    errs.push(format!(
                        "process {:?}: backoff_multiplier must be >= 1",
                        proc_name
                    ));
                }
            }

            if proc.command.is_empty() {
                errs.push(format!("process {:?}: command is required", proc_name));
            }
        }

        if let Err(e) = self.detect_cycles() {
            errs.push(e.to_string());
        }

        if !errs.is_empty() {
            return Err(anyhow!(
                "config validation errors:\n  - {}",
                errs.join("\n  - ")
            ));
        }
        Ok(())
    }

    /// Kahn's algorithm over the dependency edges. If any nodes are left with
    /// residual in-degree, they are the cycle witness.
    fn detect_cycles(&self) -> Result<()> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for name in self.processes.keys() {
            in_degree.insert(name, 0);
        }
        for (name, proc) in &self.processes {
            for dep in &proc.depends_on {
                if self.processes.contains_key(dep) {
                    *in_degree.entry(name).or_default() += 1;
                    dependents.entry(dep).or_default().push(name);
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for dep in dependents.get(node).cloned().unwrap_or_default() {
                let deg = in_degree.entry(dep).or_default();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if visited != self.processes.len() {
            let cycle_nodes: Vec<&str> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(anyhow!(
                "dependency cycle detected involving: {}",
                cycle_nodes.join(", ")
            ));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let home = dirs::home_dir().unwrap_or_default();
        for proc in self.processes.values_mut() {
            proc.working_dir = expand_env(&expand_tilde(&proc.working_dir, &home));
            for value in proc.env.values_mut() {
                *value = expand_env(&expand_tilde(value, &home));
            }
        }
    }
}

/// Commented example catalog written on first run.
pub fn example_config() -> &'static str {
    r#"# Shepherd configuration
# Processes are started in dependency order and restarted per their
# retry policy. Stack, group, and process names must be unique.
version: 1

# Stacks: named collections of groups for quick startup
# Usage: shepherd <stack-name>
stacks:
  dev:
    description: "Full development environment"
    groups: [tunnels, database]

# Groups: logical groupings of related processes
groups:
  tunnels:
    description: "SSH tunnels and bastion connections"
    processes: [bastion]
  database:
    description: "Database connections"
    processes: [db-tunnel]

# Process definitions
processes:
  bastion:
    description: "Main bastion SSH connection"
    command: "ssh -N -o ServerAliveInterval=60 -L 2222:internal-jump:22 bastion.example.com"
    retry:
      enabled: true
      max_attempts: 5
      initial_backoff: 2s
      max_backoff: 60s
      backoff_multiplier: 2

  db-tunnel:
    description: "Database tunnel through bastion"
    command: "ssh -N -L 5432:db.internal:5432 -p 2222 localhost"
    depends_on: [bastion]
    retry:
      enabled: true
      max_attempts: 3
      initial_backoff: 5s
      max_backoff: 30s
      backoff_multiplier: 2
"#
}

fn expand_tilde(path: &str, home: &Path) -> String {
    if path == "~" {
        return home.to_string_lossy().into_owned();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(yaml: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn load_valid_config() {
        let (_dir, path) = write_config(
            r#"
version: 1
stacks:
  full:
    description: "Everything"
    groups: [tunnels]
groups:
  tunnels:
    processes: [bastion, staging-forward]
processes:
  bastion:
    description: "Main bastion SSH connection"
    command: "sleep 3600"
    retry:
      enabled: true
      max_attempts: 5
      initial_backoff: 2s
      max_backoff: 60s
      backoff_multiplier: 2
  staging-forward:
    command: "sleep 3600"
    depends_on: [bastion]
"#,
        );

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.stacks.len(), 1);
        assert_eq!(cfg.groups.len(), 1);
        assert_eq!(cfg.processes.len(), 2);

        let bastion = &cfg.processes["bastion"];
        assert_eq!(bastion.description, "Main bastion SSH connection");
        assert!(bastion.retry.enabled);
        assert_eq!(bastion.retry.max_attempts, 5);
        assert_eq!(bastion.retry.initial_backoff, Duration::from_secs(2));
        assert_eq!(bastion.retry.max_backoff, Duration::from_secs(60));
        assert_eq!(bastion.retry.backoff_multiplier, 2.0);

        let forward = &cfg.processes["staging-forward"];
        assert_eq!(forward.depends_on, vec!["bastion"]);

        cfg.validate().unwrap();
    }

    #[test]
    fn load_file_not_found() {
        let err = Config::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config"));
    }

    #[test]
    fn load_invalid_yaml() {
        let (_dir, path) = write_config("{{not yaml");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("parsing config"));
    }

    #[test]
    fn retry_defaults_applied() {
        let (_dir, path) = write_config(
            r#"
processes:
  a:
    command: "echo a"
"#,
        );

        let cfg = Config::load(&path).unwrap();
        let retry = &cfg.processes["a"].retry;
        assert!(!retry.enabled);
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_backoff, Duration::from_secs(2));
        assert_eq!(retry.max_backoff, Duration::from_secs(60));
        assert_eq!(retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn validate_missing_process_in_group() {
        let mut cfg = Config::default();
        cfg.groups.insert(
            "g1".into(),
            Group {
                processes: vec!["nonexistent".into()],
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains(r#"group "g1" references undefined process "nonexistent""#));
    }

    #[test]
    fn validate_missing_group_in_stack() {
        let mut cfg = Config::default();
        cfg.stacks.insert(
            "s1".into(),
            Stack {
                groups: vec!["nonexistent".into()],
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains(r#"stack "s1" references undefined group "nonexistent""#));
    }

    #[test]
    fn validate_duplicate_names() {
        let mut cfg = Config::default();
        cfg.stacks.insert("shared".into(), Stack::default());
        cfg.processes.insert(
            "shared".into(),
            Process {
                command: "echo hi".into(),
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains(r#""shared""#));
    }

    #[test]
    fn validate_self_dependency() {
        let mut cfg = Config::default();
        cfg.processes.insert(
            "a".into(),
            Process {
                command: "echo a".into(),
                depends_on: vec!["a".into()],
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains(r#"process "a" depends on itself"#));
    }

    #[test]
    fn validate_undefined_dependency() {
        let mut cfg = Config::default();
        cfg.processes.insert(
            "a".into(),
            Process {
                command: "echo a".into(),
                depends_on: vec!["nonexistent".into()],
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains(r#"depends on undefined process "nonexistent""#));
    }

    #[test]
    fn validate_cyclic_dependency() {
        let mut cfg = Config::default();
        for (name, dep) in [("a", "c"), ("b", "a"), ("c", "b")] {
            cfg.processes.insert(
                name.into(),
                Process {
                    command: format!("echo {}", name),
                    depends_on: vec![dep.into()],
                    ..Default::default()
                },
            );
        }

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dependency cycle detected"));
    }

    #[test]
    fn validate_missing_command() {
        let mut cfg = Config::default();
        cfg.processes.insert(
            "a".into(),
            Process {
                description: "no command".into(),
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("command is required"));
    }

    #[test]
    fn validate_invalid_backoff() {
        let mut cfg = Config::default();
        cfg.processes.insert(
            "a".into(),
            Process {
                command: "echo a".into(),
                retry: RetryConfig {
                    enabled: true,
                    max_attempts: 3,
                    initial_backoff: Duration::from_secs(30),
                    max_backoff: Duration::from_secs(5),
                    backoff_multiplier: 2.0,
                },
                ..Default::default()
            },
        );

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("initial_backoff"));
        assert!(err.contains("max_backoff"));
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn parse_duration_invalid() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn format_duration_round_trips() {
        for d in [
            Duration::from_millis(500),
            Duration::from_secs(2),
            Duration::from_secs(90),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn expand_tilde_forms() {
        let home = Path::new("/home/testuser");
        assert_eq!(expand_tilde("~", home), "/home/testuser");
        assert_eq!(expand_tilde("~/projects", home), "/home/testuser/projects");
        assert_eq!(expand_tilde("/absolute/path", home), "/absolute/path");
        assert_eq!(expand_tilde("relative/path", home), "relative/path");
    }

    #[test]
    fn expand_env_vars() {
        std::env::set_var("SHEPHERD_TEST_EXPAND", "value");
        assert_eq!(expand_env("$SHEPHERD_TEST_EXPAND"), "value");
        assert_eq!(expand_env("${SHEPHERD_TEST_EXPAND}/sub"), "value/sub");
        assert_eq!(expand_env("plain"), "plain");
        assert_eq!(expand_env("a$"), "a$");
        assert_eq!(expand_env("$SHEPHERD_TEST_UNSET_VAR"), "");
    }

    #[test]
    fn default_path_under_config_dir() {
        let path = default_config_path();
        let s = path.to_string_lossy();
        assert!(s.contains("shepherd"));
        assert!(s.ends_with("config.yaml"));
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config = serde_yaml::from_str(example_config()).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.processes.contains_key("bastion"));
        assert!(cfg.processes["db-tunnel"].retry.enabled);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut cfg = Config::default();
        cfg.version = 1;
        cfg.processes.insert(
            "echo".into(),
            Process {
                command: "echo hello".into(),
                ..Default::default()
            },
        );
        std::fs::write(&path, serde_yaml::to_string(&cfg).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.processes["echo"].command, "echo hello");
    }
}

//! Placeholder templates for output names and tool command lines.
//!
//! Placeholders are `{name}` or `{name:0N}` (zero-padded to N digits).
//! Anything else in braces is left as written.

use crate::executor::{CommandRenderer, Invocation};
use crate::models::{expand_env_vars, ConfigError, Result, StageConfig, WorkItem};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Placeholders usable in `output_pattern`.
pub const OUTPUT_PLACEHOLDERS: &[&str] = &["prefix", "ts", "idx", "angle", "stem", "key"];

/// Placeholders usable in `command` and `stdin`.
pub const COMMAND_PLACEHOLDERS: &[&str] = &[
    "input",
    "inputs",
    "output",
    "output_dir",
    "device",
    "ts",
    "idx",
    "angle",
    "key",
    "prefix",
];

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(u32),
    Angle(f64),
    /// Expands to one argument per element when it is a whole argument
    List(Vec<String>),
}

impl Value {
    fn format(&self, width: Option<usize>) -> std::result::Result<String, String> {
        match (self, width) {
            (Self::Number(n), Some(width)) => Ok(format!("{n:0width$}")),
            (_, Some(_)) => Err("zero padding only applies to numbers".into()),
            (Self::Text(s), None) => Ok(s.clone()),
            (Self::Number(n), None) => Ok(n.to_string()),
            (Self::Angle(a), None) => Ok(a.to_string()),
            (Self::List(items), None) => Ok(items.join(",")),
        }
    }
}

/// Placeholder bindings for one render.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: BTreeMap<&'static str, Value>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: Value) -> Self {
        self.values.insert(name, value);
        self
    }

    pub fn text(self, name: &'static str, value: impl Into<String>) -> Self {
        self.set(name, Value::Text(value.into()))
    }

    pub fn path(self, name: &'static str, value: &Path) -> Self {
        self.text(name, value.display().to_string())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

fn placeholder_re() -> std::result::Result<Regex, ConfigError> {
    Regex::new(r"\{([a-z_]+)(?::0(\d+))?\}")
        .map_err(|e| ConfigError::Template(format!("invalid placeholder pattern: {e}")))
}

/// Names of the placeholders in `template`, in order of appearance.
pub fn placeholders(template: &str) -> std::result::Result<Vec<String>, ConfigError> {
    let re = placeholder_re()?;
    Ok(re
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect())
}

/// Reject placeholders outside `allowed`.
pub fn check_placeholders(
    template: &str,
    allowed: &[&str],
) -> std::result::Result<(), ConfigError> {
    for name in placeholders(template)? {
        if !allowed.contains(&name.as_str()) {
            return Err(ConfigError::Template(format!(
                "unknown placeholder {{{name}}} in '{template}'"
            )));
        }
    }
    Ok(())
}

/// Substitute every placeholder in `template`.
pub fn render(template: &str, vars: &Vars) -> std::result::Result<String, ConfigError> {
    let re = placeholder_re()?;
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let width = match caps.get(2) {
            Some(w) => Some(w.as_str().parse::<usize>().map_err(|e| {
                ConfigError::Template(format!("bad width in '{}': {e}", whole.as_str()))
            })?),
            None => None,
        };
        let value = vars.get(name.as_str()).ok_or_else(|| {
            ConfigError::Template(format!(
                "placeholder {} has no value here (in '{template}')",
                whole.as_str()
            ))
        })?;
        let text = value
            .format(width)
            .map_err(|e| ConfigError::Template(format!("{}: {e}", whole.as_str())))?;

        out.push_str(&template[last..whole.start()]);
        out.push_str(&text);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Render an argv template; a whole-argument list placeholder expands in place.
pub fn render_argv(argv: &[String], vars: &Vars) -> std::result::Result<Vec<String>, ConfigError> {
    let re = placeholder_re()?;
    let mut out = Vec::with_capacity(argv.len());
    for arg in argv {
        let whole_list = re
            .captures(arg)
            .filter(|caps| caps.get(0).is_some_and(|m| m.as_str() == arg.as_str()))
            .and_then(|caps| match vars.get(&caps[1]) {
                Some(Value::List(items)) if caps.get(2).is_none() => Some(items.clone()),
                _ => None,
            });
        match whole_list {
            Some(items) => out.extend(items),
            None => out.push(render(arg, vars)?),
        }
    }
    Ok(out)
}

/// Tool command of one stage, rendered per work item.
#[derive(Debug, Clone)]
pub struct StageCommand {
    argv: Vec<String>,
    stdin: Vec<String>,
    output_dir: PathBuf,
    prefix: String,
    device: Option<String>,
}

impl StageCommand {
    /// Build the command for a stage run.
    ///
    /// `{device}` requires a leased device.
    pub fn new(
        name: &str,
        stage: &StageConfig,
        prefix: &str,
        device: Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let argv: Vec<String> = stage.command.iter().map(|a| expand_env_vars(a)).collect();
        for template in argv.iter().chain(&stage.stdin) {
            check_placeholders(template, COMMAND_PLACEHOLDERS).map_err(|e| {
                ConfigError::InvalidStage {
                    stage: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
        }

        if device.is_none() && uses_device(&argv, &stage.stdin)? {
            return Err(ConfigError::InvalidStage {
                stage: name.to_string(),
                reason: "command uses {device} but no device was leased".into(),
            });
        }

        Ok(Self {
            argv,
            stdin: stage.stdin.clone(),
            output_dir: stage.output_dir.clone(),
            prefix: prefix.to_string(),
            device,
        })
    }

    fn vars(&self, item: &WorkItem) -> Vars {
        let inputs: Vec<String> = item
            .inputs
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        let mut vars = Vars::new()
            .text("input", inputs.first().cloned().unwrap_or_default())
            .set("inputs", Value::List(inputs))
            .path("output", &item.output)
            .path("output_dir", &self.output_dir)
            .text("prefix", self.prefix.clone())
            .text("key", item.key.to_string())
            .set("ts", Value::Number(item.key.series));
        if let Some(index) = item.key.index {
            vars = vars.set("idx", Value::Number(index));
        }
        if let Some(angle) = item.angle {
            vars = vars.set("angle", Value::Angle(angle));
        }
        if let Some(device) = &self.device {
            vars = vars.text("device", device.clone());
        }
        vars
    }
}

impl CommandRenderer for StageCommand {
    fn render(&self, item: &WorkItem) -> Result<Invocation> {
        let vars = self.vars(item);
        let argv = render_argv(&self.argv, &vars)?;
        let stdin = if self.stdin.is_empty() {
            None
        } else {
            let mut text = String::new();
            for line in &self.stdin {
                text.push_str(&render(line, &vars)?);
                text.push('\n');
            }
            Some(text)
        };

        Ok(Invocation {
            key: item.key,
            argv,
            stdin,
            output: item.output.clone(),
        })
    }
}

fn uses_device(argv: &[String], stdin: &[String]) -> std::result::Result<bool, ConfigError> {
    for template in argv.iter().chain(stdin) {
        if placeholders(template)?.iter().any(|name| name == "device") {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Granularity, WorkKey, MASTER_SOURCE};

    fn stage(command: &[&str], stdin: &[&str]) -> StageConfig {
        StageConfig {
            source: MASTER_SOURCE.into(),
            granularity: Granularity::Image,
            process_list: vec![],
            output_dir: PathBuf::from("/data/mc"),
            output_pattern: "{prefix}_{ts:03}_{idx:03}.mrc".into(),
            prefix: None,
            command: command.iter().map(|s| s.to_string()).collect(),
            stdin: stdin.iter().map(|s| s.to_string()).collect(),
            fatal_on_failure: false,
            requires_device: true,
        }
    }

    fn item() -> WorkItem {
        WorkItem {
            key: WorkKey::image(3, 7),
            inputs: vec![PathBuf::from("/raw/a.tif"), PathBuf::from("/raw/b.tif")],
            output: PathBuf::from("/data/mc/demo_003_007.mrc"),
            angle: Some(-12.5),
        }
    }

    #[test]
    fn test_render_with_padding() {
        let vars = Vars::new()
            .text("prefix", "demo")
            .set("ts", Value::Number(3))
            .set("angle", Value::Angle(-12.5));
        assert_eq!(
            render("{prefix}_{ts:03}_{angle}.mrc", &vars).unwrap(),
            "demo_003_-12.5.mrc"
        );
    }

    #[test]
    fn test_missing_value_and_bad_padding() {
        let vars = Vars::new().text("prefix", "demo");
        assert!(render("{idx}", &vars).is_err());
        assert!(render("{prefix:02}", &vars).is_err());
        // Non-placeholder braces pass through.
        assert_eq!(render("{A} {prefix}", &vars).unwrap(), "{A} demo");
    }

    #[test]
    fn test_inputs_expand_as_whole_argument() {
        let command = StageCommand::new(
            "align",
            &stage(&["newstack", "{inputs}", "-list={inputs}", "{output}"], &[]),
            "demo",
            None,
        )
        .unwrap();
        let invocation = command.render(&item()).unwrap();
        assert_eq!(
            invocation.argv,
            vec![
                "newstack",
                "/raw/a.tif",
                "/raw/b.tif",
                "-list=/raw/a.tif,/raw/b.tif",
                "/data/mc/demo_003_007.mrc"
            ]
        );
        assert!(invocation.stdin.is_none());
    }

    #[test]
    fn test_stdin_lines_rendered() {
        let command = StageCommand::new(
            "ctffind",
            &stage(&["ctffind"], &["{input}", "{output}", "{key}"]),
            "demo",
            None,
        )
        .unwrap();
        let invocation = command.render(&item()).unwrap();
        assert_eq!(
            invocation.stdin.as_deref(),
            Some("/raw/a.tif\n/data/mc/demo_003_007.mrc\n003_0007\n")
        );
    }

    #[test]
    fn test_device_placeholder_needs_lease() {
        let config = stage(&["MotionCor2", "-Gpu", "{device}"], &[]);
        assert!(StageCommand::new("mc", &config, "demo", None).is_err());

        let command = StageCommand::new("mc", &config, "demo", Some("1".into())).unwrap();
        assert_eq!(command.render(&item()).unwrap().argv[2], "1");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = StageCommand::new("mc", &stage(&["tool", "{gpu}"], &[]), "demo", None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStage { .. }));
    }
}

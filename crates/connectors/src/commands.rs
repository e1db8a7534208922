//! Command lines for the external calibration and teleoperation tool
//!
//! The stdin byte contract (plain confirm, override confirm) lives with the
//! calibration state machine; this module only decides *what* to launch.

use std::path::{Path, PathBuf};

use armdock_protocol::{Robot, RobotRole};
use tracing::{debug, info, warn};

const CALIBRATE_MODULE: &str = "lerobot.scripts.lerobot_calibrate";
const TELEOPERATE_MODULE: &str = "lerobot.scripts.lerobot_teleoperate";
const TELEOPERATE_SCRIPT: &str = "lerobot-teleoperate";

/// A fully resolved process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-quoted command line, for logs and dry-run output.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(part: &str) -> String {
    let safe = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

/// Where the external tool lives and whether it is usable
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub python: PathBuf,
    /// Console script preferred for teleoperation, when installed
    pub teleop_script: Option<PathBuf>,
    /// Whether `import lerobot` succeeded at detection time
    pub available: bool,
}

impl ToolConfig {
    /// Resolve the interpreter and probe for the tool.
    ///
    /// Blocking; call once at startup.
    pub fn detect(python_override: Option<&Path>) -> Self {
        let python = python_override
            .map(Path::to_path_buf)
            .or_else(|| which::which("python3").ok())
            .or_else(|| which::which("python").ok())
            .unwrap_or_else(|| PathBuf::from("python3"));

        let available = probe_import(&python);
        let teleop_script = resolve_console_script(&python, TELEOPERATE_SCRIPT);

        info!(
            component = "commands",
            event = "tool.detected",
            python = %python.display(),
            available,
            teleop_script = ?teleop_script,
            "External tool detection complete"
        );

        Self {
            python,
            teleop_script,
            available,
        }
    }

    /// Dry-run when explicitly requested, or when unset and the tool is missing.
    pub fn dry_run(&self, requested: Option<bool>) -> bool {
        match requested {
            Some(explicit) => explicit,
            None => !self.available,
        }
    }

    fn python_str(&self) -> String {
        self.python.to_string_lossy().into_owned()
    }
}

fn probe_import(python: &Path) -> bool {
    match std::process::Command::new(python)
        .args(["-c", "import lerobot"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(
                component = "commands",
                event = "tool.probe_failed",
                python = %python.display(),
                error = %e,
                "Could not run python interpreter"
            );
            false
        }
    }
}

/// Look next to the interpreter first (virtualenv layout), then on PATH.
fn resolve_console_script(python: &Path, name: &str) -> Option<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    let sibling = std::fs::canonicalize(python)
        .ok()
        .and_then(|p| p.parent().map(|dir| dir.join(&file_name)))
        .filter(|p| p.is_file());
    if let Some(path) = sibling {
        debug!(
            component = "commands",
            event = "tool.script_sibling",
            path = %path.display(),
            "Found console script next to interpreter"
        );
        return Some(path);
    }
    which::which(name).ok()
}

/// Flag prefix the tool uses for a robot of the given role.
fn role_key(role: RobotRole) -> &'static str {
    match role {
        RobotRole::Leader => "teleop",
        RobotRole::Follower => "robot",
    }
}

fn device_flags(key: &str, robot: &Robot) -> [String; 3] {
    [
        format!("--{key}.type={}", robot.device_type()),
        format!("--{key}.port={}", robot.com_port),
        format!("--{key}.id={}", robot.name),
    ]
}

/// `<python> -u -m lerobot.scripts.lerobot_calibrate --<key>.type=.. --<key>.port=.. --<key>.id=..`
pub fn calibration_command(tool: &ToolConfig, robot: &Robot) -> CommandSpec {
    let mut spec = CommandSpec::new(tool.python_str())
        .arg("-u")
        .arg("-m")
        .arg(CALIBRATE_MODULE)
        .env("PYTHONUNBUFFERED", "1");
    spec.args.extend(device_flags(role_key(robot.role), robot));
    spec
}

/// Teleoperation with the follower as `--robot.*` and the leader as `--teleop.*`.
pub fn teleop_command(tool: &ToolConfig, leader: &Robot, follower: &Robot) -> CommandSpec {
    let mut spec = match &tool.teleop_script {
        Some(script) => CommandSpec::new(script.to_string_lossy()),
        None => CommandSpec::new(tool.python_str())
            .arg("-u")
            .arg("-m")
            .arg(TELEOPERATE_MODULE),
    }
    .env("PYTHONUNBUFFERED", "1");
    spec.args
        .extend(device_flags(role_key(RobotRole::Follower), follower));
    spec.args.extend(device_flags(role_key(RobotRole::Leader), leader));
    spec
}

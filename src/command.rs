use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use serde::Serialize;

use crate::error::SpiderError;
use crate::fs_util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandArg {
    pub position: i64,
    pub opt: String,
    pub value: String,
}

/// An executable plus positioned `option value` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub exe: String,
    pub args: Vec<CommandArg>,
}

impl CommandSpec {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, position: i64, opt: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(CommandArg {
            position,
            opt: opt.into(),
            value: value.into(),
        });
        self
    }

    /// `exe opt value opt value ...` with arguments ordered by position.
    pub fn render(&self) -> String {
        let mut ordered = self.args.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|arg| arg.position);
        let mut parts = vec![self.exe.clone()];
        for arg in ordered {
            if !arg.opt.is_empty() {
                parts.push(arg.opt.clone());
            }
            if !arg.value.is_empty() {
                parts.push(arg.value.clone());
            }
        }
        parts.join(" ")
    }

    /// Placeholder values for a MATLAB template: each option name bound to
    /// its value.
    pub fn template_values(&self) -> BTreeMap<String, String> {
        self.args
            .iter()
            .map(|arg| (arg.opt.trim_start_matches('-').to_string(), arg.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableInfo {
    pub path: PathBuf,
    pub version: String,
}

/// Locates `name`: on `PATH` when `executable` is the bare name, otherwise
/// at `executable` itself or inside it when it is a directory. The binary
/// must answer `--version`.
pub fn check_executable(executable: &str, name: &str) -> Result<ExecutableInfo, SpiderError> {
    let path = if executable == name {
        which::which(name).map_err(|_| SpiderError::MissingExecutable(name.to_string()))?
    } else {
        let mut path = fs_util::absolute(Path::new(executable))?;
        if !path.to_string_lossy().ends_with(name) && path.is_dir() {
            path = path.join(name);
        }
        if !path.exists() {
            return Err(SpiderError::MissingExecutable(path.display().to_string()));
        }
        path
    };

    let output = Command::new(&path)
        .arg("--version")
        .output()
        .map_err(|err| {
            SpiderError::Configuration(format!("failed to run {} --version: {err}", path.display()))
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let version = if stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout
    };
    Ok(ExecutableInfo { path, version })
}

/// Runs a command line through `sh -c` and waits for it.
pub fn run_system_cmd(cmd: &str, envs: &[(&str, &str)]) -> Result<ExitStatus, SpiderError> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    run(command, envs, cmd)
}

/// Makes `script` executable and runs it with the interpreter named on its
/// `#!` line, or with `sh` when it has none.
pub fn run_shell_script(script: &Path, envs: &[(&str, &str)]) -> Result<ExitStatus, SpiderError> {
    make_executable(script)?;
    let content = fs::read_to_string(script)
        .map_err(|err| SpiderError::Filesystem(format!("read {}: {err}", script.display())))?;
    let mut command = match shebang(&content) {
        Some((interpreter, arg)) => {
            let mut command = Command::new(interpreter);
            command.args(arg);
            command
        }
        None => Command::new("sh"),
    };
    command.arg(script);
    run(command, envs, &script.display().to_string())
}

/// Interpreter and optional single argument of a `#!` line.
fn shebang(content: &str) -> Option<(&str, Option<&str>)> {
    let line = content.lines().next()?.strip_prefix("#!")?.trim();
    let (interpreter, arg) = match line.split_once(char::is_whitespace) {
        Some((interpreter, arg)) => (interpreter, Some(arg.trim()).filter(|arg| !arg.is_empty())),
        None => (line, None),
    };
    (!interpreter.is_empty()).then_some((interpreter, arg))
}

pub fn run_python_script(script: &Path, envs: &[(&str, &str)]) -> Result<ExitStatus, SpiderError> {
    let python = which::which("python")
        .or_else(|_| which::which("python3"))
        .map_err(|_| SpiderError::MissingTool("python".to_string()))?;
    let mut command = Command::new(python);
    command.arg(script);
    run(command, envs, &script.display().to_string())
}

/// Feeds `script` to a single-threaded, desktop-less MATLAB.
pub fn run_matlab(script: &Path, envs: &[(&str, &str)]) -> Result<ExitStatus, SpiderError> {
    let matlab = which::which("matlab").map_err(|_| SpiderError::MissingTool("matlab".to_string()))?;
    let input = fs::File::open(script)
        .map_err(|err| SpiderError::Filesystem(format!("open {}: {err}", script.display())))?;
    let mut command = Command::new(matlab);
    command
        .args(["-singleCompThread", "-nodesktop", "-nosplash"])
        .stdin(Stdio::from(input));
    run(command, envs, &script.display().to_string())
}

fn run(mut command: Command, envs: &[(&str, &str)], label: &str) -> Result<ExitStatus, SpiderError> {
    command.envs(envs.iter().copied());
    tracing::debug!(command = label, "running");
    let status = command
        .status()
        .map_err(|err| SpiderError::Command(format!("{label}: {err}")))?;
    if !status.success() {
        tracing::warn!(command = label, %status, "command exited unsuccessfully");
    }
    Ok(status)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SpiderError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .map_err(|err| SpiderError::Filesystem(err.to_string()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o100);
    fs::set_permissions(path, permissions).map_err(|err| SpiderError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SpiderError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn render_orders_by_position() {
        let spec = CommandSpec::new("/opt/fsl/bin/bet")
            .arg(2, "-f", "0.5")
            .arg(0, "", "in.nii")
            .arg(1, "", "out.nii");
        assert_eq!(spec.render(), "/opt/fsl/bin/bet in.nii out.nii -f 0.5");
    }

    #[test]
    fn template_values_strip_dashes() {
        let spec = CommandSpec::new("matlab").arg(0, "--input", "a.nii").arg(1, "out", "b");
        let values = spec.template_values();
        assert_eq!(values["input"], "a.nii");
        assert_eq!(values["out"], "b");
    }

    #[test]
    fn missing_executable_path() {
        let temp = tempfile::tempdir().unwrap();
        let err = check_executable(temp.path().to_str().unwrap(), "not-a-real-tool").unwrap_err();
        assert_matches!(err, SpiderError::MissingExecutable(_));
        assert!(err.is_configuration());
    }

    #[cfg(unix)]
    #[test]
    fn executable_in_directory_reports_version() {
        let temp = tempfile::tempdir().unwrap();
        let tool = temp.path().join("mytool");
        fs::write(&tool, "#!/bin/sh\necho mytool 4.2.0\n").unwrap();
        make_executable(&tool).unwrap();

        let info = check_executable(temp.path().to_str().unwrap(), "mytool").unwrap();
        assert_eq!(info.path, tool);
        assert_eq!(info.version, "mytool 4.2.0");
    }

    #[test]
    fn shebang_line_parsing() {
        assert_eq!(shebang("#!/bin/bash\necho"), Some(("/bin/bash", None)));
        assert_eq!(
            shebang("#! /usr/bin/env  python3 \nprint(1)"),
            Some(("/usr/bin/env", Some("python3")))
        );
        assert_eq!(shebang("echo hi\n"), None);
        assert_eq!(shebang("#!\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn shell_script_without_shebang_runs_under_sh() {
        let temp = tempfile::tempdir().unwrap();
        let script = temp.path().join("script.sh");
        let out = temp.path().join("out.txt");
        fs::write(&script, format!("echo $XNAT_USER > {}\n", out.display())).unwrap();

        let status = run_shell_script(&script, &[("XNAT_USER", "admin")]).unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(out).unwrap(), "admin\n");
    }

    #[cfg(unix)]
    #[test]
    fn system_command_passes_environment() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("host.txt");
        let cmd = format!("echo $XNAT_HOST > {}", out.display());
        let status = run_system_cmd(&cmd, &[("XNAT_HOST", "https://xnat.test")]).unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(out).unwrap().trim(), "https://xnat.test");
    }
}

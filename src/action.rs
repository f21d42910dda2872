// External action invocation: `action_cmd ACTION src dst [hint]`, run via
// `std::process::Command` with argv passed directly -- never through a
// shell, so path components containing shell metacharacters can't be used
// for injection (spec.md §4.3 "archive/restore run an external command").

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Command;

use log::{debug, warn};

use crate::error::{PolicyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerb {
    Archive,
    Restore,
    Remove,
}

impl ActionVerb {
    fn as_arg(&self) -> &'static str {
        match self {
            ActionVerb::Archive => "archive",
            ActionVerb::Restore => "restore",
            ActionVerb::Remove => "remove",
        }
    }
}

/// How the external action command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    /// Non-zero exit; command ran but refused/failed the operation.
    Failed(i32),
    /// Shell convention for "command not found" (127) or "found but not
    /// executable" (126) -- the action script itself is broken, not the
    /// individual entry.
    CommandNotExecutable(i32),
    /// 128+n convention some shells use to report a command killed by
    /// signal n, reported to us as a plain exit code rather than through
    /// `WIFSIGNALED`.
    ExitedFromSignal(i32),
    /// Killed by a signal (no exit code available).
    Signaled(i32),
}

/// Runs `action_cmd verb src dst [hint]` and classifies the result.
/// Returns `Err` only if the command itself could not be spawned (missing
/// binary, permission denied on the executable) -- a non-zero exit or a
/// signal is reported as `Ok(ActionOutcome::Failed/Signaled)` since that is
/// an expected, per-entry outcome rather than a process-level error.
pub fn run_action(
    action_cmd: &str,
    verb: ActionVerb,
    src: &Path,
    dst: &Path,
    hint: Option<&str>,
) -> Result<ActionOutcome> {
    let mut cmd = Command::new(action_cmd);
    cmd.arg(verb.as_arg()).arg(src).arg(dst);
    if let Some(hint) = hint {
        cmd.arg(hint);
    }

    debug!("running action: {} {} {} {}", action_cmd, verb.as_arg(), src.display(), dst.display());

    let status = cmd.status().map_err(|e| {
        PolicyError::IoFatal(format!("spawning action command '{}': {}", action_cmd, e))
    })?;

    if let Some(code) = status.code() {
        let outcome = classify_exit_code(code);
        if outcome != ActionOutcome::Success {
            warn!("action command '{}' exited {:?}", action_cmd, outcome);
        }
        Ok(outcome)
    } else if let Some(signal) = status.signal() {
        warn!("action command killed by signal {}", signal);
        Ok(ActionOutcome::Signaled(signal))
    } else {
        Ok(ActionOutcome::Failed(-1))
    }
}

/// Exit-code classification shared between the real spawn path and tests.
/// 126/127 are the shell's "found but not executable" / "not found"
/// convention; 129-191 is the `128+signal` convention some wrapper scripts
/// use to report a signal without `WIFSIGNALED` being set.
fn classify_exit_code(code: i32) -> ActionOutcome {
    if code == 0 {
        ActionOutcome::Success
    } else if code == 126 || code == 127 {
        ActionOutcome::CommandNotExecutable(code)
    } else if code > 128 && code < 192 {
        ActionOutcome::ExitedFromSignal(code - 128)
    } else {
        ActionOutcome::Failed(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn success_exit_is_classified_success() {
        let outcome = run_action("/bin/true", ActionVerb::Archive, Path::new("a"), Path::new("b"), None).unwrap();
        assert_eq!(outcome, ActionOutcome::Success);
    }

    #[test]
    fn nonzero_exit_is_classified_failed() {
        let outcome = run_action("/bin/false", ActionVerb::Restore, Path::new("a"), Path::new("b"), None).unwrap();
        assert_eq!(outcome, ActionOutcome::Failed(1));
    }

    #[test]
    fn exit_codes_126_and_127_are_not_executable() {
        assert_eq!(classify_exit_code(126), ActionOutcome::CommandNotExecutable(126));
        assert_eq!(classify_exit_code(127), ActionOutcome::CommandNotExecutable(127));
    }

    #[test]
    fn exit_code_in_128_range_is_signal_convention() {
        assert_eq!(classify_exit_code(130), ActionOutcome::ExitedFromSignal(2));
    }

    #[test]
    fn exit_code_128_itself_is_a_plain_failure() {
        // 128 alone (not 128+signal) isn't in the shell's signal-convention
        // range; treat it as an ordinary failed exit.
        assert_eq!(classify_exit_code(128), ActionOutcome::Failed(128));
    }

    #[test]
    fn missing_binary_is_an_error_not_a_failed_outcome() {
        let result = run_action("/nonexistent/action-binary", ActionVerb::Remove, Path::new("a"), Path::new("b"), None);
        assert!(result.is_err());
    }

    #[test]
    fn path_arguments_are_never_shell_interpreted() {
        // "; rm -rf /" must be passed verbatim as a single argv entry, not
        // parsed by a shell -- /bin/echo will just print it.
        let dangerous = PathBuf::from("; rm -rf /tmp/should-not-run");
        let outcome = run_action("/bin/echo", ActionVerb::Archive, &dangerous, Path::new("b"), None).unwrap();
        assert_eq!(outcome, ActionOutcome::Success);
    }
}

//! OS-level reboot

use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use log::{error, warn};
use sensorbox_core::Rebooter;

/// Reboots the device by spawning a configured program
///
/// A detached thread reaps the child and logs a failed exit; the process
/// expects to be killed by the restart before that matters.
#[derive(Debug, Clone)]
pub struct CommandReboot {
    argv: Vec<String>,
}

impl CommandReboot {
    /// Reboot with `argv`; the first element is the program
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Configured command line
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Spawn the command and a thread that waits for it
    fn spawn(&self) -> Option<JoinHandle<Option<ExitStatus>>> {
        let Some((program, args)) = self.argv.split_first() else {
            error!("[REBOOT] no reboot command configured, staying up");
            return None;
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                error!("[REBOOT] failed to run '{}': {}", self.argv.join(" "), err);
                return None;
            }
        };

        let command = self.argv.join(" ");
        Some(thread::spawn(move || match child.wait() {
            Ok(status) => {
                if !status.success() {
                    error!("[REBOOT] '{}' exited with {}", command, status);
                }
                Some(status)
            }
            Err(err) => {
                error!("[REBOOT] waiting on '{}' failed: {}", command, err);
                None
            }
        }))
    }
}

impl Rebooter for CommandReboot {
    fn reboot(&self, reason: &str) {
        warn!("[REBOOT] {}", reason);

        // Detached; the reaper thread outlives this call
        drop(self.spawn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_a_logged_no_op() {
        CommandReboot::new(Vec::new()).reboot("test");
    }

    #[test]
    fn missing_program_does_not_panic() {
        CommandReboot::new(vec!["/nonexistent/sensorbox-reboot".into()]).reboot("test");
    }

    #[test]
    fn harmless_program_is_spawned() {
        let reboot = CommandReboot::new(vec!["true".into()]);
        assert_eq!(reboot.argv(), ["true".to_string()]);
        reboot.reboot("test");
    }

    #[test]
    fn child_is_reaped_and_failure_reported() {
        let reaper = CommandReboot::new(vec!["false".into()]).spawn().unwrap();
        let status = reaper.join().unwrap().unwrap();
        assert!(!status.success());

        let reaper = CommandReboot::new(vec!["true".into()]).spawn().unwrap();
        assert!(reaper.join().unwrap().unwrap().success());
    }

    #[test]
    fn unspawnable_commands_have_no_reaper() {
        assert!(CommandReboot::new(Vec::new()).spawn().is_none());
        assert!(CommandReboot::new(vec!["/nonexistent/sensorbox-reboot".into()]).spawn().is_none());
    }
}

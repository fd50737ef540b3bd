//! Two-state alert sound output.
//!
//! Devices are driven only on alert transitions; `start` and `stop` must be
//! idempotent so a repeated call never restarts or double-stops playback.

use anyhow::{anyhow, Context, Result};
use std::process::{Child, Command, Stdio};

pub trait AlertDevice: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn is_active(&self) -> bool;
}

/// Writes transitions to the log. Used when no player is configured.
#[derive(Debug, Default)]
pub struct LogAlarm {
    active: bool,
}

impl LogAlarm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlertDevice for LogAlarm {
    fn start(&mut self) -> Result<()> {
        if !self.active {
            log::warn!("ALERT: object within proximity threshold");
            self.active = true;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.active {
            log::info!("alert sound stopped");
            self.active = false;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Plays the alert by spawning an external player, e.g. `aplay alert.wav`.
///
/// `stop` kills the player. If the player exits on its own while the alert is
/// still active the sound simply ends; it is not respawned until the next
/// start transition.
pub struct CommandAlarm {
    argv: Vec<String>,
    child: Option<Child>,
}

impl CommandAlarm {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(anyhow!("alarm command must name a program"));
        }
        Ok(Self { argv, child: None })
    }
}

impl AlertDevice for CommandAlarm {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn alarm player {}", self.argv[0]))?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.kill().context("failed to stop alarm player")?;
        }
        child.wait()?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for CommandAlarm {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("alarm player cleanup failed: {:#}", e);
        }
    }
}

/// Command player when configured, log-only alarm otherwise.
pub fn open_alarm(command: Option<&[String]>) -> Result<Box<dyn AlertDevice>> {
    match command {
        Some(argv) if !argv.is_empty() => Ok(Box::new(CommandAlarm::new(argv.to_vec())?)),
        _ => Ok(Box::new(LogAlarm::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_alarm_is_idempotent() -> Result<()> {
        let mut alarm = LogAlarm::new();
        alarm.start()?;
        alarm.start()?;
        assert!(alarm.is_active());
        alarm.stop()?;
        alarm.stop()?;
        assert!(!alarm.is_active());
        Ok(())
    }

    #[test]
    fn command_alarm_rejects_empty_argv() {
        assert!(CommandAlarm::new(vec![]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_alarm_spawns_once_and_kills_on_stop() -> Result<()> {
        let mut alarm = CommandAlarm::new(vec!["sleep".into(), "30".into()])?;
        alarm.start()?;
        alarm.start()?;
        assert!(alarm.is_active());
        alarm.stop()?;
        assert!(!alarm.is_active());
        Ok(())
    }
}

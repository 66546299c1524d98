//! Synthetic UI input delivered to the target.
//!
//! The supervisor only needs four gestures: click at a point, glide the
//! pointer to a point, type text and press Enter. [`CommandInjector`]
//! delivers them through an external automation program (`xdotool` by
//! default).

use std::fmt;
use std::process::{Command, Stdio};
use std::time::Duration;

use crashbisect_error::{BisectError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Absolute screen coordinates. Serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct ScreenPos {
    pub x: i32,
    pub y: i32,
}

impl ScreenPos {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<[i32; 2]> for ScreenPos {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<ScreenPos> for [i32; 2] {
    fn from(pos: ScreenPos) -> Self {
        [pos.x, pos.y]
    }
}

impl fmt::Display for ScreenPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

pub trait InputInjector: Send {
    /// # Errors
    ///
    /// [`BisectError::Injector`] when the gesture could not be delivered.
    fn click(&mut self, pos: ScreenPos) -> Result<()>;

    /// Glide the pointer to `pos` over roughly `duration`.
    ///
    /// # Errors
    ///
    /// [`BisectError::Injector`] when the gesture could not be delivered.
    fn move_to(&mut self, pos: ScreenPos, duration: Duration) -> Result<()>;

    /// # Errors
    ///
    /// [`BisectError::Injector`] when the gesture could not be delivered.
    fn type_text(&mut self, text: &str) -> Result<()>;

    /// # Errors
    ///
    /// [`BisectError::Injector`] when the gesture could not be delivered.
    fn press_enter(&mut self) -> Result<()>;
}

/// Number of intermediate pointer positions used by [`CommandInjector::move_to`].
const GLIDE_STEPS: i32 = 10;

#[derive(Debug, Clone)]
pub struct CommandInjector {
    program: String,
    last_pos: Option<ScreenPos>,
}

impl CommandInjector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            last_pos: None,
        }
    }

    fn run(&self, args: &[String]) -> Result<()> {
        debug!(program = %self.program, ?args, "injecting input");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BisectError::injector(format!("{}: {e}", self.program)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BisectError::injector(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn mousemove(&self, pos: ScreenPos) -> Result<()> {
        self.run(&[
            "mousemove".to_owned(),
            pos.x.to_string(),
            pos.y.to_string(),
        ])
    }
}

impl InputInjector for CommandInjector {
    fn click(&mut self, pos: ScreenPos) -> Result<()> {
        self.run(&[
            "mousemove".to_owned(),
            pos.x.to_string(),
            pos.y.to_string(),
            "click".to_owned(),
            "1".to_owned(),
        ])?;
        self.last_pos = Some(pos);
        Ok(())
    }

    fn move_to(&mut self, pos: ScreenPos, duration: Duration) -> Result<()> {
        let from = self.last_pos.unwrap_or(pos);
        let pause = duration / GLIDE_STEPS.unsigned_abs();
        for step in 1..=GLIDE_STEPS {
            let at = ScreenPos::new(
                from.x + (pos.x - from.x) * step / GLIDE_STEPS,
                from.y + (pos.y - from.y) * step / GLIDE_STEPS,
            );
            self.mousemove(at)?;
            std::thread::sleep(pause);
        }
        self.last_pos = Some(pos);
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<()> {
        self.run(&[
            "type".to_owned(),
            "--delay".to_owned(),
            "12".to_owned(),
            "--".to_owned(),
            text.to_owned(),
        ])
    }

    fn press_enter(&mut self) -> Result<()> {
        self.run(&["key".to_owned(), "Return".to_owned()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_pos_serializes_as_pair() {
        let pos = ScreenPos::new(180, 64);
        assert_eq!(serde_json::to_string(&pos).unwrap(), "[180,64]");
        let back: ScreenPos = serde_json::from_str("[-5,7]").unwrap();
        assert_eq!(back, ScreenPos::new(-5, 7));
        assert_eq!(back.to_string(), "(-5, 7)");
    }

    #[test]
    fn test_missing_program_is_injector_error() {
        let mut injector = CommandInjector::new("crashbisect-no-such-automation-tool");
        let err = injector.press_enter().unwrap_err();
        assert!(matches!(err, BisectError::Injector { .. }));
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program_reports_status() {
        let mut injector = CommandInjector::new("false");
        let err = injector.type_text("hello").unwrap_err();
        assert!(err.to_string().contains("false type"), "got {err}");
    }
}

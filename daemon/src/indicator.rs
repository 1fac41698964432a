/// Tri-color indicator driver.
///
/// The light has one output line per channel and is wired active-low: a line
/// driven low turns its channel on. [`LineLevels::for_color`] is the
/// color-to-lines table; the [`Indicator`] implementations only move those
/// levels onto a backend.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::color::Color;

pub const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// How long to wait for the kernel (and udev) to create a freshly exported line.
const EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXPORT_POLL_ATTEMPTS: u32 = 40;

/// Electrical level of one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

impl Level {
    fn sysfs_value(self) -> &'static str {
        match self {
            Level::High => "1",
            Level::Low => "0",
        }
    }
}

/// Levels of the red, green and blue lines at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineLevels {
    pub red: Level,
    pub green: Level,
    pub blue: Level,
}

impl LineLevels {
    /// Active-low encoding of `color`.
    pub fn for_color(color: Color) -> Self {
        use Level::{High, Low};
        let (red, green, blue) = match color {
            Color::Off => (High, High, High),
            Color::Red => (Low, High, High),
            Color::Green => (High, Low, High),
            Color::Blue => (High, High, Low),
            Color::Yellow => (Low, Low, High),
            Color::White => (Low, Low, Low),
        };
        Self { red, green, blue }
    }
}

/// Physical output line numbers for each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pins {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("failed to export GPIO {pin}: {source}")]
    Export { pin: u32, source: io::Error },
    #[error("GPIO {pin} did not appear under {dir} after export")]
    ExportTimeout { pin: u32, dir: PathBuf },
    #[error("failed to configure GPIO {pin} as output: {source}")]
    Configure { pin: u32, source: io::Error },
    #[error("failed to write GPIO {pin}: {source}")]
    Write { pin: u32, source: io::Error },
}

/// Something that can show a [`Color`].
///
/// Implementations must be idempotent: applying the same levels twice leaves
/// the output unchanged.
pub trait Indicator: Send {
    /// Drives the three lines to `levels`.
    fn apply(&mut self, levels: LineLevels) -> Result<(), IndicatorError>;

    fn set_color(&mut self, color: Color) -> Result<(), IndicatorError> {
        self.apply(LineLevels::for_color(color))
    }
}

impl<I: Indicator + ?Sized> Indicator for Box<I> {
    fn apply(&mut self, levels: LineLevels) -> Result<(), IndicatorError> {
        (**self).apply(levels)
    }
}

// ── Linux sysfs backend ───────────────────────────────────────────────────────

struct GpioLine {
    pin: u32,
    value_path: PathBuf,
}

impl GpioLine {
    /// Exports `pin` if needed and configures it as an output that starts high
    /// (channel off).
    fn open(root: &Path, pin: u32) -> Result<Self, IndicatorError> {
        let dir = root.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(root.join("export"), pin.to_string())
                .map_err(|source| IndicatorError::Export { pin, source })?;
            wait_for_export(pin, &dir)?;
        }

        // "high" sets direction and initial level in one write, so the
        // channel never glitches on.
        fs::write(dir.join("direction"), "high")
            .map_err(|source| IndicatorError::Configure { pin, source })?;

        Ok(Self {
            pin,
            value_path: dir.join("value"),
        })
    }

    fn write(&self, level: Level) -> Result<(), IndicatorError> {
        fs::write(&self.value_path, level.sysfs_value()).map_err(|source| IndicatorError::Write {
            pin: self.pin,
            source,
        })
    }
}

fn wait_for_export(pin: u32, dir: &Path) -> Result<(), IndicatorError> {
    for _ in 0..EXPORT_POLL_ATTEMPTS {
        if dir.join("direction").exists() {
            return Ok(());
        }
        thread::sleep(EXPORT_POLL_INTERVAL);
    }
    Err(IndicatorError::ExportTimeout {
        pin,
        dir: dir.to_path_buf(),
    })
}

/// Hardware indicator driven through `/sys/class/gpio`.
pub struct SysfsGpioIndicator {
    red: GpioLine,
    green: GpioLine,
    blue: GpioLine,
}

impl SysfsGpioIndicator {
    /// Claims the three lines under `root` and configures them as outputs.
    pub fn open(root: &Path, pins: Pins) -> Result<Self, IndicatorError> {
        Ok(Self {
            red: GpioLine::open(root, pins.red)?,
            green: GpioLine::open(root, pins.green)?,
            blue: GpioLine::open(root, pins.blue)?,
        })
    }
}

impl Indicator for SysfsGpioIndicator {
    fn apply(&mut self, levels: LineLevels) -> Result<(), IndicatorError> {
        self.red.write(levels.red)?;
        self.green.write(levels.green)?;
        self.blue.write(levels.blue)?;
        Ok(())
    }
}

// ── Software backends ─────────────────────────────────────────────────────────

/// Indicator for `--dry-run`: logs the line levels instead of driving them.
pub struct LogIndicator;

impl Indicator for LogIndicator {
    fn apply(&mut self, levels: LineLevels) -> Result<(), IndicatorError> {
        info!(
            red = ?levels.red,
            green = ?levels.green,
            blue = ?levels.blue,
            "dry run: lines set"
        );
        Ok(())
    }
}

/// Indicator that only remembers what it was asked to show. Clones share the
/// same history.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingIndicator {
    history: std::sync::Arc<std::sync::Mutex<Vec<LineLevels>>>,
}

#[cfg(test)]
impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every set of levels applied so far, oldest first.
    pub fn history(&self) -> Vec<LineLevels> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The levels currently on the (virtual) lines.
    pub fn current(&self) -> Option<LineLevels> {
        self.history().last().copied()
    }
}

#[cfg(test)]
impl Indicator for RecordingIndicator {
    fn apply(&mut self, levels: LineLevels) -> Result<(), IndicatorError> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(levels);
        Ok(())
    }
}

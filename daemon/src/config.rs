use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::indicator::{Pins, DEFAULT_GPIO_ROOT};
use crate::listener::Framing;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dashcam-watchdog/config.toml";
/// Port the recorder connects to.
pub const DEFAULT_PORT: u16 = 5505;
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// BCM line numbers of the status light on the reference board.
pub const DEFAULT_GPIO_RED: u32 = 7;
pub const DEFAULT_GPIO_GREEN: u32 = 9;
pub const DEFAULT_GPIO_BLUE: u32 = 15;

/// Root configuration structure. Deserialized from config.toml.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub indicator: IndicatorConfig,
}

/// Where and how notifications are received.
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub framing: Framing,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            framing: Framing::default(),
        }
    }
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Which output lines drive the light.
#[derive(Debug, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_red")]
    pub red: u32,
    #[serde(default = "default_green")]
    pub green: u32,
    #[serde(default = "default_blue")]
    pub blue: u32,
    /// sysfs GPIO class directory.
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            red: DEFAULT_GPIO_RED,
            green: DEFAULT_GPIO_GREEN,
            blue: DEFAULT_GPIO_BLUE,
            gpio_root: PathBuf::from(DEFAULT_GPIO_ROOT),
        }
    }
}

impl IndicatorConfig {
    pub fn pins(&self) -> Pins {
        Pins {
            red: self.red,
            green: self.green,
            blue: self.blue,
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub red: Option<u32>,
    pub green: Option<u32>,
    pub blue: Option<u32>,
}

impl Config {
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(port) = overrides.port {
            self.listener.port = port;
        }
        if let Some(red) = overrides.red {
            self.indicator.red = red;
        }
        if let Some(green) = overrides.green {
            self.indicator.green = green;
        }
        if let Some(blue) = overrides.blue {
            self.indicator.blue = blue;
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_address() -> IpAddr {
    DEFAULT_ADDRESS
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_red() -> u32 {
    DEFAULT_GPIO_RED
}

fn default_green() -> u32 {
    DEFAULT_GPIO_GREEN
}

fn default_blue() -> u32 {
    DEFAULT_GPIO_BLUE
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from(DEFAULT_GPIO_ROOT)
}

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

/// The `[log]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Log {
    pub to: To,
    pub level: Level,
    pub dir: String,
    pub file: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: To::Console,
            level: Level::new(slog::Level::Info),
            dir: "/var/log/furly".into(),
            file: "furly.log".into(),
        }
    }
}

impl Log {
    /// Full path of the log file, empty when no file is configured.
    pub fn filename(&self) -> String {
        match (self.dir.trim_end_matches(['/', '\\']), self.file.as_str()) {
            (_, "") => String::new(),
            ("", file) => file.to_owned(),
            (dir, file) => format!("{dir}/{file}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }

    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(format!("invalid log target `{other}`")),
        }
    }
}

/// A `slog` level read from its name, `critical` included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn new(level: slog::Level) -> Self {
        Self(level)
    }

    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        slog::Level::from_str(s).map(Level).map_err(|_| format!("invalid log level `{s}`"))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

fn parse_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr<Err = String>,
{
    String::deserialize(deserializer)?.parse::<T>().map_err(de::Error::custom)
}

impl<'de> Deserialize<'de> for To {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        parse_str(deserializer)
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        parse_str(deserializer)
    }
}

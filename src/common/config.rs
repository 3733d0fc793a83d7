//! Settings that change how generated code decodes and encodes data.
//!
//! A `Config` is owned by the VM and read at decode time.
//! It can be replaced between runs, never during one.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use proptest_derive::Arbitrary;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endian should be one of `little', `big', `host' or `network'")]
    Endian,
    #[error("nenc should be one of `1c' or `2c'")]
    Nenc,
    #[error("obase should be one of 2, 8, 10 or 16")]
    Obase,
    #[error("invalid configuration: {0}")]
    Toml(String),
}

/// The byte order a setting asks for.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
    /// Whatever the machine running the VM uses.
    Host,
    /// Big endian.
    Network,
}

/// A concrete byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Lsb,
    Msb,
}

impl Endian {
    pub fn resolve(self) -> ByteOrder {
        match self {
            Endian::Little => ByteOrder::Lsb,
            Endian::Big | Endian::Network => ByteOrder::Msb,
            Endian::Host if cfg!(target_endian = "little") => ByteOrder::Lsb,
            Endian::Host => ByteOrder::Msb,
        }
    }
}

impl FromStr for Endian {
    type Err = ConfigError;

    fn from_str(word: &str) -> Result<Endian, ConfigError> {
        match word {
            "little" => Ok(Endian::Little),
            "big" => Ok(Endian::Big),
            "host" => Ok(Endian::Host),
            "network" => Ok(Endian::Network),
            _ => Err(ConfigError::Endian),
        }
    }
}

/// How negative integers are encoded.
#[cfg_attr(test, derive(Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegEncoding {
    #[serde(rename = "1c")]
    OnesComplement,
    #[serde(rename = "2c")]
    TwosComplement,
}

impl FromStr for NegEncoding {
    type Err = ConfigError;

    fn from_str(word: &str) -> Result<NegEncoding, ConfigError> {
        match word {
            "1c" => Ok(NegEncoding::OnesComplement),
            "2c" => Ok(NegEncoding::TwosComplement),
            _ => Err(ConfigError::Nenc),
        }
    }
}

impl fmt::Display for NegEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegEncoding::OnesComplement => write!(f, "1c"),
            NegEncoding::TwosComplement => write!(f, "2c"),
        }
    }
}

/// The radix integers are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Obase(u32);

impl Obase {
    pub fn radix(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Obase {
    type Error = ConfigError;

    fn try_from(base: u32) -> Result<Obase, ConfigError> {
        match base {
            2 | 8 | 10 | 16 => Ok(Obase(base)),
            _ => Err(ConfigError::Obase),
        }
    }
}

impl From<Obase> for u32 {
    fn from(base: Obase) -> u32 {
        base.0
    }
}

impl Default for Obase {
    fn default() -> Obase {
        Obase(10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub endian: Endian,
    pub nenc: NegEncoding,
    pub obase: Obase,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            endian: Endian::Big,
            nenc: NegEncoding::TwosComplement,
            obase: Obase::default(),
        }
    }
}

impl Config {
    /// Reads a configuration table such as
    /// ```toml
    /// endian = "little"
    /// nenc = "1c"
    /// obase = 16
    /// ```
    /// Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// Renders an integer in the configured output base,
    /// with the usual `0b`, `0o` or `0x` prefix.
    pub fn format_int(&self, value: i128) -> String {
        let sign = if value < 0 { "-" } else { "" };
        let magnitude = value.unsigned_abs();
        match self.obase.radix() {
            2 => format!("{}0b{:b}", sign, magnitude),
            8 => format!("{}0o{:o}", sign, magnitude),
            16 => format!("{}0x{:x}", sign, magnitude),
            _ => format!("{}{}", sign, magnitude),
        }
    }
}

//! Host platform detection.
//!
//! FMUs ship one binary per platform under a directory such as `linux64` or
//! `win32`. The key is detected once, before any native library is loaded, and is
//! then passed down as configuration (pool config, worker `Init` message).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Operating system and pointer width of a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformKey {
    /// Operating system name as reported by `std::env::consts::OS`.
    pub os: String,
    /// Pointer width in bits.
    pub pointer_width: u32,
}

impl PlatformKey {
    /// Creates a key from explicit values.
    #[must_use]
    pub fn new(os: impl Into<String>, pointer_width: u32) -> Self {
        Self {
            os: os.into(),
            pointer_width,
        }
    }

    /// Detects the platform of the current process.
    #[must_use]
    pub fn detect() -> Self {
        let pointer_width = if cfg!(target_pointer_width = "64") {
            64
        } else if cfg!(target_pointer_width = "32") {
            32
        } else {
            16
        };
        Self::new(std::env::consts::OS, pointer_width)
    }

    /// Returns the FMU binary directory name for this platform.
    pub fn directory(&self) -> Result<&'static str, ConfigurationError> {
        match (self.os.as_str(), self.pointer_width) {
            ("linux", 64) => Ok("linux64"),
            ("linux", 32) => Ok("linux32"),
            ("windows", 64) => Ok("win64"),
            ("windows", 32) => Ok("win32"),
            ("macos", 64) => Ok("darwin64"),
            _ => Err(ConfigurationError::UnsupportedPlatform {
                os: self.os.clone(),
                bits: self.pointer_width,
            }),
        }
    }
}

impl Default for PlatformKey {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}bit", self.os, self.pointer_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_platforms_map_to_directories() {
        assert_eq!(PlatformKey::new("linux", 64).directory().unwrap(), "linux64");
        assert_eq!(PlatformKey::new("windows", 32).directory().unwrap(), "win32");
        assert_eq!(PlatformKey::new("windows", 64).directory().unwrap(), "win64");
        assert_eq!(PlatformKey::new("macos", 64).directory().unwrap(), "darwin64");
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let err = PlatformKey::new("plan9", 64).directory().unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnsupportedPlatform {
                os: "plan9".to_string(),
                bits: 64
            }
        );
    }

    #[test]
    fn detect_matches_build_target() {
        let key = PlatformKey::detect();
        assert_eq!(key.os, std::env::consts::OS);
        assert_eq!(key.pointer_width as usize, std::mem::size_of::<usize>() * 8);
        assert_eq!(key.to_string(), format!("{}-{}bit", key.os, key.pointer_width));
    }
}

//! Target platforms and platform sets.
//!
//! A [`Platform`] is an `os/architecture[/variant]` triple, normalized on construction so that
//! the many spellings found in the wild (`x86_64`, `aarch64`, `armhf`, ...) compare equal to the
//! names used in OCI image indexes. A [`PlatformSet`] is the ordered list of platforms a caller
//! asks for; an empty set matches any platform.

use std::{fmt, str::FromStr};

use oci_spec::image::ImageConfiguration;

/// Errors from parsing a platform specifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformParseError {
    #[error("invalid platform {0:?}: expected os/architecture[/variant]")]
    Format(String),
    #[error("invalid platform {0:?}: empty component")]
    EmptyComponent(String),
}

/// A normalized target platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Platform {
    os: String,
    architecture: String,
    variant: Option<String>,
}

impl Platform {
    /// Creates a platform, normalizing all three components.
    pub fn new(
        os: impl AsRef<str>,
        architecture: impl AsRef<str>,
        variant: Option<impl AsRef<str>>,
    ) -> Self {
        let os = normalize_os(os.as_ref());
        let (architecture, variant) = normalize_arch(
            &architecture.as_ref().to_lowercase(),
            variant.as_ref().map(|v| v.as_ref().to_lowercase()),
        );
        Platform {
            os,
            architecture,
            variant,
        }
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Reads the platform an image configuration was built for.
    pub fn from_config(config: &ImageConfiguration) -> Self {
        Platform::new(
            config.os().to_string(),
            config.architecture().to_string(),
            config.variant().as_deref(),
        )
    }
}

impl From<&oci_spec::image::Platform> for Platform {
    fn from(platform: &oci_spec::image::Platform) -> Self {
        Platform::new(
            platform.os().to_string(),
            platform.architecture().to_string(),
            platform.variant().as_deref(),
        )
    }
}

fn normalize_os(os: &str) -> String {
    match os.to_lowercase().as_str() {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str, variant: Option<String>) -> (String, Option<String>) {
    let variant = variant.filter(|v| !v.is_empty());
    match arch {
        "i386" => ("386".to_string(), None),
        "x86_64" | "x86-64" | "amd64" => match variant.as_deref() {
            None | Some("v1") => ("amd64".to_string(), None),
            Some(_) => ("amd64".to_string(), variant),
        },
        "aarch64" | "arm64" => match variant.as_deref() {
            None | Some("8") | Some("v8") => ("arm64".to_string(), None),
            Some(_) => ("arm64".to_string(), variant),
        },
        "armhf" => ("arm".to_string(), Some("v7".to_string())),
        "armel" => ("arm".to_string(), Some("v6".to_string())),
        "arm" => match variant.as_deref() {
            None | Some("7") => ("arm".to_string(), Some("v7".to_string())),
            Some(v @ ("5" | "6" | "8")) => ("arm".to_string(), Some(format!("v{v}"))),
            Some(_) => ("arm".to_string(), variant),
        },
        other => (other.to_string(), variant),
    }
}

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PlatformParseError::EmptyComponent(s.to_string()));
        }
        match parts[..] {
            [os, arch] => Ok(Platform::new(os, arch, None::<&str>)),
            [os, arch, variant] => Ok(Platform::new(os, arch, Some(variant))),
            _ => Err(PlatformParseError::Format(s.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// An ordered set of requested platforms.
///
/// The empty set is a wildcard: it matches every platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PlatformSet(Vec<Platform>);

impl PlatformSet {
    /// The wildcard set.
    pub fn any() -> Self {
        PlatformSet(Vec::new())
    }

    pub fn new(platforms: Vec<Platform>) -> Self {
        let mut deduped: Vec<Platform> = Vec::with_capacity(platforms.len());
        for platform in platforms {
            if !deduped.contains(&platform) {
                deduped.push(platform);
            }
        }
        PlatformSet(deduped)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Platform> {
        self.0.iter()
    }

    /// Returns true if `platform` is one of the requested platforms, or if the set is empty.
    pub fn matches(&self, platform: &Platform) -> bool {
        self.0.is_empty() || self.0.contains(platform)
    }
}

impl From<Vec<Platform>> for PlatformSet {
    fn from(platforms: Vec<Platform>) -> Self {
        PlatformSet::new(platforms)
    }
}

impl FromIterator<Platform> for PlatformSet {
    fn from_iter<I: IntoIterator<Item = Platform>>(iter: I) -> Self {
        PlatformSet::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PlatformSet {
    type Item = &'a Platform;
    type IntoIter = std::slice::Iter<'a, Platform>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for PlatformSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("any");
        }
        for (i, platform) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{platform}")?;
        }
        Ok(())
    }
}

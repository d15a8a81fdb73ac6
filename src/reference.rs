//! Image reference classification and normalization.
//!
//! A raw reference is one of:
//!
//! - `docker://<name>`: exported from the local Docker daemon,
//! - `podman://<name>`: exported from the local Podman daemon,
//! - `<name>[:tag|@digest]`: resolved through the local store and remote registries.
//!
//! The name part follows the docker reference grammar and is normalized to its canonical,
//! fully-qualified form (`nginx` becomes `docker.io/library/nginx:latest`).

use std::fmt;

use once_cell::sync::Lazy;
use regex_automata::meta::Regex;

use crate::error::{Error, Result};

const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPOSITORY_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";
const NAME_TOTAL_LENGTH_MAX: usize = 255;

static PATH_COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").expect("path component regex")
});

static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*(?::[0-9]+)?$",
    )
    .expect("domain regex")
});

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag regex"));

static DIGEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[-_+.][a-z0-9]+)*:[0-9a-f]+$").expect("digest regex")
});

static IMAGE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("image id regex"));

/// Errors from parsing the name part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty reference")]
    Empty,
    #[error("invalid repository name ({0}), cannot specify 64-byte hexadecimal strings")]
    ImageId(String),
    #[error("repository name must be lowercase")]
    Uppercase,
    #[error("repository name must not be more than {NAME_TOTAL_LENGTH_MAX} characters")]
    NameTooLong,
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
    #[error("invalid path component {0:?}")]
    InvalidPath(String),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),
}

/// A local container daemon that can export images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Daemon {
    Docker,
    Podman,
}

impl Daemon {
    /// The reference prefix routing to this daemon.
    pub fn prefix(self) -> &'static str {
        match self {
            Daemon::Docker => "docker://",
            Daemon::Podman => "podman://",
        }
    }

    /// The executable used when no override is configured.
    pub fn default_binary(self) -> &'static str {
        match self {
            Daemon::Docker => "docker",
            Daemon::Podman => "podman",
        }
    }
}

impl fmt::Display for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Where the bytes of an image come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Exported from a local daemon.
    Daemon(Daemon),
    /// Looked up in the local store, pulled from a registry when needed.
    Registry,
}

/// A canonical, fully-qualified image name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Name {
    /// Parses and normalizes an image name.
    ///
    /// Names without a tag or digest get the `latest` tag. Names with both a tag and a digest
    /// keep only the digest, as the digest alone identifies the content.
    pub fn parse(s: &str) -> std::result::Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if IMAGE_ID.is_match(s) {
            return Err(ParseError::ImageId(s.to_string()));
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((remainder, digest)) => (remainder, Some(digest)),
            None => (s, None),
        };

        // A colon after the last slash separates the tag; earlier ones belong to a port.
        let (repository, tag) = match remainder.rfind(':') {
            Some(colon) if !remainder[colon..].contains('/') => {
                (&remainder[..colon], Some(&remainder[colon + 1..]))
            }
            _ => (remainder, None),
        };

        let (domain, path) = split_domain(repository);

        if path.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::Uppercase);
        }
        if !DOMAIN.is_match(&domain) {
            return Err(ParseError::InvalidDomain(domain));
        }
        for component in path.split('/') {
            if !PATH_COMPONENT.is_match(component) {
                return Err(ParseError::InvalidPath(component.to_string()));
            }
        }
        if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }
        if let Some(tag) = tag {
            if !TAG.is_match(tag) {
                return Err(ParseError::InvalidTag(tag.to_string()));
            }
        }
        if let Some(digest) = digest {
            validate_digest(digest)?;
        }

        let tag = match (tag, digest) {
            (_, Some(_)) => None,
            (Some(tag), None) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Name {
            domain,
            path,
            tag,
            digest: digest.map(str::to_string),
        })
    }

    /// The registry host, e.g. `docker.io` or `registry.example:5000`.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The repository path within the registry, e.g. `library/nginx`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

fn split_domain(repository: &str) -> (String, String) {
    let (domain, path) = match repository.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.to_lowercase() != first =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), repository.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };

    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{OFFICIAL_REPOSITORY_PREFIX}{path}")
    } else {
        path
    };

    (domain, path)
}

fn validate_digest(digest: &str) -> std::result::Result<(), ParseError> {
    let invalid = || ParseError::InvalidDigest(digest.to_string());
    if !DIGEST.is_match(digest) {
        return Err(invalid());
    }
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(invalid)?;
    let expected = match algorithm {
        "sha256" => 64,
        "sha384" => 96,
        "sha512" => 128,
        _ => return Err(invalid()),
    };
    if encoded.len() != expected {
        return Err(invalid());
    }
    Ok(())
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// A classified image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    raw: String,
    kind: SourceKind,
    name: Name,
}

impl ImageReference {
    /// Classifies `raw` by its prefix and normalizes the remaining name.
    ///
    /// This never touches the store or the network.
    pub fn classify(raw: &str) -> Result<Self> {
        let (kind, rest) = [Daemon::Docker, Daemon::Podman]
            .into_iter()
            .find_map(|daemon| {
                raw.strip_prefix(daemon.prefix())
                    .map(|rest| (SourceKind::Daemon(daemon), rest))
            })
            .unwrap_or((SourceKind::Registry, raw));

        let name = Name::parse(rest).map_err(|source| Error::Parse {
            reference: rest.to_string(),
            source,
        })?;

        Ok(ImageReference {
            raw: raw.to_string(),
            kind,
            name,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn name(&self) -> &Name {
        &self.name
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SourceKind::Daemon(daemon) => write!(f, "{}{}", daemon.prefix(), self.name),
            SourceKind::Registry => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    const DIGEST: &str = "sha256:abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    fn normalized(s: &str) -> String {
        Name::parse(s).unwrap().to_string()
    }

    #[test]
    fn test_normalize() {
        let cases = [
            ("nginx", "docker.io/library/nginx:latest"),
            ("nginx:1.25", "docker.io/library/nginx:1.25"),
            ("myuser/myimage", "docker.io/myuser/myimage:latest"),
            ("index.docker.io/nginx", "docker.io/library/nginx:latest"),
            ("docker.io/library/nginx:1", "docker.io/library/nginx:1"),
            ("ghcr.io/org/sub/image:v1", "ghcr.io/org/sub/image:v1"),
            ("localhost/myimage:test", "localhost/myimage:test"),
            ("localhost:5000/myimage", "localhost:5000/myimage:latest"),
            (
                "registry.example:5000/app:v1",
                "registry.example:5000/app:v1",
            ),
            ("registry.example/app:v1", "registry.example/app:v1"),
            ("a__b/c-d.e", "docker.io/a__b/c-d.e:latest"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalized(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_digest_drops_tag() {
        assert_eq!(
            normalized(&format!("ghcr.io/org/app:v1@{DIGEST}")),
            format!("ghcr.io/org/app@{DIGEST}")
        );
        let name = Name::parse(&format!("busybox@{DIGEST}")).unwrap();
        assert_eq!(name.tag(), None);
        assert_eq!(name.digest(), Some(DIGEST));
        assert_eq!(name.domain(), "docker.io");
        assert_eq!(name.path(), "library/busybox");
    }

    #[test]
    fn test_uppercase_domain_component() {
        // An uppercase first component can only be a domain.
        let name = Name::parse("Registry/app").unwrap();
        assert_eq!(name.domain(), "Registry");
        assert_eq!(name.path(), "app");
    }

    #[test]
    fn test_invalid() {
        let id = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let cases = [
            ("", ParseError::Empty),
            (id, ParseError::ImageId(id.to_string())),
            ("docker.io/Library/nginx", ParseError::Uppercase),
            ("nginx:", ParseError::InvalidTag("".to_string())),
            ("nginx:-x", ParseError::InvalidTag("-x".to_string())),
            ("a//b", ParseError::InvalidPath("".to_string())),
            ("-x", ParseError::InvalidPath("-x".to_string())),
            (
                "nginx@sha256:abc",
                ParseError::InvalidDigest("sha256:abc".to_string()),
            ),
            (
                "nginx@md5:0123456789abcdef0123456789abcdef",
                ParseError::InvalidDigest("md5:0123456789abcdef0123456789abcdef".to_string()),
            ),
            ("-bad.example/x", ParseError::InvalidDomain("-bad.example".to_string())),
        ];
        for (input, expected) in cases {
            assert_eq!(Name::parse(input), Err(expected), "input: {input:?}");
        }

        let long = format!("example.com/{}", "a".repeat(250));
        assert_eq!(Name::parse(&long), Err(ParseError::NameTooLong));
    }

    #[test]
    fn test_classify() {
        let r = ImageReference::classify("docker://myimage:latest").unwrap();
        assert_eq!(r.kind(), SourceKind::Daemon(Daemon::Docker));
        assert_eq!(r.name().to_string(), "docker.io/library/myimage:latest");
        assert_eq!(r.to_string(), "docker://docker.io/library/myimage:latest");

        let r = ImageReference::classify("podman://localhost/built").unwrap();
        assert_eq!(r.kind(), SourceKind::Daemon(Daemon::Podman));
        assert_eq!(r.name().to_string(), "localhost/built:latest");

        let r = ImageReference::classify("registry.example/app:v1").unwrap();
        assert_eq!(r.kind(), SourceKind::Registry);
        assert_eq!(r.raw(), "registry.example/app:v1");
        assert_eq!(r.name().to_string(), "registry.example/app:v1");
    }

    #[test]
    fn test_classify_errors() {
        let err = ImageReference::classify("docker://").unwrap_err();
        assert!(
            matches!(&err, Error::Parse { reference, source: ParseError::Empty } if reference.is_empty()),
            "{err:?}"
        );

        let err = ImageReference::classify("podman://Bad/Name").unwrap_err();
        assert_eq!(err.to_string(), r#"failed to parse "Bad/Name""#);

        // Only the exact prefixes route to a daemon.
        let err = ImageReference::classify("docker:/x").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}

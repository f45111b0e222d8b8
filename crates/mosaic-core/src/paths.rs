use crate::errors::PathError;
use semver::{Version, VersionReq};
use std::fmt;
use std::str::FromStr;

/// A versioned module identifier of the form `name@version[/subpath]`.
///
/// `pkg` may be a scoped name (`@scope/name`). On the definition side
/// `version` is an exact version; on the require side it is a semver range.
/// `sub` is either empty or begins with `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionedPath {
    pub pkg: String,
    pub version: String,
    pub sub: String,
}

impl VersionedPath {
    /// Parse the `(@scope/)?name@version(/subpath)?` grammar.
    ///
    /// The codec is total: malformed input yields `None`. For every valid
    /// input, `parse` followed by `to_string` reproduces it byte for byte.
    pub fn parse(input: &str) -> Option<Self> {
        // A scope is everything up to the first '/', and only counts when it
        // starts with '@'. The non-greedy prefix matters: in
        // "@scope/pkg@1.0.0/lib/x.js" the name is "@scope/pkg", not "@scope".
        let (scope, rest) = if input.starts_with('@') {
            let slash = input.find('/')?;
            if slash < 2 {
                return None;
            }
            (Some(&input[..slash]), &input[slash + 1..])
        } else {
            (None, input)
        };

        let at = rest.find('@')?;
        let name = &rest[..at];
        if name.is_empty() || name.contains('/') {
            return None;
        }

        let after = &rest[at + 1..];
        let (version, sub) = match after.find('/') {
            Some(slash) => (&after[..slash], &after[slash..]),
            None => (after, ""),
        };
        if version.is_empty() {
            return None;
        }

        let pkg = match scope {
            Some(scope) => format!("{scope}/{name}"),
            None => name.to_string(),
        };

        Some(Self {
            pkg,
            version: version.to_string(),
            sub: sub.to_string(),
        })
    }

    /// The version parsed as an exact semver version, when it is one.
    pub fn exact_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }

    /// The version parsed as a semver range, when it is one.
    pub fn version_req(&self) -> Option<VersionReq> {
        VersionReq::parse(&self.version).ok()
    }
}

impl fmt::Display for VersionedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{}", self.pkg, self.version, self.sub)
    }
}

impl FromStr for VersionedPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| PathError(s.to_string()))
    }
}

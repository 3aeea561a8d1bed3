//! Namespace-qualified class names (`root\cimv2\Win32_Process`).

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A class name optionally prefixed by the namespace it lives in.
///
/// The class identifier is everything after the last backslash; the
/// namespace is everything before it, relative to the session root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    namespace: String,
    class: String,
}

impl QualifiedName {
    pub fn parse(qualified: &str) -> Result<Self, Error> {
        let qualified = qualified.trim();
        let (namespace, class) = match qualified.rfind('\\') {
            Some(idx) => (&qualified[..idx], &qualified[idx + 1..]),
            None => ("", qualified),
        };

        if class.is_empty() {
            return Err(Error::InvalidName(format!(
                "\"{}\" has no class identifier",
                qualified
            )));
        }

        Ok(Self {
            namespace: namespace.trim_end_matches('\\').to_string(),
            class: class.to_string(),
        })
    }

    /// Namespace part; empty when the class lives in the root namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Class identifier, used verbatim in query text
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn has_namespace(&self) -> bool {
        !self.namespace.is_empty()
    }
}

impl FromStr for QualifiedName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_namespace() {
            write!(f, "{}\\{}", self.namespace, self.class)
        } else {
            write!(f, "{}", self.class)
        }
    }
}

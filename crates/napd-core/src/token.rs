//! Identity tokens.
//!
//! An identity token is a string of the form `namespace:value` that links an
//! app to a policy. Three namespaces exist, with a fixed matching priority:
//! mandatory-access-control label (`selinux`), user name (`user`) and group
//! name (`group`). Tokens that do not follow the grammar are rejected at
//! parse time; registration paths drop them silently.

use std::fmt;

/// Token namespace, ordered by matching priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Mandatory-access-control label, highest priority.
    Selinux,
    /// User name.
    User,
    /// Group name, lowest priority.
    Group,
}

impl Namespace {
    /// Matching priority; higher wins during active-policy selection.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Selinux => 2,
            Self::User => 1,
            Self::Group => 0,
        }
    }

    /// The wire spelling of the namespace.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Selinux => "selinux",
            Self::User => "user",
            Self::Group => "group",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "selinux" => Some(Self::Selinux),
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `namespace:value` identity token.
///
/// Construction always goes through the validating constructors; the
/// joined form is recovered with [`Display`](fmt::Display) or
/// [`as_policy_id`](Self::as_policy_id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken {
    namespace: Namespace,
    value: String,
}

impl IdentityToken {
    /// Builds a token from a namespace and a raw value.
    ///
    /// Returns `None` when the value is empty or contains characters outside
    /// the identifier grammar (alphanumerics plus `-`, `_` and `.`).
    #[must_use]
    pub fn new(namespace: Namespace, value: &str) -> Option<Self> {
        if !is_valid_value(value) {
            return None;
        }
        Some(Self {
            namespace,
            value: value.to_owned(),
        })
    }

    /// Parses a `namespace:value` string.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        let (namespace, value) = token.split_once(':')?;
        Self::new(Namespace::parse(namespace)?, value)
    }

    /// The token namespace.
    #[must_use]
    pub const fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// The value part, without the namespace prefix.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Matching priority of the token's namespace.
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.namespace.priority()
    }

    /// Renders the `namespace:value` form used as a policy id.
    #[must_use]
    pub fn as_policy_id(&self) -> String {
        format!("{}:{}", self.namespace, self.value)
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

fn is_valid_value(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

use std::fmt;

const SEPARATOR: char = '_';

/// Names the Vault objects managed on behalf of a ServiceAccount.
///
/// Keys take the form `<prefix>_<backend>_<namespace>_<name>`. Kubernetes names may not contain
/// underscores, so the namespace and name can be recovered from a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
    backend: String,
}

/// Identifies a ServiceAccount.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct IdentityRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{field} must be non-empty and must not contain a '_': {value:?}")]
pub struct InvalidPrefix {
    field: &'static str,
    value: String,
}

// === impl KeyCodec ===

impl KeyCodec {
    pub fn new(prefix: impl Into<String>, backend: impl Into<String>) -> Result<Self, InvalidPrefix> {
        let prefix = prefix.into();
        let backend = backend.into();
        validate("prefix", &prefix)?;
        validate("backend", &backend)?;
        Ok(Self { prefix, backend })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn encode(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.prefix,
            self.backend,
            namespace,
            name,
            sep = SEPARATOR
        )
    }

    /// Recovers the ServiceAccount from a key produced by this codec.
    ///
    /// Returns `None` for any key that was not produced with this codec's prefix and backend.
    pub fn decode(&self, key: &str) -> Option<IdentityRef> {
        let parts = key.split(SEPARATOR).collect::<Vec<_>>();
        match parts[..] {
            [prefix, backend, namespace, name]
                if prefix == self.prefix
                    && backend == self.backend
                    && !namespace.is_empty()
                    && !name.is_empty() =>
            {
                Some(IdentityRef::new(namespace, name))
            }
            _ => None,
        }
    }
}

fn validate(field: &'static str, value: &str) -> Result<(), InvalidPrefix> {
    if value.is_empty() || value.contains(SEPARATOR) {
        return Err(InvalidPrefix {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

// === impl IdentityRef ===

impl IdentityRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode() {
        let codec = KeyCodec::new("prefix", "aws").unwrap();
        assert_eq!(codec.encode("team-a", "svc"), "prefix_aws_team-a_svc");
    }

    #[test]
    fn decode_own_keys() {
        let codec = KeyCodec::new("vkcc", "gcp").unwrap();
        for (ns, name) in &[("team-a", "svc"), ("kube-system", "a.b-c"), ("x", "y")] {
            assert_eq!(
                codec.decode(&codec.encode(ns, name)),
                Some(IdentityRef::new(*ns, *name))
            );
        }
    }

    #[test]
    fn decode_foreign_keys() {
        let codec = KeyCodec::new("vkcc", "aws").unwrap();
        for key in &[
            "other_aws_team-a_svc",
            "vkcc_gcp_team-a_svc",
            "vkcc_aws_team-a",
            "vkcc_aws_team-a_svc_extra",
            "vkcc_aws__svc",
            "vkcc_aws_team-a_",
            "default",
            "root",
            "",
        ] {
            assert_eq!(codec.decode(key), None, "{} must not decode", key);
        }
    }

    #[test]
    fn reject_separator() {
        assert!(KeyCodec::new("my_prefix", "aws").is_err());
        assert!(KeyCodec::new("", "aws").is_err());
        assert!(KeyCodec::new("vkcc", "a_b").is_err());
    }
}

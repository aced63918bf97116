use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::path::Path;
use vkcc_core::IdentityRef;

/// Reads the identity of the ServiceAccount a token was issued to.
///
/// The token's signature is not verified: the token is only used to derive default role names,
/// and Vault verifies it on login.
pub fn identity_from_file(path: impl AsRef<Path>) -> Result<IdentityRef> {
    let path = path.as_ref();
    let jwt = std::fs::read_to_string(path)
        .with_context(|| format!("reading token {}", path.display()))?;
    identity_from_jwt(jwt.trim()).with_context(|| format!("parsing token {}", path.display()))
}

pub fn identity_from_jwt(jwt: &str) -> Result<IdentityRef> {
    let payload = match jwt.split('.').collect::<Vec<_>>()[..] {
        [_, payload, _] => payload,
        _ => bail!("token is not a JWT"),
    };
    let payload = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("decoding token claims")?;
    let claims = serde_json::from_slice::<Claims>(&payload).context("parsing token claims")?;
    claims.identity()
}

/// Claims set by Kubernetes on ServiceAccount tokens. Legacy secret-based tokens and projected
/// tokens describe the ServiceAccount differently.
#[derive(Debug, Default, Deserialize)]
struct Claims {
    #[serde(rename = "kubernetes.io/serviceaccount/namespace")]
    legacy_namespace: Option<String>,

    #[serde(rename = "kubernetes.io/serviceaccount/service-account.name")]
    legacy_name: Option<String>,

    #[serde(rename = "kubernetes.io")]
    projected: Option<Projected>,
}

#[derive(Debug, Default, Deserialize)]
struct Projected {
    namespace: Option<String>,
    serviceaccount: Option<Named>,
}

#[derive(Debug, Default, Deserialize)]
struct Named {
    name: Option<String>,
}

// === impl Claims ===

impl Claims {
    fn identity(self) -> Result<IdentityRef> {
        let (projected_ns, projected_name) = match self.projected {
            Some(p) => (p.namespace, p.serviceaccount.and_then(|sa| sa.name)),
            None => (None, None),
        };
        let namespace = projected_ns
            .or(self.legacy_namespace)
            .filter(|ns| !ns.is_empty())
            .context("token has no namespace claim")?;
        let name = projected_name
            .or(self.legacy_name)
            .filter(|n| !n.is_empty())
            .context("token has no ServiceAccount name claim")?;
        Ok(IdentityRef::new(namespace, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mk_jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","kid":"k"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.c2lnbmF0dXJl", header, payload)
    }

    #[test]
    fn legacy_claims() {
        let jwt = mk_jwt(json!({
            "iss": "kubernetes/serviceaccount",
            "kubernetes.io/serviceaccount/namespace": "team-a",
            "kubernetes.io/serviceaccount/secret.name": "svc-token-abcde",
            "kubernetes.io/serviceaccount/service-account.name": "svc",
            "kubernetes.io/serviceaccount/service-account.uid": "0000",
            "sub": "system:serviceaccount:team-a:svc"
        }));
        assert_eq!(
            identity_from_jwt(&jwt).unwrap(),
            IdentityRef::new("team-a", "svc")
        );
    }

    #[test]
    fn projected_claims() {
        let jwt = mk_jwt(json!({
            "aud": ["vault"],
            "kubernetes.io": {
                "namespace": "team-b",
                "pod": {"name": "svc-0", "uid": "1111"},
                "serviceaccount": {"name": "worker", "uid": "2222"}
            },
            "sub": "system:serviceaccount:team-b:worker"
        }));
        assert_eq!(
            identity_from_jwt(&jwt).unwrap(),
            IdentityRef::new("team-b", "worker")
        );
    }

    #[test]
    fn padded_payload() {
        let jwt = mk_jwt(json!({
            "kubernetes.io": {"namespace": "ns", "serviceaccount": {"name": "a"}}
        }));
        let mut parts = jwt.split('.').map(String::from).collect::<Vec<_>>();
        while parts[1].len() % 4 != 0 {
            parts[1].push('=');
        }
        assert_eq!(
            identity_from_jwt(&parts.join(".")).unwrap(),
            IdentityRef::new("ns", "a")
        );
    }

    #[test]
    fn invalid_tokens() {
        assert!(identity_from_jwt("").is_err());
        assert!(identity_from_jwt("a.b").is_err());
        assert!(identity_from_jwt("a.!!!.c").is_err());
        assert!(identity_from_jwt(&mk_jwt(json!({"sub": "x"}))).is_err());
        assert!(identity_from_jwt(&mk_jwt(json!({
            "kubernetes.io/serviceaccount/namespace": "team-a"
        })))
        .is_err());
        assert!(identity_from_jwt(&mk_jwt(json!({
            "kubernetes.io": {"namespace": "", "serviceaccount": {"name": "svc"}}
        })))
        .is_err());
    }

    #[test]
    fn read_from_file() {
        let path = std::env::temp_dir().join(format!("vkcc-token-{}", std::process::id()));
        let jwt = mk_jwt(json!({
            "kubernetes.io": {"namespace": "ns", "serviceaccount": {"name": "sa"}}
        }));
        std::fs::write(&path, format!("{}\n", jwt)).unwrap();
        let res = identity_from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(res.unwrap(), IdentityRef::new("ns", "sa"));
        assert!(identity_from_file(&path).is_err());
    }
}

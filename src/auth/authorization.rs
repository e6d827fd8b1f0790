//! Authorization tree, grounded on `original_source/http_server/src/auth/authorization.cpp`: a
//! startup-built, read-only map from directory to per-verb role sets, parsed out of `.auth`
//! files found while walking `www-root`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::http::types::Method;

const WILDCARD_ROLE: &str = "*";
const ROOT_ROLE: &str = "root";

#[derive(Debug)]
pub(crate) struct AuthorizationError(pub(crate) String);

/// Per-directory verb -> allowed-role-set table, built once at startup and never mutated again.
#[derive(Debug, Default)]
pub(crate) struct AuthorizationTree {
    www_root: PathBuf,
    rules: HashMap<PathBuf, HashMap<Method, HashSet<String>>>,
}

impl AuthorizationTree {
    /// Recursively walks `www_root` looking for `.auth` files and parses each into the tree.
    pub(crate) async fn build(www_root: &Path) -> Result<Self, AuthorizationError> {
        let www_root = www_root
            .canonicalize()
            .map_err(|e| AuthorizationError(format!("{}: {e}", www_root.display())))?;

        let mut tree = AuthorizationTree {
            www_root: www_root.clone(),
            rules: HashMap::new(),
        };
        tree.visit(&www_root).await?;
        Ok(tree)
    }

    fn visit<'a>(
        &'a mut self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), AuthorizationError>> + 'a>>
    {
        Box::pin(async move {
            let auth_file = dir.join(".auth");
            if let Ok(text) = fs::read_to_string(&auth_file).await {
                let rules = parse_auth_file(&text)
                    .map_err(|e| AuthorizationError(format!("{}: {e}", auth_file.display())))?;
                self.rules.insert(dir.to_path_buf(), rules);
            }

            let mut entries = fs::read_dir(dir)
                .await
                .map_err(|e| AuthorizationError(format!("{}: {e}", dir.display())))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AuthorizationError(e.to_string()))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| AuthorizationError(e.to_string()))?;
                if file_type.is_dir() {
                    self.visit(&entry.path()).await?;
                }
            }

            Ok(())
        })
    }

    /// Checks whether `role` may perform `verb` on `path`: root short-circuits, otherwise walk
    /// from `path` up toward `www_root`, returning on the first directory with a rule for `verb`;
    /// default-allow GET at the root if nothing matched.
    pub(crate) fn authorize(&self, role: &str, path: &Path, verb: Method) -> bool {
        if role == ROOT_ROLE {
            return true;
        }

        let mut current = path;
        loop {
            if let Some(rules) = self.rules.get(current) {
                if let Some(roles) = rules.get(&verb) {
                    return roles.contains(role) || roles.contains(WILDCARD_ROLE);
                }
            }

            if current == self.www_root {
                return verb == Method::Get;
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => return verb == Method::Get,
            }
        }
    }
}

fn parse_auth_file(
    text: &str,
) -> Result<HashMap<Method, HashSet<String>>, String> {
    let mut rules = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (verb, roles) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed line: {line}"))?;
        let method = Method::from_bytes(verb.trim().to_uppercase().as_bytes())
            .map_err(|_| format!("unknown verb: {verb}"))?;
        let roles: HashSet<String> = roles.split('|').map(|r| r.trim().to_string()).collect();
        rules.insert(method, roles);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_role_always_allowed() {
        let tree = AuthorizationTree {
            www_root: PathBuf::from("/www"),
            rules: HashMap::new(),
        };
        assert!(tree.authorize("root", Path::new("/www/secret"), Method::Delete));
    }

    #[test]
    fn default_policy_allows_get_at_root_only() {
        let tree = AuthorizationTree {
            www_root: PathBuf::from("/www"),
            rules: HashMap::new(),
        };
        assert!(tree.authorize("anyone", Path::new("/www"), Method::Get));
        assert!(!tree.authorize("anyone", Path::new("/www"), Method::Put));
    }

    #[test]
    fn recurses_to_parent_when_no_rule_at_node() {
        let mut rules = HashMap::new();
        let mut www_rules = HashMap::new();
        www_rules.insert(Method::Get, HashSet::from(["user".to_string()]));
        rules.insert(PathBuf::from("/www"), www_rules);

        let tree = AuthorizationTree {
            www_root: PathBuf::from("/www"),
            rules,
        };

        assert!(tree.authorize("user", Path::new("/www/sub/deep"), Method::Get));
        assert!(!tree.authorize("stranger", Path::new("/www/sub/deep"), Method::Get));
    }

    #[test]
    fn wildcard_role_matches_any() {
        let mut rules = HashMap::new();
        let mut dir_rules = HashMap::new();
        dir_rules.insert(Method::Put, HashSet::from(["*".to_string()]));
        rules.insert(PathBuf::from("/www/uploads"), dir_rules);

        let tree = AuthorizationTree {
            www_root: PathBuf::from("/www"),
            rules,
        };

        assert!(tree.authorize("whoever", Path::new("/www/uploads"), Method::Put));
    }

    #[test]
    fn parse_auth_file_rejects_unknown_verb() {
        assert!(parse_auth_file("PATCH:root").is_err());
    }

    #[test]
    fn parse_auth_file_accepts_multiple_roles() {
        let rules = parse_auth_file("GET:user|root\nDELETE:root").unwrap();
        assert_eq!(
            rules.get(&Method::Get).unwrap(),
            &HashSet::from(["user".to_string(), "root".to_string()])
        );
    }
}

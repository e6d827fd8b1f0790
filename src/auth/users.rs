//! User store, grounded on `original_source/http_server/src/auth/authentication.cpp`: in-memory
//! username -> (password hash, role) map, SHA-1+base64 hashing against a server-wide salt, and a
//! deferred-save protocol that coalesces bursts of mutations into one disk write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::sync::RwLock;

use crate::http::types::Ticket;

#[derive(Debug, Clone)]
pub(crate) struct User {
    pub(crate) password_hash_b64: String,
    pub(crate) role: String,
}

#[derive(Debug)]
pub(crate) enum UserError {
    AlreadyExists,
    NotFound,
    Io(String),
}

/// Shared, mutable user table. `save_in_progress` ensures at most one writer task is ever
/// flushing `.users` to disk at a time; other mutations that land while a save is pending just
/// return, relying on the in-flight save to pick up their change too.
pub(crate) struct UserStore {
    path: PathBuf,
    salt: String,
    users: RwLock<HashMap<String, User>>,
    save_in_progress: Arc<AtomicBool>,
}

impl UserStore {
    /// Loads `.users` from `path`, first creating it with a single default `root` account
    /// (`Aladdin`/`OpenSesame`, matching `original_source/main.cpp`'s bootstrap) if the file
    /// does not exist yet.
    pub(crate) async fn load_or_bootstrap(
        path: PathBuf,
        salt: String,
    ) -> Result<Arc<Self>, UserError> {
        if fs::metadata(&path).await.is_err() {
            let mut hasher = Sha1::new();
            hasher.update(b"OpenSesame");
            hasher.update(salt.as_bytes());
            let hash = BASE64.encode(hasher.finalize());
            let line = format!("Aladdin:{hash}:root\n");
            fs::write(&path, line)
                .await
                .map_err(|e| UserError::Io(e.to_string()))?;
        }
        Self::load(path, salt).await
    }

    /// Loads `.users` from `path`. Duplicate usernames are a fatal startup error.
    pub(crate) async fn load(path: PathBuf, salt: String) -> Result<Arc<Self>, UserError> {
        let text = fs::read_to_string(&path)
            .await
            .map_err(|e| UserError::Io(e.to_string()))?;

        let mut users = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ':');
            let (Some(username), Some(hash), Some(role)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(UserError::Io(format!("malformed .users line: {line}")));
            };
            if users
                .insert(
                    username.to_string(),
                    User {
                        password_hash_b64: hash.to_string(),
                        role: role.to_string(),
                    },
                )
                .is_some()
            {
                return Err(UserError::Io(format!("duplicate username: {username}")));
            }
        }

        Ok(Arc::new(UserStore {
            path,
            salt,
            users: RwLock::new(users),
            save_in_progress: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn hash_password(&self, password: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(password.as_bytes());
        hasher.update(self.salt.as_bytes());
        BASE64.encode(hasher.finalize())
    }

    pub(crate) async fn authenticate(&self, username: &str, password: &str) -> Option<Ticket> {
        let expected = self.hash_password(password);
        let users = self.users.read().await;
        let user = users.get(username)?;
        if user.password_hash_b64 == expected {
            Some(Ticket {
                username: username.to_string(),
                role: user.role.clone(),
            })
        } else {
            None
        }
    }

    pub(crate) async fn create_user(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        role: &str,
    ) -> Result<(), UserError> {
        let hash = self.hash_password(password);
        {
            let mut users = self.users.write().await;
            if users.contains_key(username) {
                return Err(UserError::AlreadyExists);
            }
            users.insert(
                username.to_string(),
                User {
                    password_hash_b64: hash,
                    role: role.to_string(),
                },
            );
        }
        self.schedule_save();
        Ok(())
    }

    pub(crate) async fn delete_user(self: &Arc<Self>, username: &str) -> Result<(), UserError> {
        {
            let mut users = self.users.write().await;
            if users.remove(username).is_none() {
                return Err(UserError::NotFound);
            }
        }
        self.schedule_save();
        Ok(())
    }

    pub(crate) async fn change_password(
        self: &Arc<Self>,
        username: &str,
        new_password: &str,
    ) -> Result<(), UserError> {
        let hash = self.hash_password(new_password);
        {
            let mut users = self.users.write().await;
            let user = users.get_mut(username).ok_or(UserError::NotFound)?;
            user.password_hash_b64 = hash;
        }
        self.schedule_save();
        Ok(())
    }

    pub(crate) async fn change_role(
        self: &Arc<Self>,
        username: &str,
        new_role: &str,
    ) -> Result<(), UserError> {
        {
            let mut users = self.users.write().await;
            let user = users.get_mut(username).ok_or(UserError::NotFound)?;
            user.role = new_role.to_string();
        }
        self.schedule_save();
        Ok(())
    }

    /// Posts a background save task unless one is already in flight. The task itself takes only
    /// a shared lock, so readers (authentication) are never blocked behind a disk write.
    fn schedule_save(self: &Arc<Self>) {
        if self
            .save_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let store = Arc::clone(self);
        tokio::spawn(async move {
            let users = store.users.read().await;
            let mut body = String::new();
            for (username, user) in users.iter() {
                body.push_str(username);
                body.push(':');
                body.push_str(&user.password_hash_b64);
                body.push(':');
                body.push_str(&user.role);
                body.push('\n');
            }
            drop(users);

            if let Err(err) = fs::write(&store.path, body).await {
                tracing::warn!(error = %err, path = %store.path.display(), "failed to persist user store");
            }

            store.save_in_progress.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
impl UserStore {
    /// Builds a throwaway store for tests outside this module (e.g. `dispatch`'s integration
    /// tests) that need an `Arc<UserStore>` but not the on-disk load path.
    pub(crate) fn for_tests(salt: &str, users: Vec<(&str, &str, &str)>) -> Arc<Self> {
        let users = users
            .into_iter()
            .map(|(name, password, role)| {
                let mut hasher = Sha1::new();
                hasher.update(password.as_bytes());
                hasher.update(salt.as_bytes());
                let hash = BASE64.encode(hasher.finalize());
                (
                    name.to_string(),
                    User {
                        password_hash_b64: hash,
                        role: role.to_string(),
                    },
                )
            })
            .collect();
        Arc::new(UserStore {
            path: PathBuf::from("/tmp/does-not-matter.users"),
            salt: salt.to_string(),
            users: RwLock::new(users),
            save_in_progress: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(salt: &str, users: HashMap<String, User>) -> Arc<UserStore> {
        Arc::new(UserStore {
            path: PathBuf::from("/tmp/does-not-matter.users"),
            salt: salt.to_string(),
            users: RwLock::new(users),
            save_in_progress: Arc::new(AtomicBool::new(false)),
        })
    }

    #[tokio::test]
    async fn authenticate_matches_hash() {
        let store = store_with("pepper", HashMap::new());
        let hash = store.hash_password("hunter2");
        store.users.write().await.insert(
            "alice".to_string(),
            User {
                password_hash_b64: hash,
                role: "root".to_string(),
            },
        );

        let ticket = store.authenticate("alice", "hunter2").await.unwrap();
        assert_eq!(ticket.username, "alice");
        assert_eq!(ticket.role, "root");
        assert!(store.authenticate("alice", "wrong").await.is_none());
        assert!(store.authenticate("bob", "hunter2").await.is_none());
    }

    #[tokio::test]
    async fn create_user_rejects_duplicate() {
        let store = store_with("salt", HashMap::new());
        store.create_user("alice", "pw", "user").await.unwrap();
        assert!(matches!(
            store.create_user("alice", "pw2", "user").await,
            Err(UserError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn delete_missing_user_fails() {
        let store = store_with("salt", HashMap::new());
        assert!(matches!(
            store.delete_user("ghost").await,
            Err(UserError::NotFound)
        ));
    }
}

//! Account Directory
//!
//! Registration, credentials, public keys, and the friendship graph. The
//! relay binary runs the in-memory implementation; a persistent backend
//! only needs to implement [`Directory`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("Username '{0}' is already taken")]
    UsernameTaken(String),
    #[error("Email '{0}' is already registered")]
    EmailTaken(String),
    #[error("Invalid or expired verification code")]
    BadCode,
    #[error("Invalid username or password")]
    BadCredentials,
    #[error("Unknown user '{0}'")]
    UnknownUser(String),
    #[error("Already friends with '{0}'")]
    AlreadyFriends(String),
    #[error("Not friends with '{0}'")]
    NotFriends(String),
    #[error("Cannot add yourself as a friend")]
    SelfFriend,
}

/// Delivers verification codes out of band.
pub trait CodeSender: Send + Sync {
    fn send_code(&self, email: &str, code: &str);
}

/// Default sender: logs the code instead of emailing it.
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send_code(&self, email: &str, code: &str) {
        info!("verification code for {email}: {code}");
    }
}

pub trait Directory: Send + Sync {
    /// Generates a verification code for `email` and hands it to the
    /// configured sender.
    fn issue_code(&self, email: &str) -> Result<(), DirectoryError>;
    fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
        code: &str,
        public_key: &str,
    ) -> Result<(), DirectoryError>;
    /// Checks credentials and refreshes the stored public key, since a
    /// client generates its identity in memory and re-publishes it at login.
    fn login(&self, username: &str, password: &str, public_key: &str)
        -> Result<(), DirectoryError>;
    fn public_key_of(&self, username: &str) -> Result<String, DirectoryError>;
    fn are_friends(&self, a: &str, b: &str) -> bool;
    fn friends_of(&self, username: &str) -> Vec<String>;
    fn add_friend(&self, requester: &str, target: &str) -> Result<(), DirectoryError>;
    fn remove_friend(&self, requester: &str, target: &str) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone)]
struct Account {
    password_hash: String,
    email: String,
    public_key: String,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    /// Friendship pairs, stored name-ordered so each edge appears once.
    friendships: HashSet<(String, String)>,
    /// Issued codes, keyed by email.
    codes: HashMap<String, (String, Instant)>,
}

pub struct MemoryDirectory {
    inner: Mutex<Inner>,
    code_ttl: Duration,
    code_sender: Arc<dyn CodeSender>,
}

impl MemoryDirectory {
    pub fn new(code_ttl: Duration) -> Self {
        Self::with_code_sender(code_ttl, Arc::new(LogCodeSender))
    }

    pub fn with_code_sender(code_ttl: Duration, code_sender: Arc<dyn CodeSender>) -> Self {
        MemoryDirectory {
            inner: Mutex::new(Inner::default()),
            code_ttl,
            code_sender,
        }
    }

    /// Inserts an account directly, skipping the verification flow.
    pub fn seed_user(&self, username: &str, password: &str, email: &str, public_key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.accounts.insert(
            username.to_string(),
            Account {
                password_hash: hash_password(password),
                email: email.to_string(),
                public_key: public_key.to_string(),
            },
        );
    }
}

fn hash_password(password: &str) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, password.as_bytes()))
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl Directory for MemoryDirectory {
    fn issue_code(&self, email: &str) -> Result<(), DirectoryError> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        self.inner
            .lock()
            .unwrap()
            .codes
            .insert(email.to_string(), (code.clone(), Instant::now()));
        self.code_sender.send_code(email, &code);
        Ok(())
    }

    fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
        code: &str,
        public_key: &str,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accounts.contains_key(username) {
            return Err(DirectoryError::UsernameTaken(username.to_string()));
        }
        if inner.accounts.values().any(|a| a.email == email) {
            return Err(DirectoryError::EmailTaken(email.to_string()));
        }
        let valid = inner
            .codes
            .get(email)
            .is_some_and(|(issued, at)| issued == code && at.elapsed() < self.code_ttl);
        if !valid {
            return Err(DirectoryError::BadCode);
        }
        inner.codes.remove(email);
        inner.accounts.insert(
            username.to_string(),
            Account {
                password_hash: hash_password(password),
                email: email.to_string(),
                public_key: public_key.to_string(),
            },
        );
        Ok(())
    }

    fn login(
        &self,
        username: &str,
        password: &str,
        public_key: &str,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().unwrap();
        let account = inner
            .accounts
            .get_mut(username)
            .ok_or(DirectoryError::BadCredentials)?;
        if account.password_hash != hash_password(password) {
            return Err(DirectoryError::BadCredentials);
        }
        account.public_key = public_key.to_string();
        Ok(())
    }

    fn public_key_of(&self, username: &str) -> Result<String, DirectoryError> {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .get(username)
            .map(|a| a.public_key.clone())
            .ok_or_else(|| DirectoryError::UnknownUser(username.to_string()))
    }

    fn are_friends(&self, a: &str, b: &str) -> bool {
        self.inner.lock().unwrap().friendships.contains(&pair(a, b))
    }

    fn friends_of(&self, username: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut friends: Vec<String> = inner
            .friendships
            .iter()
            .filter_map(|(a, b)| {
                if a == username {
                    Some(b.clone())
                } else if b == username {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        friends.sort();
        friends
    }

    fn add_friend(&self, requester: &str, target: &str) -> Result<(), DirectoryError> {
        if requester == target {
            return Err(DirectoryError::SelfFriend);
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.accounts.contains_key(target) {
            return Err(DirectoryError::UnknownUser(target.to_string()));
        }
        if !inner.friendships.insert(pair(requester, target)) {
            return Err(DirectoryError::AlreadyFriends(target.to_string()));
        }
        Ok(())
    }

    fn remove_friend(&self, requester: &str, target: &str) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.friendships.remove(&pair(requester, target)) {
            return Err(DirectoryError::NotFriends(target.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CaptureSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl CaptureSender {
        fn new() -> Self {
            CaptureSender {
                sent: Mutex::new(Vec::new()),
            }
        }

        fn last_code(&self) -> String {
            self.sent.lock().unwrap().last().unwrap().1.clone()
        }
    }

    impl CodeSender for CaptureSender {
        fn send_code(&self, email: &str, code: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((email.to_string(), code.to_string()));
        }
    }

    fn directory_with_capture() -> (MemoryDirectory, Arc<CaptureSender>) {
        let sender = Arc::new(CaptureSender::new());
        let directory =
            MemoryDirectory::with_code_sender(Duration::from_secs(600), sender.clone());
        (directory, sender)
    }

    #[test]
    fn test_register_with_issued_code() {
        let (directory, sender) = directory_with_capture();
        directory.issue_code("a@example.com").unwrap();
        let code = sender.last_code();
        assert_eq!(code.len(), 6);

        directory
            .register("alice", "pw", "a@example.com", &code, "PUBKEY")
            .unwrap();
        assert_eq!(directory.public_key_of("alice").unwrap(), "PUBKEY");

        // The email is taken now.
        assert_eq!(
            directory.register("alice2", "pw", "a@example.com", &code, "PK2"),
            Err(DirectoryError::EmailTaken("a@example.com".to_string()))
        );
    }

    #[test]
    fn test_register_rejects_wrong_or_expired_code() {
        let (directory, sender) = directory_with_capture();
        directory.issue_code("a@example.com").unwrap();
        assert_eq!(
            directory.register("alice", "pw", "a@example.com", "000000x", "PK"),
            Err(DirectoryError::BadCode)
        );

        let expired = MemoryDirectory::with_code_sender(Duration::ZERO, sender.clone());
        expired.issue_code("b@example.com").unwrap();
        let code = sender.last_code();
        assert_eq!(
            expired.register("bob", "pw", "b@example.com", &code, "PK"),
            Err(DirectoryError::BadCode)
        );
    }

    #[test]
    fn test_register_rejects_taken_username() {
        let (directory, sender) = directory_with_capture();
        directory.seed_user("alice", "pw", "a@example.com", "PK");
        directory.issue_code("other@example.com").unwrap();
        assert_eq!(
            directory.register("alice", "pw", "other@example.com", &sender.last_code(), "PK"),
            Err(DirectoryError::UsernameTaken("alice".to_string()))
        );
    }

    #[test]
    fn test_login_checks_credentials_and_refreshes_key() {
        let directory = MemoryDirectory::new(Duration::from_secs(600));
        directory.seed_user("alice", "secret", "a@example.com", "OLD_KEY");

        assert_eq!(
            directory.login("alice", "wrong", "NEW_KEY"),
            Err(DirectoryError::BadCredentials)
        );
        assert_eq!(
            directory.login("nobody", "secret", "NEW_KEY"),
            Err(DirectoryError::BadCredentials)
        );
        assert_eq!(directory.public_key_of("alice").unwrap(), "OLD_KEY");

        directory.login("alice", "secret", "NEW_KEY").unwrap();
        assert_eq!(directory.public_key_of("alice").unwrap(), "NEW_KEY");
    }

    #[test]
    fn test_friendship_is_symmetric() {
        let directory = MemoryDirectory::new(Duration::from_secs(600));
        directory.seed_user("alice", "pw", "a@example.com", "PK_A");
        directory.seed_user("bob", "pw", "b@example.com", "PK_B");

        directory.add_friend("alice", "bob").unwrap();
        assert!(directory.are_friends("alice", "bob"));
        assert!(directory.are_friends("bob", "alice"));
        assert_eq!(directory.friends_of("alice"), vec!["bob"]);
        assert_eq!(directory.friends_of("bob"), vec!["alice"]);

        assert_eq!(
            directory.add_friend("bob", "alice"),
            Err(DirectoryError::AlreadyFriends("alice".to_string()))
        );

        directory.remove_friend("bob", "alice").unwrap();
        assert!(!directory.are_friends("alice", "bob"));
        assert_eq!(
            directory.remove_friend("alice", "bob"),
            Err(DirectoryError::NotFriends("bob".to_string()))
        );
    }

    #[test]
    fn test_add_friend_validations() {
        let directory = MemoryDirectory::new(Duration::from_secs(600));
        directory.seed_user("alice", "pw", "a@example.com", "PK_A");
        assert_eq!(
            directory.add_friend("alice", "alice"),
            Err(DirectoryError::SelfFriend)
        );
        assert_eq!(
            directory.add_friend("alice", "ghost"),
            Err(DirectoryError::UnknownUser("ghost".to_string()))
        );
    }

    #[test]
    fn test_password_hashing_is_not_identity() {
        assert_ne!(hash_password("secret"), "secret");
        assert_eq!(hash_password("secret"), hash_password("secret"));
        assert_ne!(hash_password("secret"), hash_password("Secret"));
    }
}

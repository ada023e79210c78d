//! Contact and group directories.
//!
//! Users, their contact lists and group memberships live outside the chat
//! servers. The router only needs to resolve names, check contact links and
//! list group members, so that is all these traits expose.

use async_trait::async_trait;
use dashmap::DashMap;
use parley_protocol::Contact;
use thiserror::Error;
use tracing::debug;

/// Stable user identifier.
pub type UserId = String;

/// A user as known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserProfile {
    pub id: UserId,
    /// Unique display name, also the routing key for live sessions.
    pub username: String,
    pub email: String,
}

impl UserProfile {
    #[must_use]
    pub fn new(id: impl Into<UserId>, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: email.into(),
        }
    }

    /// Public identity as carried in presence envelopes.
    #[must_use]
    pub fn contact(&self) -> Contact {
        Contact {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user {0} not found")]
    UnknownUser(String),

    #[error("group {0} not found")]
    GroupNotFound(String),

    #[error("you are not a member of group {group}")]
    NotGroupMember { group: String, user: UserId },

    /// The backing store could not be reached.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of users and their contact links.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Find a user by username.
    async fn resolve_user(&self, username: &str) -> Result<UserProfile, DirectoryError>;

    /// Whether `a` and `b` are contacts of each other.
    async fn is_contact(&self, a: &str, b: &str) -> Result<bool, DirectoryError>;

    /// Every contact of a user.
    async fn contacts_of(&self, user_id: &str) -> Result<Vec<UserProfile>, DirectoryError>;
}

/// Lookup of group membership.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Members of a group, including the requester.
    ///
    /// Fails with [`DirectoryError::NotGroupMember`] when the requester does
    /// not belong to the group.
    async fn members_of(
        &self,
        group: &str,
        requester: &str,
    ) -> Result<Vec<UserProfile>, DirectoryError>;
}

/// In-process directory seeded at startup.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, UserProfile>,
    by_username: DashMap<String, UserId>,
    contacts: DashMap<UserId, Vec<UserId>>,
    groups: DashMap<String, Vec<UserId>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn add_user(&self, profile: UserProfile) {
        debug!(user = %profile.username, "Directory: user added");
        self.by_username
            .insert(profile.username.clone(), profile.id.clone());
        self.users.insert(profile.id.clone(), profile);
    }

    /// Link two users as contacts of each other.
    ///
    /// # Errors
    ///
    /// Returns an error if either username is unknown.
    pub fn add_contact(&self, a: &str, b: &str) -> Result<(), DirectoryError> {
        let a = self.user_id(a)?;
        let b = self.user_id(b)?;
        self.link(&a, &b);
        self.link(&b, &a);
        Ok(())
    }

    /// Create or replace a group.
    ///
    /// # Errors
    ///
    /// Returns an error if any member username is unknown.
    pub fn add_group<I, S>(&self, name: &str, members: I) -> Result<(), DirectoryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids = Vec::new();
        for member in members {
            let id = self.user_id(member.as_ref())?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        debug!(group = %name, members = ids.len(), "Directory: group added");
        self.groups.insert(name.to_string(), ids);
        Ok(())
    }

    /// Number of known users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn user_id(&self, username: &str) -> Result<UserId, DirectoryError> {
        self.by_username
            .get(username)
            .map(|id| id.value().clone())
            .ok_or_else(|| DirectoryError::UnknownUser(username.to_string()))
    }

    fn link(&self, from: &UserId, to: &UserId) {
        let mut list = self.contacts.entry(from.clone()).or_default();
        if !list.contains(to) {
            list.push(to.clone());
        }
    }

    fn profiles(&self, ids: &[UserId]) -> Vec<UserProfile> {
        ids.iter()
            .filter_map(|id| self.users.get(id).map(|p| p.value().clone()))
            .collect()
    }
}

#[async_trait]
impl ContactDirectory for MemoryDirectory {
    async fn resolve_user(&self, username: &str) -> Result<UserProfile, DirectoryError> {
        let id = self.user_id(username)?;
        self.users
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or_else(|| DirectoryError::UnknownUser(username.to_string()))
    }

    async fn is_contact(&self, a: &str, b: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .contacts
            .get(a)
            .is_some_and(|list| list.iter().any(|id| id == b)))
    }

    async fn contacts_of(&self, user_id: &str) -> Result<Vec<UserProfile>, DirectoryError> {
        let ids = self
            .contacts
            .get(user_id)
            .map(|list| list.value().clone())
            .unwrap_or_default();
        Ok(self.profiles(&ids))
    }
}

#[async_trait]
impl GroupDirectory for MemoryDirectory {
    async fn members_of(
        &self,
        group: &str,
        requester: &str,
    ) -> Result<Vec<UserProfile>, DirectoryError> {
        let ids = self
            .groups
            .get(group)
            .map(|members| members.value().clone())
            .ok_or_else(|| DirectoryError::GroupNotFound(group.to_string()))?;

        if !ids.iter().any(|id| id == requester) {
            return Err(DirectoryError::NotGroupMember {
                group: group.to_string(),
                user: requester.to_string(),
            });
        }
        Ok(self.profiles(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.add_user(UserProfile::new("1", "alice", "alice@example.com"));
        dir.add_user(UserProfile::new("2", "bob", "bob@example.com"));
        dir.add_user(UserProfile::new("3", "carol", "carol@example.com"));
        dir.add_contact("alice", "bob").unwrap();
        dir.add_group("rust", ["alice", "bob", "carol"]).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_contacts_are_symmetric() {
        let dir = seeded();
        assert!(dir.is_contact("1", "2").await.unwrap());
        assert!(dir.is_contact("2", "1").await.unwrap());
        assert!(!dir.is_contact("1", "3").await.unwrap());

        let contacts = dir.contacts_of("2").await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].username, "alice");
        assert!(dir.contacts_of("3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_contact_is_idempotent() {
        let dir = seeded();
        dir.add_contact("bob", "alice").unwrap();
        assert_eq!(dir.contacts_of("1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_user() {
        let dir = seeded();
        assert_eq!(dir.resolve_user("carol").await.unwrap().id, "3");
        assert!(matches!(
            dir.resolve_user("mallory").await,
            Err(DirectoryError::UnknownUser(name)) if name == "mallory"
        ));
    }

    #[tokio::test]
    async fn test_group_membership() {
        let dir = seeded();
        assert_eq!(dir.members_of("rust", "3").await.unwrap().len(), 3);

        dir.add_user(UserProfile::new("4", "dave", "dave@example.com"));
        assert!(matches!(
            dir.members_of("rust", "4").await,
            Err(DirectoryError::NotGroupMember { .. })
        ));
        assert!(matches!(
            dir.members_of("go", "1").await,
            Err(DirectoryError::GroupNotFound(_))
        ));
    }

    #[test]
    fn test_unknown_member_rejected() {
        let dir = seeded();
        assert!(dir.add_group("empty", ["nobody"]).is_err());
        assert!(dir.add_contact("alice", "nobody").is_err());
    }
}

use std::collections::HashSet;

use crate::limits::MAX_LOGIN_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }
}

/// An authenticated caller. The role is fixed at construction; there is no
/// profile to look up later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub login: String,
    pub role: Role,
}

impl Principal {
    pub fn new(login: impl Into<String>, role: Role) -> Self {
        Self {
            login: login.into(),
            role,
        }
    }

    pub fn student(login: impl Into<String>) -> Self {
        Self::new(login, Role::Student)
    }

    pub fn admin(login: impl Into<String>) -> Self {
        Self::new(login, Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners act on their own records; admins on anyone's.
    pub fn may_manage(&self, owner: &str) -> bool {
        self.is_admin() || self.login == owner
    }
}

/// Turns an authenticated login into a principal.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, login: &str) -> Option<Principal>;
}

/// Static directory: listed logins are admins, every other login a student.
#[derive(Debug, Default)]
pub struct Directory {
    admins: HashSet<String>,
}

impl Directory {
    pub fn new(admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    /// Parse a comma-separated admin list, e.g. `CAMPUSD_ADMINS=alice,registrar`.
    pub fn from_admin_list(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        )
    }
}

impl IdentityProvider for Directory {
    fn resolve(&self, login: &str) -> Option<Principal> {
        if login.is_empty() || login.len() > MAX_LOGIN_LEN {
            return None;
        }
        let role = if self.admins.contains(login) {
            Role::Admin
        } else {
            Role::Student
        };
        Some(Principal::new(login, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_list_parsing() {
        let dir = Directory::from_admin_list(" registrar, ,dean ");
        assert!(dir.resolve("registrar").unwrap().is_admin());
        assert!(dir.resolve("dean").unwrap().is_admin());
        assert_eq!(dir.resolve("sam").unwrap().role, Role::Student);
    }

    #[test]
    fn rejects_empty_and_oversized_logins() {
        let dir = Directory::default();
        assert!(dir.resolve("").is_none());
        assert!(dir.resolve(&"x".repeat(MAX_LOGIN_LEN + 1)).is_none());
        assert!(dir.resolve(&"x".repeat(MAX_LOGIN_LEN)).is_some());
    }

    #[test]
    fn manage_rights() {
        let sam = Principal::student("sam");
        let admin = Principal::admin("registrar");
        assert!(sam.may_manage("sam"));
        assert!(!sam.may_manage("kim"));
        assert!(admin.may_manage("kim"));
    }
}

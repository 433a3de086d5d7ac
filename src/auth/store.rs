//! SQLite-backed user store.
//!
//! Tables:
//! - `users`: username, password (credential record), email, name, enabled,
//!   timestamps
//! - `roles`, `permissions`: named grants
//! - `user_roles`, `role_permissions`: many-to-many links
//!
//! All timestamps are Unix epoch milliseconds.

use crate::security::PasswordHasher;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use std::path::Path;
use thiserror::Error;

/// Role granted to every newly created account.
pub const DEFAULT_ROLE: &str = "USER";
/// Role granted to the seeded administrator.
pub const ADMIN_ROLE: &str = "ADMIN";

const MAX_USERNAME_LEN: usize = 50;

/// Seeded permissions: (name, description, resource, action).
const DEFAULT_PERMISSIONS: &[(&str, &str, &str, &str)] = &[
    ("BOARD_READ", "Read board posts", "board", "read"),
    ("BOARD_WRITE", "Create and edit board posts", "board", "write"),
    ("BOARD_DELETE", "Delete board posts", "board", "delete"),
    ("USER_ADMIN", "Manage user accounts", "user", "admin"),
];

/// Seeded role grants: (role, permissions).
const DEFAULT_GRANTS: &[(&str, &[&str])] = &[
    (
        ADMIN_ROLE,
        &["BOARD_READ", "BOARD_WRITE", "BOARD_DELETE", "USER_ADMIN"],
    ),
    (DEFAULT_ROLE, &["BOARD_READ", "BOARD_WRITE"]),
];

/// Seeded accounts: (username, password, email, name, role).
const DEFAULT_USERS: &[(&str, &str, &str, &str, &str)] = &[
    ("admin", "admin123", "admin@example.com", "관리자", ADMIN_ROLE),
    ("user", "user123", "user@example.com", "사용자", DEFAULT_ROLE),
];

/// User store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("Email '{0}' is already registered")]
    EmailTaken(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Account is disabled")]
    Disabled,

    #[error("{0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// A stored account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Credential record (`salt:digest`). Never leaves the server.
    pub password: String,
    pub email: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_login_at: Option<i64>,
}

/// A named permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub name: String,
    pub description: String,
    pub resource: String,
    pub action: String,
}

/// Existence lookup consumed by the authentication filter.
pub trait UserLookup: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;
}

/// SQLite-backed user store.
pub struct UserStore {
    conn: Mutex<rusqlite::Connection>,
    hasher: PasswordHasher,
}

impl UserStore {
    /// Open (or create) the user database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        Self::with_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_login_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS permissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                resource TEXT NOT NULL,
                action TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_roles (
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                PRIMARY KEY (user_id, role_id)
            );

            CREATE TABLE IF NOT EXISTS role_permissions (
                role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
                permission_id INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
                PRIMARY KEY (role_id, permission_id)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            hasher: PasswordHasher::new(),
        })
    }

    // ── Seeding ─────────────────────────────────────────────────────

    /// Create default roles, permissions and the `admin` / `user` accounts
    /// when no users exist yet. Returns whether anything was seeded.
    pub fn seed_defaults(&self) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(false);
        }

        let now = now_millis();
        let tx = conn.transaction()?;

        for role in [ADMIN_ROLE, DEFAULT_ROLE] {
            tx.execute(
                "INSERT OR IGNORE INTO roles (name, description) VALUES (?1, ?2)",
                rusqlite::params![role, format!("{role} role")],
            )?;
        }

        for (name, description, resource, action) in DEFAULT_PERMISSIONS {
            tx.execute(
                "INSERT OR IGNORE INTO permissions (name, description, resource, action)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![name, description, resource, action],
            )?;
        }

        for (role, permissions) in DEFAULT_GRANTS {
            for permission in *permissions {
                tx.execute(
                    "INSERT OR IGNORE INTO role_permissions (role_id, permission_id)
                     SELECT r.id, p.id FROM roles r, permissions p
                     WHERE r.name = ?1 AND p.name = ?2",
                    rusqlite::params![role, permission],
                )?;
            }
        }

        for (username, password, email, name, role) in DEFAULT_USERS {
            tx.execute(
                "INSERT INTO users (username, password, email, name, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                rusqlite::params![username, self.hasher.encode(password), email, name, now],
            )?;
            let user_id = tx.last_insert_rowid();
            grant_role(&tx, user_id, role)?;
        }

        tx.commit()?;
        tracing::info!(users = DEFAULT_USERS.len(), "Seeded default users and roles");
        Ok(true)
    }

    // ── User Management ─────────────────────────────────────────────

    /// Look up a user by username (exact match).
    pub fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        self.find_one("WHERE username = ?1", username)
    }

    /// Look up a user by email.
    pub fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.find_one("WHERE email = ?1", email)
    }

    fn find_one(&self, clause: &str, value: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, username, password, email, name, enabled, created_at, updated_at, last_login_at
             FROM users {clause}"
        );
        let user = conn
            .query_row(&sql, rusqlite::params![value], row_to_user)
            .optional()?;
        Ok(user)
    }

    /// Create an enabled account with the default role.
    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        email: &str,
        name: &str,
    ) -> Result<User, StoreError> {
        let username = username.trim();
        let email = email.trim();
        if username.is_empty() {
            return Err(StoreError::Validation("Username cannot be empty".into()));
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(StoreError::Validation(format!(
                "Username too long (max {MAX_USERNAME_LEN} characters)"
            )));
        }
        if !email.contains('@') {
            return Err(StoreError::Validation("Email address is invalid".into()));
        }

        let encoded = self.hasher.encode(password);
        let now = now_millis();

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1)",
                rusqlite::params![username],
                |row| row.get(0),
            )?;
            if taken {
                return Err(StoreError::UsernameTaken(username.to_string()));
            }
            let email_taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
                rusqlite::params![email],
                |row| row.get(0),
            )?;
            if email_taken {
                return Err(StoreError::EmailTaken(email.to_string()));
            }

            tx.execute(
                "INSERT INTO users (username, password, email, name, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                rusqlite::params![username, encoded, email, name.trim(), now],
            )?;
            let user_id = tx.last_insert_rowid();
            grant_role(&tx, user_id, DEFAULT_ROLE)?;
            tx.commit()?;
        }

        tracing::info!(username = username, "User created");
        self.find_by_username(username)?
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    /// Check a login attempt. Order of checks: existence, password, enabled.
    pub fn verify_credentials(&self, username: &str, password: &str) -> Result<User, StoreError> {
        let user = self
            .find_by_username(username)?
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;

        if !self.hasher.matches(password, &user.password) {
            return Err(StoreError::InvalidPassword);
        }
        if !user.enabled {
            return Err(StoreError::Disabled);
        }
        Ok(user)
    }

    /// Record a successful login.
    pub fn update_last_login(&self, username: &str) -> Result<(), StoreError> {
        let now = now_millis();
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET last_login_at = ?1 WHERE username = ?2",
            rusqlite::params![now, username],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(username.to_string()));
        }
        Ok(())
    }

    /// Replace a user's password after checking the current one.
    pub fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), StoreError> {
        let user = self
            .find_by_username(username)?
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;

        if !self.hasher.matches(old_password, &user.password) {
            return Err(StoreError::InvalidPassword);
        }

        let encoded = self.hasher.encode(new_password);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET password = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![encoded, now_millis(), user.id],
        )?;
        tracing::info!(username = username, "Password changed");
        Ok(())
    }

    /// Enable or disable an account.
    pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET enabled = ?1, updated_at = ?2 WHERE username = ?3",
            rusqlite::params![enabled, now_millis(), username],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(username.to_string()));
        }
        Ok(())
    }

    /// Delete an account. Returns whether a row was removed.
    pub fn delete_user(&self, user_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM users WHERE id = ?1", rusqlite::params![user_id])?;
        Ok(deleted > 0)
    }

    /// Count registered users.
    pub fn user_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    // ── Roles & Permissions ─────────────────────────────────────────

    /// Role names held by a user, sorted.
    pub fn roles_of(&self, username: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.name FROM roles r
             JOIN user_roles ur ON ur.role_id = r.id
             JOIN users u ON u.id = ur.user_id
             WHERE u.username = ?1
             ORDER BY r.name",
        )?;
        let roles = stmt
            .query_map(rusqlite::params![username], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(roles)
    }

    /// Permissions reachable through any of the user's roles, deduplicated.
    pub fn permissions_of(&self, username: &str) -> Result<Vec<Permission>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT p.name, p.description, p.resource, p.action
             FROM permissions p
             JOIN role_permissions rp ON rp.permission_id = p.id
             JOIN user_roles ur ON ur.role_id = rp.role_id
             JOIN users u ON u.id = ur.user_id
             WHERE u.username = ?1
             ORDER BY p.name",
        )?;
        let permissions = stmt
            .query_map(rusqlite::params![username], |row| {
                Ok(Permission {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    resource: row.get(2)?,
                    action: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(permissions)
    }

    pub fn has_role(&self, username: &str, role: &str) -> Result<bool, StoreError> {
        Ok(self.roles_of(username)?.iter().any(|r| r == role))
    }

    pub fn has_permission(&self, username: &str, permission: &str) -> Result<bool, StoreError> {
        Ok(self
            .permissions_of(username)?
            .iter()
            .any(|p| p.name == permission))
    }

    /// Grant an existing role to a user. Idempotent.
    pub fn assign_role(&self, username: &str, role: &str) -> Result<(), StoreError> {
        let user = self
            .find_by_username(username)?
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        let conn = self.conn.lock();
        grant_role(&conn, user.id, role)
    }
}

impl UserLookup for UserStore {
    fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        UserStore::find_by_username(self, username)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn grant_role(conn: &rusqlite::Connection, user_id: i64, role: &str) -> Result<(), StoreError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO user_roles (user_id, role_id)
         SELECT ?1, id FROM roles WHERE name = ?2",
        rusqlite::params![user_id, role],
    )?;
    if inserted == 0 {
        tracing::debug!(user_id, role, "Role missing or already granted");
    }
    Ok(())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        email: row.get(3)?,
        name: row.get(4)?,
        enabled: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        last_login_at: row.get(8)?,
    })
}

/// Current Unix epoch in milliseconds.
fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_store() -> UserStore {
        let store = UserStore::open_in_memory().unwrap();
        assert!(store.seed_defaults().unwrap());
        store
    }

    #[test]
    fn seed_creates_default_accounts_once() {
        let store = seeded_store();
        assert_eq!(store.user_count().unwrap(), 2);
        assert!(!store.seed_defaults().unwrap());
        assert_eq!(store.user_count().unwrap(), 2);
    }

    #[test]
    fn seeded_passwords_verify() {
        let store = seeded_store();
        let admin = store.verify_credentials("admin", "admin123").unwrap();
        assert_eq!(admin.email, "admin@example.com");
        assert!(store.verify_credentials("user", "user123").is_ok());
    }

    #[test]
    fn seeded_roles_and_permissions() {
        let store = seeded_store();
        assert_eq!(store.roles_of("admin").unwrap(), vec![ADMIN_ROLE.to_string()]);
        assert!(store.has_role("user", DEFAULT_ROLE).unwrap());
        assert!(!store.has_role("user", ADMIN_ROLE).unwrap());

        assert!(store.has_permission("admin", "USER_ADMIN").unwrap());
        assert!(store.has_permission("user", "BOARD_READ").unwrap());
        assert!(!store.has_permission("user", "BOARD_DELETE").unwrap());
        assert!(!store.has_permission("ghost", "BOARD_READ").unwrap());
    }

    #[test]
    fn create_user_assigns_default_role() {
        let store = seeded_store();
        let user = store
            .create_user("kim", "password1", "kim@example.com", "Kim")
            .unwrap();

        assert!(user.enabled);
        assert!(user.last_login_at.is_none());
        assert_ne!(user.password, "password1");
        assert_eq!(store.roles_of("kim").unwrap(), vec![DEFAULT_ROLE.to_string()]);
    }

    #[test]
    fn create_user_rejects_duplicates() {
        let store = seeded_store();
        let err = store
            .create_user("admin", "password1", "other@example.com", "Other")
            .unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken(_)));

        let err = store
            .create_user("other", "password1", "admin@example.com", "Other")
            .unwrap_err();
        assert!(matches!(err, StoreError::EmailTaken(_)));
    }

    #[test]
    fn create_user_validates_input() {
        let store = seeded_store();
        assert!(matches!(
            store.create_user("  ", "password1", "a@b.c", "A").unwrap_err(),
            StoreError::Validation(_)
        ));
        assert!(matches!(
            store.create_user("abc", "password1", "no-at-sign", "A").unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    #[test]
    fn verify_credentials_reports_failure_kind() {
        let store = seeded_store();
        assert!(matches!(
            store.verify_credentials("ghost", "x").unwrap_err(),
            StoreError::UserNotFound(_)
        ));
        assert!(matches!(
            store.verify_credentials("admin", "wrong").unwrap_err(),
            StoreError::InvalidPassword
        ));

        store.set_enabled("user", false).unwrap();
        assert!(matches!(
            store.verify_credentials("user", "user123").unwrap_err(),
            StoreError::Disabled
        ));
    }

    #[test]
    fn change_password_requires_old_password() {
        let store = seeded_store();
        assert!(matches!(
            store.change_password("user", "wrong", "newpass1").unwrap_err(),
            StoreError::InvalidPassword
        ));

        store.change_password("user", "user123", "newpass1").unwrap();
        assert!(store.verify_credentials("user", "newpass1").is_ok());
        assert!(store.verify_credentials("user", "user123").is_err());
    }

    #[test]
    fn update_last_login_sets_timestamp() {
        let store = seeded_store();
        store.update_last_login("admin").unwrap();
        let admin = store.find_by_username("admin").unwrap().unwrap();
        assert!(admin.last_login_at.is_some());

        assert!(store.update_last_login("ghost").is_err());
    }

    #[test]
    fn delete_user_cascades_roles() {
        let store = seeded_store();
        let user = store.find_by_username("user").unwrap().unwrap();
        assert!(store.delete_user(user.id).unwrap());
        assert!(!store.delete_user(user.id).unwrap());
        assert!(store.find_by_username("user").unwrap().is_none());
        assert!(store.roles_of("user").unwrap().is_empty());
    }

    #[test]
    fn lookup_trait_delegates() {
        let store = seeded_store();
        let lookup: &dyn UserLookup = &store;
        assert!(lookup.find_by_username("admin").unwrap().is_some());
        assert!(lookup.find_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn find_by_email() {
        let store = seeded_store();
        let user = store.find_by_email("user@example.com").unwrap().unwrap();
        assert_eq!(user.username, "user");
    }

    #[test]
    fn on_disk_store_persists() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("users.db");

        {
            let store = UserStore::open(&db_path).unwrap();
            store.seed_defaults().unwrap();
            store.assign_role("user", ADMIN_ROLE).unwrap();
        }

        let store = UserStore::open(&db_path).unwrap();
        assert_eq!(store.user_count().unwrap(), 2);
        assert!(store.has_role("user", ADMIN_ROLE).unwrap());
    }
}

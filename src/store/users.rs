use anyhow::{Context, Result};
use rusqlite::Row;

use crate::model::User;

use super::Store;

impl Store {
    /// Gets a user by login name.
    pub fn user(&self, login: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, login, secret, admin FROM users WHERE login = ?1")?;
        let mut rows = stmt.query_map([login], row_to_user)?;
        rows.next().transpose().context("cannot query user")
    }

    /// Gets a user by its bearer secret.
    pub fn user_by_secret(&self, secret: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, login, secret, admin FROM users WHERE secret = ?1")?;
        let mut rows = stmt.query_map([secret], row_to_user)?;
        rows.next().transpose().context("cannot query user")
    }

    pub fn users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, login, secret, admin FROM users")?;
        let users = stmt
            .query_map([], row_to_user)?
            .collect::<rusqlite::Result<Vec<User>>>()
            .context("cannot query users")?;
        Ok(users)
    }

    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (login, secret, admin) VALUES (?1, ?2, ?3)",
            rusqlite::params![user.login, user.secret, user.admin],
        )
        .context("cannot insert user")?;
        Ok(())
    }

    pub fn delete_user(&self, login: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM users WHERE login = ?1", [login])
            .context("cannot delete user")?;
        Ok(())
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        login: row.get("login")?,
        secret: row.get("secret")?,
        admin: row.get("admin")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_crud() {
        let store = Store::new_in_memory().unwrap();

        store
            .create_user(&User {
                login: "admin".to_string(),
                secret: "s3cr3t".to_string(),
                admin: true,
                ..Default::default()
            })
            .unwrap();

        let user = store.user("admin").unwrap().unwrap();
        assert!(user.admin);
        assert_eq!("s3cr3t", user.secret);

        let by_secret = store.user_by_secret("s3cr3t").unwrap().unwrap();
        assert_eq!("admin", by_secret.login);
        assert!(store.user_by_secret("wrong").unwrap().is_none());

        assert_eq!(1, store.users().unwrap().len());

        store.delete_user("admin").unwrap();
        assert!(store.user("admin").unwrap().is_none());
    }
}

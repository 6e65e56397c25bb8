//! Requester permission checks

use meshplane_common::{Error, LockingStrength, Result, Store, User};

/// Resolve `user_id` and make sure it belongs to `account_id`
pub fn account_user(store: &dyn Store, account_id: &str, user_id: &str) -> Result<User> {
    let user = store.get_user_by_user_id(LockingStrength::Share, user_id)?;
    if user.account_id != account_id {
        return Err(Error::UserNotPartOfAccount);
    }
    Ok(user)
}

/// Require an admin or service user of the account.
///
/// Regular users are refused every management operation.
pub fn check_account_admin(store: &dyn Store, account_id: &str, user_id: &str) -> Result<User> {
    let user = account_user(store, account_id, user_id)?;
    if user.is_regular_user() {
        return Err(Error::admin_permission());
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::{Account, Database, ErrorKind, UserRole};

    fn db() -> Database {
        let db = Database::open_memory().unwrap();
        db.execute_in_transaction(|tx| {
            for id in ["a", "b"] {
                tx.save_account(
                    LockingStrength::Update,
                    &Account::new(id.into(), "owner".into(), "example.com".into()),
                )?;
            }
            tx.save_user(LockingStrength::Update, &User::new("admin", "a", UserRole::Admin))?;
            tx.save_user(LockingStrength::Update, &User::new("alice", "a", UserRole::User))?;
            let mut svc = User::new("svc", "a", UserRole::User);
            svc.is_service_user = true;
            tx.save_user(LockingStrength::Update, &svc)?;
            tx.save_user(LockingStrength::Update, &User::new("other", "b", UserRole::Admin))
        })
        .unwrap();
        db
    }

    #[test]
    fn test_admin_and_service_users_pass() {
        let db = db();
        db.read(|tx| {
            assert!(check_account_admin(tx, "a", "admin").is_ok());
            assert!(check_account_admin(tx, "a", "svc").is_ok());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rejections() {
        let db = db();
        db.read(|tx| {
            let kind = |user: &str| check_account_admin(tx, "a", user).unwrap_err().kind();
            assert_eq!(kind("alice"), ErrorKind::PermissionDenied);
            assert_eq!(kind("other"), ErrorKind::UserNotPartOfAccount);
            assert_eq!(kind("ghost"), ErrorKind::NotFound);
            Ok(())
        })
        .unwrap();
    }
}

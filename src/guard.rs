//! Ownership guard: a record may only be read or changed by its owner.

use tracing::warn;
use uuid::Uuid;

use crate::error::{ImageVaultError, Result};

/// Records that belong to exactly one user.
pub trait Owned {
    fn owner_id(&self) -> Uuid;
}

/// Succeeds only when `acting_user_id` owns `record`. The error carries no
/// detail beyond "unauthorized".
pub fn authorize<R: Owned>(record: &R, acting_user_id: Uuid) -> Result<()> {
    if record.owner_id() != acting_user_id {
        warn!(%acting_user_id, "ownership check failed");
        return Err(ImageVaultError::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note {
        owner: Uuid,
    }

    impl Owned for Note {
        fn owner_id(&self) -> Uuid {
            self.owner
        }
    }

    #[test]
    fn test_owner_is_authorized() {
        let owner = Uuid::new_v4();
        assert!(authorize(&Note { owner }, owner).is_ok());
    }

    #[test]
    fn test_other_user_is_rejected() {
        let note = Note { owner: Uuid::new_v4() };
        let result = authorize(&note, Uuid::new_v4());
        assert_eq!(result, Err(ImageVaultError::Unauthorized));
    }

    #[test]
    fn test_nil_user_is_rejected() {
        let note = Note { owner: Uuid::new_v4() };
        assert!(authorize(&note, Uuid::nil()).is_err());
    }
}

use parking_lot::RwLock;

/// Answers "who is signed in right now". Authentication itself lives elsewhere.
pub trait AccountProvider: Send + Sync {
    fn current_account(&self) -> Option<String>;
}

/// Account slot flipped by whatever drives sign-in.
#[derive(Debug, Default)]
pub struct SessionAccount {
    current: RwLock<Option<String>>,
}

impl SessionAccount {
    pub fn signed_in(account: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(Some(account.into())),
        }
    }

    pub fn sign_in(&self, account: impl Into<String>) {
        *self.current.write() = Some(account.into());
    }

    pub fn sign_out(&self) {
        self.current.write().take();
    }
}

impl AccountProvider for SessionAccount {
    fn current_account(&self) -> Option<String> {
        self.current.read().clone()
    }
}

//! Cart collaborator. The core only ever asks it to clear a cart once an
//! order is confirmed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::UserId;

use crate::error::CartError;

#[async_trait]
pub trait CartService: Send + Sync {
    async fn clear(&self, user_id: UserId) -> Result<(), CartError>;
}

/// Records which carts were cleared.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartService {
    cleared: Arc<Mutex<Vec<UserId>>>,
    fail: Arc<AtomicBool>,
}

impl InMemoryCartService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn cleared(&self) -> Vec<UserId> {
        self.cleared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn clear(&self, user_id: UserId) -> Result<(), CartError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CartError::Unavailable("cart store offline".to_string()));
        }
        self.cleared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(user_id);
        Ok(())
    }
}

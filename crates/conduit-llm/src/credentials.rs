//! API key pool with round-robin rotation

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use secrecy::SecretString;

/// Ordered pool of API keys with a rotating cursor
///
/// The cursor survives across requests so consecutive requests spread over
/// the pool. `tried` records which keys were given up on during the current
/// request.
#[derive(Debug)]
pub struct CredentialSet {
    keys: Vec<SecretString>,
    current_index: usize,
    tried: HashSet<usize>,
}

impl CredentialSet {
    pub fn new(keys: Vec<SecretString>) -> Self {
        Self {
            keys,
            current_index: 0,
            tried: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub const fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current_key(&self) -> Option<&SecretString> {
        self.keys.get(self.current_index)
    }

    /// Mark the current key as tried and advance the cursor
    pub fn rotate(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        self.tried.insert(self.current_index);
        self.current_index = (self.current_index + 1) % self.keys.len();
    }

    /// True once every key has been rotated away from
    ///
    /// An empty pool has trivially tried everything.
    pub fn has_tried_all(&self) -> bool {
        self.tried.len() >= self.keys.len()
    }

    pub fn tried_count(&self) -> usize {
        self.tried.len()
    }

    /// Forget tried keys without moving the cursor
    pub fn reset_tried(&mut self) {
        self.tried.clear();
    }
}

/// Credential pool shared by every request on one driver
pub type SharedCredentials = Arc<Mutex<CredentialSet>>;

fn lock(credentials: &SharedCredentials) -> MutexGuard<'_, CredentialSet> {
    credentials.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Per-request view over a [`SharedCredentials`] pool
///
/// Guarantees at most one rotation between consecutive attempts: a rotation
/// triggered by a retryable error satisfies the rotation owed by the next
/// attempt.
#[derive(Debug)]
pub struct KeyRotation {
    credentials: SharedCredentials,
    rotate_on_success: bool,
    rotated_since_attempt: bool,
}

impl KeyRotation {
    /// Start a session, clearing the tried set
    pub fn begin(credentials: SharedCredentials, rotate_on_success: bool) -> Self {
        lock(&credentials).reset_tried();
        Self {
            credentials,
            rotate_on_success,
            rotated_since_attempt: false,
        }
    }

    /// Prepare attempt `attempt` (1-based) and return the key it should use
    pub fn on_before_attempt(&mut self, attempt: u32) -> Option<SecretString> {
        let mut set = lock(&self.credentials);
        if attempt > 1 && !self.rotated_since_attempt {
            set.rotate();
            tracing::warn!(
                attempt,
                key_index = set.current_index(),
                keys = set.len(),
                "rotating credential before retry"
            );
        }
        self.rotated_since_attempt = false;
        set.current_key().cloned()
    }

    /// Rotate after an error the next key might not hit
    pub fn on_retryable_error(&mut self) {
        let mut set = lock(&self.credentials);
        if set.len() > 1 {
            tracing::warn!(
                from = set.current_index(),
                keys = set.len(),
                "rotating credential after retryable error"
            );
        }
        set.rotate();
        self.rotated_since_attempt = true;
    }

    pub fn on_success(&mut self) {
        if self.rotate_on_success {
            lock(&self.credentials).rotate();
        }
    }

    pub fn has_tried_all(&self) -> bool {
        lock(&self.credentials).has_tried_all()
    }

    pub fn current_index(&self) -> usize {
        lock(&self.credentials).current_index()
    }
}

//! Identity Store
//!
//! Holds this node's self-assigned identifier and its admission whitelist,
//! persisted through a [`KeyValueStore`]. When a value is not supplied, a
//! [`ValuePrompt`] is asked for one; if that declines too, a fresh id or the
//! wildcard whitelist is used.
//!
//! In-memory values are only replaced after the store accepted the write, so a
//! failing store never leaves the cache and the persisted state disagreeing.

use crate::error::TetherResult;
use crate::store::{KeyValueStore, USER_ID_KEY, WHITELIST_KEY};
use crate::whitelist::{Whitelist, ANYONE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const SELF_ID_QUESTION: &str = "Set your user id";
const WHITELIST_QUESTION: &str =
    "Users allowed to connect to you (comma-separated, use * for anyone)";

static LAST_GENERATED_MS: AtomicU64 = AtomicU64::new(0);

/// Generate a time-derived identifier (hex milliseconds since the epoch)
///
/// Strictly increasing within the process, so two calls in the same
/// millisecond still yield distinct ids.
pub fn generate_self_id() -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let mut last = LAST_GENERATED_MS.load(Ordering::SeqCst);
    loop {
        let next = now_ms.max(last + 1);
        match LAST_GENERATED_MS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return format!("{next:x}"),
            Err(observed) => last = observed,
        }
    }
}

/// Source of values the caller did not pass explicitly
pub trait ValuePrompt: Send + Sync {
    /// Ask for a value; `None` means the user declined
    fn provide(&self, question: &str, default: &str) -> Option<String>;
}

/// Prompt that always declines
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl ValuePrompt for NoPrompt {
    fn provide(&self, _question: &str, _default: &str) -> Option<String> {
        None
    }
}

/// Persisted self id and whitelist
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    prompt: Arc<dyn ValuePrompt>,
    self_id: Option<String>,
    whitelist: Option<Whitelist>,
}

impl IdentityStore {
    /// Create an identity store without interactive prompting
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prompt(store, Arc::new(NoPrompt))
    }

    /// Create an identity store that asks `prompt` for omitted values
    pub fn with_prompt(store: Arc<dyn KeyValueStore>, prompt: Arc<dyn ValuePrompt>) -> Self {
        Self {
            store,
            prompt,
            self_id: None,
            whitelist: None,
        }
    }

    /// Current self id, generating and persisting one on first use
    pub fn self_id(&mut self) -> TetherResult<String> {
        if let Some(id) = &self.self_id {
            return Ok(id.clone());
        }

        let id = match non_empty(self.store.get(USER_ID_KEY)?) {
            Some(stored) => stored,
            None => {
                let generated = generate_self_id();
                self.store.set(USER_ID_KEY, &generated)?;
                info!(self_id = %generated, "Generated new self id");
                generated
            }
        };

        self.self_id = Some(id.clone());
        Ok(id)
    }

    /// Set the self id, asking the prompt when `id` is omitted
    pub fn set_self_id(&mut self, id: Option<&str>) -> TetherResult<String> {
        let id = match non_empty(id.map(str::to_string)) {
            Some(id) => id,
            None => {
                let default = non_empty(self.store.get(USER_ID_KEY)?).unwrap_or_else(generate_self_id);
                non_empty(self.prompt.provide(SELF_ID_QUESTION, &default))
                    .unwrap_or_else(generate_self_id)
            }
        };

        self.store.set(USER_ID_KEY, &id)?;
        debug!(self_id = %id, "Self id updated");
        self.self_id = Some(id.clone());
        Ok(id)
    }

    /// Current whitelist; the wildcard if nothing is stored
    pub fn whitelist(&mut self) -> TetherResult<Whitelist> {
        if let Some(whitelist) = &self.whitelist {
            return Ok(whitelist.clone());
        }

        let whitelist = self
            .store
            .get(WHITELIST_KEY)?
            .as_deref()
            .and_then(Whitelist::parse)
            .unwrap_or_default();

        self.whitelist = Some(whitelist.clone());
        Ok(whitelist)
    }

    /// Set the whitelist from comma-separated input
    ///
    /// An omitted list is asked for through the prompt. Input without any
    /// entries falls back to the stored list, then to the wildcard.
    pub fn set_whitelist(&mut self, list: Option<&str>) -> TetherResult<Whitelist> {
        let whitelist = match list.and_then(Whitelist::parse) {
            Some(whitelist) => whitelist,
            None => {
                let stored = self.store.get(WHITELIST_KEY)?;
                let answer = match list {
                    Some(_) => None,
                    None => self
                        .prompt
                        .provide(WHITELIST_QUESTION, stored.as_deref().unwrap_or(ANYONE)),
                };
                answer
                    .as_deref()
                    .and_then(Whitelist::parse)
                    .or_else(|| stored.as_deref().and_then(Whitelist::parse))
                    .unwrap_or_default()
            }
        };

        self.store.set(WHITELIST_KEY, &whitelist.to_stored())?;
        debug!(whitelist = %whitelist, "Whitelist updated");
        self.whitelist = Some(whitelist.clone());
        Ok(whitelist)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, TetherError};
    use crate::store::MemoryStore;

    struct FixedPrompt(Option<&'static str>);

    impl ValuePrompt for FixedPrompt {
        fn provide(&self, _question: &str, _default: &str) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    #[test]
    fn test_generated_ids_are_monotonic() {
        let a = u64::from_str_radix(&generate_self_id(), 16).unwrap();
        let b = u64::from_str_radix(&generate_self_id(), 16).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_self_id_generated_once_and_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = IdentityStore::new(store.clone());

        let id = identity.self_id().unwrap();
        assert_eq!(identity.self_id().unwrap(), id);
        assert_eq!(store.get(USER_ID_KEY).unwrap(), Some(id.clone()));

        // A restarted process picks the persisted id back up
        let mut restarted = IdentityStore::new(store);
        assert_eq!(restarted.self_id().unwrap(), id);
    }

    #[test]
    fn test_set_self_id_explicit() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = IdentityStore::new(store.clone());

        assert_eq!(identity.set_self_id(Some(" alice ")).unwrap(), "alice");
        assert_eq!(identity.self_id().unwrap(), "alice");
        assert_eq!(store.get(USER_ID_KEY).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_set_self_id_uses_prompt_then_generates() {
        let store = Arc::new(MemoryStore::new());
        let mut prompted = IdentityStore::with_prompt(store.clone(), Arc::new(FixedPrompt(Some("dave"))));
        assert_eq!(prompted.set_self_id(None).unwrap(), "dave");

        let mut declined = IdentityStore::with_prompt(store, Arc::new(FixedPrompt(None)));
        let id = declined.set_self_id(None).unwrap();
        assert_ne!(id, "dave");
        assert!(u64::from_str_radix(&id, 16).is_ok());
    }

    #[test]
    fn test_whitelist_defaults_to_anyone() {
        let mut identity = IdentityStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(identity.whitelist().unwrap(), Whitelist::Anyone);
        assert_eq!(identity.set_whitelist(None).unwrap(), Whitelist::Anyone);
        assert_eq!(identity.set_whitelist(Some("")).unwrap(), Whitelist::Anyone);
    }

    #[test]
    fn test_set_whitelist_normalizes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = IdentityStore::new(store.clone());

        let list = identity.set_whitelist(Some("alice, bob")).unwrap();
        assert_eq!(list, Whitelist::only(["alice", "bob"]));
        assert_eq!(store.get(WHITELIST_KEY).unwrap().as_deref(), Some("alice,bob"));

        // Empty input keeps the stored list
        let list = identity.set_whitelist(Some(" ")).unwrap();
        assert_eq!(list, Whitelist::only(["alice", "bob"]));
    }

    #[test]
    fn test_set_whitelist_from_prompt() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = IdentityStore::with_prompt(store, Arc::new(FixedPrompt(Some("carol"))));
        assert_eq!(identity.set_whitelist(None).unwrap(), Whitelist::only(["carol"]));
    }

    #[test]
    fn test_store_failure_keeps_memory_state() {
        let store = Arc::new(MemoryStore::new());
        let mut identity = IdentityStore::new(store.clone());
        identity.set_self_id(Some("alice")).unwrap();
        identity.set_whitelist(Some("bob")).unwrap();

        store.set_offline(true);
        let err = identity.set_self_id(Some("mallory")).unwrap_err();
        assert!(matches!(err, TetherError::StoreUnavailable(StoreError::Offline)));
        assert!(identity.set_whitelist(Some("*")).is_err());

        assert_eq!(identity.self_id().unwrap(), "alice");
        assert_eq!(identity.whitelist().unwrap(), Whitelist::only(["bob"]));
    }
}

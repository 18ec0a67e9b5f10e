//! Identity commands: whoami, set-id, whitelist

use crate::config::store_path;
use crate::prompt::StdinPrompt;
use anyhow::Result;
use std::sync::Arc;
use tether::{FileStore, IdentityStore, TetherConfig};
use tracing::info;

/// Identity store backed by the configured state file, prompting on stdin
pub fn open_identity(config: &TetherConfig) -> IdentityStore {
    let store = FileStore::new(store_path(config));
    IdentityStore::with_prompt(Arc::new(store), Arc::new(StdinPrompt))
}

/// Print the self id and whitelist
pub fn whoami(config: &TetherConfig) -> Result<()> {
    let mut identity = open_identity(config);
    println!("id:        {}", identity.self_id()?);
    println!("whitelist: {}", identity.whitelist()?);
    Ok(())
}

/// Persist a new self id
pub fn set_id(config: &TetherConfig, id: Option<&str>) -> Result<()> {
    let mut identity = open_identity(config);
    let id = identity.set_self_id(id)?;
    info!(self_id = %id, "Self id saved");
    println!("{id}");
    Ok(())
}

/// Persist a new whitelist
pub fn set_whitelist(config: &TetherConfig, list: Option<&str>) -> Result<()> {
    let mut identity = open_identity(config);
    let whitelist = identity.set_whitelist(list)?;
    info!(whitelist = %whitelist, "Whitelist saved");
    println!("{whitelist}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_persists_in_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = TetherConfig {
            store_path: Some(dir.path().join("state.json")),
            ..TetherConfig::default()
        };

        set_id(&config, Some("alice")).unwrap();
        set_whitelist(&config, Some("bob, carol")).unwrap();

        let mut identity = open_identity(&config);
        assert_eq!(identity.self_id().unwrap(), "alice");
        assert_eq!(identity.whitelist().unwrap().to_stored(), "bob,carol");
    }
}

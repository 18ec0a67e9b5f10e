//! Broker HTTP commands: peers, lobby

use crate::commands::identity::open_identity;
use anyhow::Result;
use tether::{BrokerAddress, BrokerApi, HttpBrokerApi, TetherConfig, TetherError};
use tracing::info;

fn broker_address(config: &TetherConfig) -> Result<BrokerAddress> {
    let address = config
        .broker_address
        .as_deref()
        .ok_or(TetherError::MissingBrokerAddress)?;
    Ok(BrokerAddress::new(address))
}

/// Print the peers visible to this node
pub async fn list_peers(config: &TetherConfig) -> Result<()> {
    let address = broker_address(config)?;
    let self_id = open_identity(config).self_id()?;

    let peers = HttpBrokerApi::new().active_peers(&address, &self_id).await?;
    info!(broker = %address, count = peers.len(), "Fetched active peers");

    if peers.is_empty() {
        println!("No active peers");
    }
    for peer in peers {
        println!("{peer}");
    }
    Ok(())
}

/// Post `message` to the broker lobby and print the acknowledgment
pub async fn post_lobby(config: &TetherConfig, message: &str) -> Result<()> {
    let address = broker_address(config)?;
    let self_id = open_identity(config).self_id()?;

    let ack = HttpBrokerApi::new()
        .post_lobby(&address, &self_id, message)
        .await?;
    println!("{}", serde_json::to_string_pretty(&ack)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_broker_address() {
        let err = list_peers(&TetherConfig::default()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::MissingBrokerAddress)
        ));
    }
}

//! Stub wallet.
//!
//! The payment subsystem is a black box to the overlay; this
//! implementation satisfies the `Wallet` contract with a fixed receiving
//! address and synthesized txids so the proxy flows work end to end.

use orcanet_core::{Result, Wallet};
use rand::RngCore;
use tracing::info;

pub struct StaticWallet {
    address: String,
}

impl StaticWallet {
    pub fn new(address: String) -> Self {
        Self { address }
    }
}

#[async_trait::async_trait]
impl Wallet for StaticWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn pay(&self, amount: f64, destination: &str) -> Result<String> {
        let mut txid = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut txid);
        let txid = hex::encode(txid);
        info!(amount, destination, %txid, "payment broadcast");
        Ok(txid)
    }
}

//! Outbound escrow calls through a signer gateway
//!
//! Keys never live in this process. Each call is posted as a contract
//! execution to an HTTP gateway that signs, broadcasts and answers with the
//! transaction hash once the transaction is included.

use super::{DestinationChain, DestinationLock, Release, SourceChain, TxRef};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    chain_id: u64,
    contract: &'a str,
    msg: &'a Value,
    funds: Vec<Value>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    tx_hash: String,
}

/// HTTP client for one chain's signer gateway
pub struct SignerGateway {
    client: Client,
    base_url: String,
    chain_id: u64,
}

impl SignerGateway {
    pub fn new(base_url: &str, chain_id: u64, timeout: Duration) -> RelayerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayerError::Config(format!("Failed to build gateway client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            chain_id,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Execute `msg` on `contract`.
    ///
    /// Transport failures and 5xx answers are retryable; 4xx answers and
    /// unreadable success bodies are not, since the transaction may already
    /// have been broadcast.
    pub async fn execute(&self, contract: &str, msg: &Value) -> RelayerResult<TxRef> {
        let url = format!("{}/v1/execute", self.base_url);
        let request = ExecuteRequest {
            chain_id: self.chain_id,
            contract,
            msg,
            funds: Vec::new(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayerError::Timeout {
                        operation: format!("gateway execute on chain {}", self.chain_id),
                    }
                } else {
                    RelayerError::ChainUnavailable {
                        chain_id: self.chain_id,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            warn!("Gateway for chain {} answered {}: {}", self.chain_id, status, body);
            return Err(RelayerError::ChainUnavailable {
                chain_id: self.chain_id,
                message: format!("gateway status {}: {}", status, body),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayerError::Submission {
                chain_id: self.chain_id,
                message: format!("gateway status {}: {}", status, body),
            });
        }

        let body: ExecuteResponse = response.json().await.map_err(|e| RelayerError::Submission {
            chain_id: self.chain_id,
            message: format!("unreadable gateway response: {}", e),
        })?;

        debug!("Chain {} executed on {}: {}", self.chain_id, contract, body.tx_hash);
        Ok(body.tx_hash)
    }
}

/// CosmWasm destination: CW20 token plus a hash-time-locked atomic swap contract
pub struct CosmWasmDestination {
    gateway: SignerGateway,
    cw20_contract: String,
    escrow_contract: String,
}

impl CosmWasmDestination {
    pub fn new(gateway: SignerGateway, cw20_contract: String, escrow_contract: String) -> Self {
        Self {
            gateway,
            cw20_contract,
            escrow_contract,
        }
    }

    /// CW20 `send` that funds the escrow and carries its `create` message
    pub fn lock_message(&self, request: &DestinationLock) -> Value {
        let create = json!({
            "create": {
                "id": request.id,
                "hash": hex::encode(request.hashlock.as_bytes()),
                "recipient": request.recipient,
                "expires": { "at_height": request.expiry_height },
            }
        });
        let encoded = base64::engine::general_purpose::STANDARD.encode(create.to_string());

        json!({
            "send": {
                "contract": self.escrow_contract,
                "amount": request.amount.to_string(),
                "msg": encoded,
            }
        })
    }

    pub fn claim_message(request: &Release) -> Value {
        json!({
            "claim": {
                "id": request.id,
                "preimage": hex::encode(request.preimage.as_bytes()),
            }
        })
    }
}

#[async_trait]
impl DestinationChain for CosmWasmDestination {
    fn chain_id(&self) -> u64 {
        self.gateway.chain_id()
    }

    async fn lock(&self, request: &DestinationLock) -> RelayerResult<TxRef> {
        let msg = self.lock_message(request);
        let tx = self.gateway.execute(&self.cw20_contract, &msg).await?;
        info!(
            "Destination escrow created for {} (amount {}, recipient {}): {}",
            request.id, request.amount, request.recipient, tx
        );
        Ok(tx)
    }

    async fn claim(&self, request: &Release) -> RelayerResult<TxRef> {
        let msg = Self::claim_message(request);
        let tx = self.gateway.execute(&self.escrow_contract, &msg).await?;
        info!("Secret revealed on destination for {}: {}", request.id, tx);
        Ok(tx)
    }
}

/// EVM source: withdrawal from the source escrow through the resolver contract
pub struct EvmSourceGateway {
    gateway: SignerGateway,
    resolver_contract: String,
}

impl EvmSourceGateway {
    pub fn new(gateway: SignerGateway, resolver_contract: String) -> Self {
        Self {
            gateway,
            resolver_contract,
        }
    }

    pub fn withdraw_message(request: &Release) -> Value {
        json!({
            "withdraw": {
                "order_hash": request.id,
                "secret": format!("{:?}", request.preimage),
                "recipient": request.recipient,
            }
        })
    }
}

#[async_trait]
impl SourceChain for EvmSourceGateway {
    fn chain_id(&self) -> u64 {
        self.gateway.chain_id()
    }

    async fn withdraw(&self, request: &Release) -> RelayerResult<TxRef> {
        let msg = Self::withdraw_message(request);
        let tx = self.gateway.execute(&self.resolver_contract, &msg).await?;
        info!("Source escrow withdrawn for {}: {}", request.id, tx);
        Ok(tx)
    }
}

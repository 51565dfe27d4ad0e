//! Paymaster web service client.
//!
//! A single `pm_sponsor_userop` call trades a drafted operation (plus the
//! type-0 sponsorship context) for a `paymasterAndData` blob and optional
//! fee overrides. There is no second confirmation round; what comes back
//! is final.

use crate::error::SponsorError;
use crate::jsonrpc::JsonRpcHttp;
use crate::types::{SponsorshipContext, SponsorshipData, UserOperation};
use async_trait::async_trait;
use ethers::types::Address;
use serde_json::Value;

#[async_trait]
pub trait PaymasterSponsor: Send + Sync {
    async fn sponsor_user_operation(
        &self,
        op: &UserOperation,
        ctx: &SponsorshipContext,
    ) -> Result<SponsorshipData, SponsorError>;
}

pub struct HttpPaymasterClient {
    rpc: JsonRpcHttp,
    entry_point: Address,
}

impl HttpPaymasterClient {
    pub fn new(url: String, entry_point: Address) -> Self {
        Self {
            rpc: JsonRpcHttp::new(url),
            entry_point,
        }
    }
}

#[async_trait]
impl PaymasterSponsor for HttpPaymasterClient {
    async fn sponsor_user_operation(
        &self,
        op: &UserOperation,
        ctx: &SponsorshipContext,
    ) -> Result<SponsorshipData, SponsorError> {
        let params = build_sponsor_params(op, self.entry_point, ctx);
        let res = self
            .rpc
            .call("pm_sponsor_userop", params)
            .await
            .map_err(SponsorError::Rpc)?;
        parse_sponsorship(&res)
    }
}

fn build_sponsor_params(
    op: &UserOperation,
    entry_point: Address,
    ctx: &SponsorshipContext,
) -> Value {
    serde_json::json!([op, entry_point, ctx])
}

fn parse_sponsorship(res: &Value) -> Result<SponsorshipData, SponsorError> {
    serde_json::from_value(res.clone()).map_err(|e| SponsorError::Malformed(e.to_string()))
}

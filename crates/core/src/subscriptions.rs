use serde_derive::{Deserialize, Serialize};
use serde_json::{Value, json};
use solana_client::rpc_config::{RpcSignatureSubscribeConfig, RpcTransactionLogsFilter};
use solana_commitment_config::CommitmentConfig;
use solana_pubkey::Pubkey;
use solana_signature::Signature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Encoding {
    Base58,
    Base64,
    #[serde(rename = "base64+zstd")]
    Base64Zstd,
    JsonParsed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAccountSubscribeConfig {
    #[serde(flatten)]
    pub commitment: Option<CommitmentConfig>,
    pub encoding: Option<Encoding>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcProgramSubscribeConfig {
    #[serde(flatten)]
    pub commitment: Option<CommitmentConfig>,
    pub encoding: Option<Encoding>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLogsSubscribeConfig {
    #[serde(flatten)]
    pub commitment: Option<CommitmentConfig>,
}

/// One logical subscription intent: the wire payload needed to (re)establish
/// it plus the canonical key identifying it across connection epochs.
///
/// Two calls producing the same key share a single wire subscription; the
/// key is a deterministic function of method and canonicalized params.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub key: String,
    pub method: &'static str,
    pub unsubscribe_method: &'static str,
    pub params: Value,
}

impl SubscribeRequest {
    pub fn account(pubkey: &Pubkey, config: Option<RpcAccountSubscribeConfig>) -> Self {
        let config = config.unwrap_or_default();
        let params = json!([pubkey.to_string(), &config]);
        let key = format!(
            "acct:{}{}",
            pubkey,
            non_default_suffix(&config, &RpcAccountSubscribeConfig::default(), &params)
        );
        Self {
            key,
            method: "accountSubscribe",
            unsubscribe_method: "accountUnsubscribe",
            params,
        }
    }

    pub fn signature(signature: &Signature, config: Option<RpcSignatureSubscribeConfig>) -> Self {
        let config = config.unwrap_or_default();
        let params = json!([signature.to_string(), &config]);
        let key = format!(
            "sig:{}{}",
            signature,
            non_default_suffix(&config, &RpcSignatureSubscribeConfig::default(), &params)
        );
        Self {
            key,
            method: "signatureSubscribe",
            unsubscribe_method: "signatureUnsubscribe",
            params,
        }
    }

    pub fn logs(filter: RpcTransactionLogsFilter, config: Option<RpcLogsSubscribeConfig>) -> Self {
        let config = config.unwrap_or_default();
        let params = json!([filter, config]);
        // Logs filters have no short canonical form; the key is always a
        // fingerprint of the full params.
        let key = format!("logs:{}", params_fingerprint(&params));
        Self {
            key,
            method: "logsSubscribe",
            unsubscribe_method: "logsUnsubscribe",
            params,
        }
    }

    pub fn program(program_id: &Pubkey, config: Option<RpcProgramSubscribeConfig>) -> Self {
        let config = config.unwrap_or_default();
        let params = json!([program_id.to_string(), &config]);
        let key = format!(
            "prog:{}{}",
            program_id,
            non_default_suffix(&config, &RpcProgramSubscribeConfig::default(), &params)
        );
        Self {
            key,
            method: "programSubscribe",
            unsubscribe_method: "programUnsubscribe",
            params,
        }
    }

    pub fn slot() -> Self {
        Self {
            key: "slot".to_string(),
            method: "slotSubscribe",
            unsubscribe_method: "slotUnsubscribe",
            params: Value::Array(vec![]),
        }
    }
}

fn non_default_suffix<C>(config: &C, default: &C, params: &Value) -> String
where
    C: serde::Serialize,
{
    let configured = serde_json::to_value(config).unwrap_or(Value::Null);
    let baseline = serde_json::to_value(default).unwrap_or(Value::Null);
    if configured == baseline {
        String::new()
    } else {
        format!("#{}", params_fingerprint(params))
    }
}

fn params_fingerprint(params: &Value) -> String {
    let canonical = params.to_string();
    let hash = blake3::hash(canonical.as_bytes());
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use solana_commitment_config::CommitmentLevel;

    use super::*;

    fn pubkey(byte: u8) -> Pubkey {
        Pubkey::new_from_array([byte; 32])
    }

    #[test]
    fn identical_account_requests_share_one_key() {
        let a = SubscribeRequest::account(&pubkey(1), None);
        let b = SubscribeRequest::account(&pubkey(1), None);
        assert_eq!(a.key, b.key);
        assert_eq!(a.key, format!("acct:{}", pubkey(1)));
    }

    #[test]
    fn commitment_changes_the_key() {
        let default = SubscribeRequest::account(&pubkey(2), None);
        let finalized = SubscribeRequest::account(
            &pubkey(2),
            Some(RpcAccountSubscribeConfig {
                commitment: Some(CommitmentConfig {
                    commitment: CommitmentLevel::Finalized,
                }),
                encoding: None,
            }),
        );
        assert_ne!(default.key, finalized.key);
        assert!(finalized.key.starts_with(&format!("acct:{}#", pubkey(2))));
    }

    #[test]
    fn logs_keys_are_fingerprints_and_deterministic() {
        let mentions = RpcTransactionLogsFilter::Mentions(vec![pubkey(3).to_string()]);
        let a = SubscribeRequest::logs(mentions.clone(), None);
        let b = SubscribeRequest::logs(mentions, None);
        let all = SubscribeRequest::logs(RpcTransactionLogsFilter::All, None);
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, all.key);
        assert!(a.key.starts_with("logs:"));
    }

    #[test]
    fn slot_key_is_constant() {
        assert_eq!(SubscribeRequest::slot().key, "slot");
        assert_eq!(SubscribeRequest::slot().method, "slotSubscribe");
    }

    #[test]
    fn unsubscribe_methods_pair_with_subscribe_methods() {
        let request = SubscribeRequest::signature(&Signature::default(), None);
        assert_eq!(request.method, "signatureSubscribe");
        assert_eq!(request.unsubscribe_method, "signatureUnsubscribe");
    }
}

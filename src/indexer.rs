use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use ethers::providers::{Middleware, Provider, StreamExt, Ws};
use ethers::types::{Address, Filter, Log, H256, U256};
use ethers::utils::keccak256;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::LedgerStore;
use crate::models::{EventKind, LedgerEvent};

/// Staking contract event signatures (keccak of these gives topic0).
const DEPOSITED_SIG: &str = "Deposited(address,uint256,uint256)";
const WITHDRAWN_SIG: &str = "Withdrawn(address,uint256,uint256)";

const MAX_SUBSCRIBE_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 60;

/// A log matched against the known event vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub kind: EventKind,
    pub user: Address,
    pub amount: U256,
}

/// Subscribe to the contract's logs and ingest events until the retry budget
/// for the subscription is exhausted.
pub async fn run(config: &Config, store: &mut LedgerStore) -> Result<()> {
    let contract: Address = config
        .contract_address
        .parse()
        .context("invalid contract address")?;

    let mut attempts: u32 = 0;
    loop {
        match stream_logs(&config.rpc_url, contract, store).await {
            Ok(processed) => {
                warn!("log subscription closed after {processed} events");
                if processed > 0 {
                    attempts = 0;
                }
            }
            Err(e) => warn!("log subscription failed: {e:#}"),
        }

        attempts += 1;
        if attempts > MAX_SUBSCRIBE_ATTEMPTS {
            anyhow::bail!("giving up after {MAX_SUBSCRIBE_ATTEMPTS} failed subscription attempts");
        }
        let delay = backoff_delay(attempts);
        info!("resubscribing in {delay:?} (attempt {attempts}/{MAX_SUBSCRIBE_ATTEMPTS})");
        tokio::time::sleep(delay).await;
    }
}

/// One subscription lifetime: connect, stream, process logs sequentially.
/// Returns how many logs were handled before the stream ended.
async fn stream_logs(ws_url: &str, contract: Address, store: &mut LedgerStore) -> Result<u64> {
    let ws = Ws::connect(ws_url)
        .await
        .context("failed to connect to the node")?;
    let provider = Arc::new(Provider::new(ws));

    let filter = Filter::new().address(contract);
    let mut stream = provider
        .subscribe_logs(&filter)
        .await
        .context("failed to subscribe to logs")?;
    info!("listening for events on {contract:#x}");

    let mut processed = 0u64;
    while let Some(log) = stream.next().await {
        if let Err(e) = process_log(&provider, store, &log).await {
            error!("dropping event: {e:#}");
        }
        processed += 1;
    }
    Ok(processed)
}

/// Decode, enrich with the block header time, and persist one log.
async fn process_log<M: Middleware + 'static>(
    provider: &Arc<M>,
    store: &mut LedgerStore,
    log: &Log,
) -> Result<()> {
    let Some(decoded) = decode_event(log) else {
        // Some other event emitted by the same contract; not ours to record.
        debug!("ignoring log with unknown signature in tx {:?}", log.transaction_hash);
        return Ok(());
    };

    let block_number = log.block_number.context("log has no block number")?;
    let tx_hash = log.transaction_hash.context("log has no transaction hash")?;

    let header = provider
        .get_block(block_number)
        .await
        .with_context(|| format!("header fetch for block {block_number} failed"))?
        .with_context(|| format!("no header for block {block_number}"))?;
    let timestamp = Utc
        .timestamp_opt(header.timestamp.low_u64() as i64, 0)
        .single()
        .context("block timestamp out of range")?;

    let event = LedgerEvent {
        user: format!("{:#x}", decoded.user),
        amount: decoded.amount.to_string(),
        kind: decoded.kind,
        block_number: block_number.as_u64(),
        tx_hash: format!("{tx_hash:#x}"),
        timestamp,
    };

    if store.insert(&event).context("failed to store event")? {
        info!(
            "recorded {} of {} by {} (tx {})",
            event.kind.as_str(),
            event.amount,
            event.user,
            event.tx_hash
        );
    } else {
        debug!("duplicate tx {} ignored", event.tx_hash);
    }
    Ok(())
}

fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

/// Known event vocabulary in decode order; the first match wins, so this order
/// must stay fixed when new kinds are added.
fn event_signatures() -> [(EventKind, H256); 2] {
    [
        (EventKind::Deposit, event_topic(DEPOSITED_SIG)),
        (EventKind::Withdraw, event_topic(WITHDRAWN_SIG)),
    ]
}

/// Match a raw log against the staking events, trying Deposit before Withdraw.
pub fn decode_event(log: &Log) -> Option<DecodedEvent> {
    decode_with(&event_signatures(), log)
}

fn decode_with(signatures: &[(EventKind, H256)], log: &Log) -> Option<DecodedEvent> {
    for (kind, topic) in signatures {
        if log.topics.first() == Some(topic) {
            return decode_payload(*kind, log);
        }
    }
    None
}

/// Both events share one layout: topics `[signature, user]`, data starting with
/// the amount word. The contract also emits its own timestamp in the data; the
/// ledger uses the block header time instead.
fn decode_payload(kind: EventKind, log: &Log) -> Option<DecodedEvent> {
    if log.topics.len() < 2 || log.data.len() < 32 {
        return None;
    }
    let user = Address::from_slice(&log.topics[1].as_bytes()[12..]);
    let amount = U256::from_big_endian(&log.data[..32]);
    Some(DecodedEvent { kind, user, amount })
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_secs((1u64 << exp).min(MAX_BACKOFF_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{encode, Token};

    fn user() -> Address {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    fn log_with(topic0: H256, user: Address, amount: U256) -> Log {
        Log {
            topics: vec![topic0, H256::from(user)],
            data: encode(&[Token::Uint(amount), Token::Uint(U256::from(1_700_000_000u64))])
                .into(),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_deposited_logs() {
        let log = log_with(event_topic(DEPOSITED_SIG), user(), U256::from(1234u64));
        let decoded = decode_event(&log).unwrap();
        assert_eq!(decoded.kind, EventKind::Deposit);
        assert_eq!(decoded.user, user());
        assert_eq!(decoded.amount, U256::from(1234u64));
    }

    #[test]
    fn decodes_withdrawn_logs() {
        let log = log_with(event_topic(WITHDRAWN_SIG), user(), U256::from(99u64));
        let decoded = decode_event(&log).unwrap();
        assert_eq!(decoded.kind, EventKind::Withdraw);
        assert_eq!(decoded.amount, U256::from(99u64));
    }

    #[test]
    fn unknown_signatures_are_discarded() {
        let alien = event_topic("Transfer(address,address,uint256)");
        let log = log_with(alien, user(), U256::from(5u64));
        assert!(decode_event(&log).is_none());
    }

    #[test]
    fn deposit_wins_when_both_signatures_match() {
        // Synthetic vocabulary where one topic satisfies both patterns.
        let shared = event_topic(DEPOSITED_SIG);
        let signatures = [
            (EventKind::Deposit, shared),
            (EventKind::Withdraw, shared),
        ];
        let log = log_with(shared, user(), U256::from(1u64));
        let decoded = decode_with(&signatures, &log).unwrap();
        assert_eq!(decoded.kind, EventKind::Deposit);
    }

    #[test]
    fn malformed_payloads_do_not_decode() {
        let mut log = log_with(event_topic(DEPOSITED_SIG), user(), U256::from(1u64));
        log.topics.truncate(1); // user topic missing
        assert!(decode_event(&log).is_none());

        let mut log = log_with(event_topic(DEPOSITED_SIG), user(), U256::from(1u64));
        log.data = vec![0u8; 8].into(); // short of one amount word
        assert!(decode_event(&log).is_none());
    }

    #[test]
    fn decodes_amounts_past_u64_range() {
        let amount = U256::from_dec_str("1000000000000000000000000000000").unwrap();
        let log = log_with(event_topic(DEPOSITED_SIG), user(), amount);
        let decoded = decode_event(&log).unwrap();
        assert_eq!(decoded.amount.to_string(), "1000000000000000000000000000000");
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(MAX_BACKOFF_SECS));
    }
}

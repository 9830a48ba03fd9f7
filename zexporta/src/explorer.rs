//! Block exploration.
//!
//! Given an inclusive block range and the accepted-address snapshot, the
//! explorer fans the per-block RPC calls of each window out concurrently,
//! filters the extracted transfers down to deposits, confirms on-chain
//! success, and resolves token decimals through the write-through cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::try_join_all;

use clients::{Address, BlockNumber, ChainClient, Transfer, UserId};

use crate::error::Error;
use crate::storage::model::{Deposit, DepositStatus};
use crate::storage::{DbRead, DbWrite};

/// Split `[from, to]` (inclusive) into windows of at most `batch_size`
/// blocks. An empty range yields no windows.
pub fn block_batches(
    from: BlockNumber,
    to: BlockNumber,
    batch_size: u64,
) -> Vec<Vec<BlockNumber>> {
    if from > to || batch_size == 0 {
        return Vec::new();
    }

    let mut batches = Vec::new();
    let mut start = from;
    while start <= to {
        let end = to.min(start + batch_size - 1);
        batches.push((start..=end).collect());
        start = end + 1;
    }
    batches
}

/// Token decimals through the cache, calling the chain on a miss and
/// writing the answer through.
pub async fn token_decimals<C, S>(
    client: &C,
    store: &S,
    chain_symbol: &str,
    token: &str,
) -> Result<u8, Error>
where
    C: ChainClient,
    S: DbRead + DbWrite,
{
    if let Some(decimals) = store.token_decimals(chain_symbol, token).await? {
        return Ok(decimals);
    }

    let decimals = client.token_decimals(token).await?;
    store
        .insert_token_decimals(chain_symbol, token, decimals)
        .await?;
    Ok(decimals)
}

/// Keep the transfers destined for an accepted address, confirm each
/// carrying transaction succeeded on-chain, and wrap the survivors into
/// deposits with the given status.
pub async fn accepted_deposits<C, S>(
    client: &C,
    store: &S,
    transfers: Vec<Transfer>,
    accepted: &HashMap<Address, UserId>,
    status: DepositStatus,
    sa_timestamp: Option<u64>,
) -> Result<Vec<Deposit>, Error>
where
    C: ChainClient,
    S: DbRead + DbWrite,
{
    let mut deposits = Vec::new();

    for transfer in transfers {
        let Some(&user_id) = accepted.get(&transfer.to) else {
            continue;
        };

        let decimals =
            token_decimals(client, store, &transfer.chain_symbol, &transfer.token).await?;

        if !client.is_successful(&transfer.tx_hash).await? {
            tracing::debug!(tx_hash = %transfer.tx_hash, "dropping failed transaction");
            continue;
        }

        deposits.push(Deposit {
            transfer,
            user_id,
            decimals,
            status,
            sa_timestamp,
        });
    }

    Ok(deposits)
}

/// Explore `[from, to]` and return the PENDING deposits those blocks
/// contain.
///
/// Windows run sequentially; within a window the per-block extraction
/// calls run concurrently, and each window's wall-clock is stretched to
/// at least `delay` as backpressure against the RPC endpoint.
pub async fn explore<C, S>(
    client: &C,
    store: &S,
    from: BlockNumber,
    to: BlockNumber,
    accepted: &HashMap<Address, UserId>,
    batch_size: u64,
    delay: Duration,
) -> Result<Vec<Deposit>, Error>
where
    C: ChainClient,
    S: DbRead + DbWrite,
{
    let mut deposits = Vec::new();

    for window in block_batches(from, to, batch_size) {
        tracing::info!(?window, "exploring block window");
        let started = Instant::now();

        let extracted = try_join_all(
            window
                .iter()
                .map(|&block| client.extract_transfers(block)),
        )
        .await?;
        let transfers: Vec<Transfer> = extracted.into_iter().flatten().collect();

        let mut window_deposits = accepted_deposits(
            client,
            store,
            transfers,
            accepted,
            DepositStatus::Pending,
            None,
        )
        .await?;
        deposits.append(&mut window_deposits);

        if let Some(remaining) = delay.checked_sub(started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
    }

    Ok(deposits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Store;
    use crate::testing::{transfer, MockChain};
    use test_case::test_case;

    #[test_case(3000, 3000, 5, vec![vec![3000]]; "single block")]
    #[test_case(2990, 3000, 5, vec![
        (2990..=2994).collect(),
        (2995..=2999).collect(),
        vec![3000],
    ]; "uneven tail")]
    #[test_case(3001, 3000, 5, Vec::new(); "inverted range")]
    fn block_batches_cover_the_range(
        from: u64,
        to: u64,
        batch: u64,
        expected: Vec<Vec<u64>>,
    ) {
        assert_eq!(block_batches(from, to, batch), expected);
    }

    #[tokio::test]
    async fn keeps_only_accepted_and_successful_transfers() {
        let mut chain = MockChain::new("SEP", 101, 100);
        chain.add_transfer(transfer("SEP", "0x01", "0xAAA", 100));
        chain.add_transfer(transfer("SEP", "0x02", "0xBBB", 100));
        chain.add_transfer(transfer("SEP", "0x03", "0xAAA", 100));
        chain.failed.insert("0x03".to_owned());
        chain.decimals.insert(
            "0x0000000000000000000000000000000000000001".to_owned(),
            6,
        );

        let store = Store::new_shared();
        let accepted = HashMap::from([("0xAAA".to_owned(), 7u64)]);

        let deposits = explore(&chain, &store, 100, 100, &accepted, 5, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].transfer.tx_hash, "0x01");
        assert_eq!(deposits[0].user_id, 7);
        assert_eq!(deposits[0].decimals, 6);
        assert_eq!(deposits[0].status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn decimal_lookups_write_through_the_cache() {
        let mut chain = MockChain::new("SEP", 10, 9);
        chain.decimals.insert("0xTOKEN".to_owned(), 9);

        let store = Store::new_shared();
        assert_eq!(
            token_decimals(&chain, &store, "SEP", "0xTOKEN").await.unwrap(),
            9
        );

        // A second lookup is served from the cache even if the chain's
        // answer changes.
        chain.decimals.insert("0xTOKEN".to_owned(), 12);
        assert_eq!(
            token_decimals(&chain, &store, "SEP", "0xTOKEN").await.unwrap(),
            9
        );
    }
}

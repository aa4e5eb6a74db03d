//! Token transfer indexing.
//!
//! Each [`TransferRecord`] moves `amount` from one account to another. A
//! batch first defers every account it touches, so the first resolution
//! loads all of them with a single bulk read. Unknown accounts are created,
//! known ones have their balance replaced with an upsert, and every transfer
//! is inserted with foreign keys to both accounts.

use std::collections::{BTreeMap, BTreeSet};

use relcache_core::{CacheStore, Deferred, EntityStore};
use relcache_types::{
    ColumnKind, Entity, EntityId, EntityName, EntitySchema, SchemaError, SchemaRegistry, Value,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::error::ProcessorError;
use crate::processor::BatchHandler;

/// Entity type of account rows.
pub const ACCOUNT: &str = "Account";

/// Entity type of transfer rows.
pub const TRANSFER: &str = "Transfer";

/// One line of transfer input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferRecord {
    /// Unique transfer id.
    pub id: String,
    /// Block the transfer was included in.
    pub block: i64,
    /// Sending account.
    pub from: String,
    /// Receiving account.
    pub to: String,
    /// Amount moved.
    pub amount: Decimal,
}

/// Built-in schema used when the configuration declares none.
pub fn schema() -> Result<SchemaRegistry, SchemaError> {
    SchemaRegistry::from_entities([
        EntitySchema::new(ACCOUNT)
            .table("accounts")
            .column("balance", ColumnKind::Numeric)
            .column("last_block", ColumnKind::Int)
            .to_many("outgoing", TRANSFER, "from"),
        EntitySchema::new(TRANSFER)
            .table("transfers")
            .column("block", ColumnKind::Int)
            .column("amount", ColumnKind::Numeric)
            .to_one("from", ACCOUNT)
            .to_one("to", ACCOUNT),
    ])
}

#[derive(Debug)]
struct AccountState {
    balance: Decimal,
    last_block: i64,
    known: bool,
}

/// Applies transfers to account balances.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferHandler;

impl BatchHandler for TransferHandler {
    type Record = TransferRecord;

    async fn handle<S: EntityStore>(
        &self,
        session: &mut CacheStore<S>,
        records: &[TransferRecord],
    ) -> Result<(), ProcessorError> {
        let account = EntityName::from(ACCOUNT);
        let transfer = EntityName::from(TRANSFER);

        let mut handles: BTreeMap<&str, Deferred> = BTreeMap::new();
        for record in records {
            for address in [record.from.as_str(), record.to.as_str()] {
                if !handles.contains_key(address) {
                    handles.insert(address, session.defer(&account, address, None)?);
                }
            }
        }

        let mut accounts: BTreeMap<&str, AccountState> = BTreeMap::new();
        for (address, handle) in &handles {
            let state = match handle.get(session).await? {
                Some(row) => AccountState {
                    balance: decimal_field(&row, "balance"),
                    last_block: int_field(&row, "last_block"),
                    known: true,
                },
                None => AccountState {
                    balance: Decimal::ZERO,
                    last_block: 0,
                    known: false,
                },
            };
            accounts.insert(*address, state);
        }

        let mut touched = BTreeSet::new();
        for record in records {
            apply(&mut accounts, record.from.as_str(), record.block, |balance| {
                balance.checked_sub(record.amount)
            })?;
            apply(&mut accounts, record.to.as_str(), record.block, |balance| {
                balance.checked_add(record.amount)
            })?;
            touched.insert(record.from.as_str());
            touched.insert(record.to.as_str());
        }

        let mut created = Vec::new();
        let mut updated = Vec::new();
        for (address, state) in &accounts {
            if !touched.contains(address) {
                continue;
            }
            let row = Entity::new(*address)
                .with("balance", state.balance)
                .with("last_block", state.last_block);
            if state.known {
                updated.push(row);
            } else {
                created.push(row);
            }
        }
        debug!(
            created = created.len(),
            updated = updated.len(),
            transfers = records.len(),
            "Applied transfers"
        );
        session.insert(&account, created)?;
        session.upsert(&account, updated)?;

        session.insert(
            &transfer,
            records.iter().map(|record| {
                Entity::new(record.id.as_str())
                    .with("block", record.block)
                    .with("amount", record.amount)
                    .with("from", EntityId::from(record.from.as_str()))
                    .with("to", EntityId::from(record.to.as_str()))
            }),
        )?;
        Ok(())
    }
}

fn apply(
    accounts: &mut BTreeMap<&str, AccountState>,
    address: &str,
    block: i64,
    change: impl FnOnce(Decimal) -> Option<Decimal>,
) -> Result<(), ProcessorError> {
    let state = accounts
        .get_mut(address)
        .ok_or_else(|| ProcessorError::UnresolvedAccount {
            account: address.to_owned(),
        })?;
    state.balance = change(state.balance).ok_or_else(|| ProcessorError::Overflow {
        account: address.to_owned(),
    })?;
    state.last_block = state.last_block.max(block);
    Ok(())
}

fn decimal_field(row: &Entity, field: &str) -> Decimal {
    match row.get(field) {
        Some(Value::Numeric(value)) => *value,
        Some(Value::Int(value)) => Decimal::from(*value),
        _ => Decimal::ZERO,
    }
}

fn int_field(row: &Entity, field: &str) -> i64 {
    match row.get(field) {
        Some(Value::Int(value)) => *value,
        _ => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use relcache_core::{Catalog, MemoryStore, StoreCall};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::processor::run_session;

    fn session() -> CacheStore<MemoryStore> {
        let catalog = Arc::new(Catalog::new(schema().unwrap()));
        CacheStore::new(MemoryStore::new(Arc::clone(&catalog)), catalog)
    }

    fn record(id: &str, block: i64, from: &str, to: &str, amount: Decimal) -> TransferRecord {
        TransferRecord {
            id: id.to_owned(),
            block,
            from: from.to_owned(),
            to: to.to_owned(),
            amount,
        }
    }

    fn balance(row: Option<Entity>) -> Option<Value> {
        row.and_then(|row| row.get("balance").cloned())
    }

    #[test]
    fn records_parse_from_json() {
        let line = r#"{"id":"t1","block":7,"from":"0xabc","to":"0xdef","amount":"2.5"}"#;
        let parsed: TransferRecord = serde_json::from_str(line).unwrap();
        assert_eq!(parsed, record("t1", 7, "0xabc", "0xdef", dec!(2.5)));
    }

    #[tokio::test]
    async fn batch_reads_accounts_once_and_writes_in_order() {
        let mut session = session();
        session
            .store()
            .seed(
                &EntityName::from(ACCOUNT),
                [Entity::new("0xabc").with("balance", dec!(10)).with("last_block", 1_i64)],
            )
            .await;

        let records = [
            record("t1", 5, "0xabc", "0xdef", dec!(4)),
            record("t2", 6, "0xdef", "0x123", dec!(1)),
        ];
        run_session(&TransferHandler, &mut session, &records).await.unwrap();

        let calls = session.store().calls().await;
        let kinds: Vec<(&str, bool)> = calls
            .iter()
            .map(|call| (call.entity().as_str(), call.is_read()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ACCOUNT, true),
                (ACCOUNT, false),
                (ACCOUNT, false),
                (TRANSFER, false),
            ]
        );
        assert_eq!(
            calls.first(),
            Some(&StoreCall::FindByIds {
                entity: EntityName::from(ACCOUNT),
                ids: vec!["0x123".into(), "0xabc".into(), "0xdef".into()],
            })
        );

        let store = session.store();
        let account = EntityName::from(ACCOUNT);
        for (id, expected) in [("0xabc", dec!(6)), ("0xdef", dec!(3)), ("0x123", dec!(1))] {
            let row = store.row(&account, &EntityId::from(id)).await;
            assert_eq!(balance(row), Some(Value::Numeric(expected)), "{id}");
        }
        assert_eq!(store.row_count(&EntityName::from(TRANSFER)).await, 2);
    }

    #[tokio::test]
    async fn later_batches_see_committed_accounts() {
        let mut session = session();
        run_session(
            &TransferHandler,
            &mut session,
            &[record("t1", 1, "0xabc", "0xdef", dec!(2))],
        )
        .await
        .unwrap();

        let catalog = Arc::clone(session.catalog());
        let mut next = CacheStore::new(session.into_inner(), catalog);
        run_session(
            &TransferHandler,
            &mut next,
            &[record("t2", 2, "0xdef", "0xabc", dec!(5))],
        )
        .await
        .unwrap();

        let row = next
            .get(&EntityName::from(ACCOUNT), &EntityId::from("0xdef"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.get("balance"), Some(&Value::Numeric(dec!(-3))));
        assert_eq!(row.get("last_block"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn repeated_transfer_ids_are_rejected() {
        let mut session = session();
        let records = [
            record("t1", 1, "0xabc", "0xdef", dec!(1)),
            record("t1", 1, "0xabc", "0xdef", dec!(1)),
        ];
        let err = run_session(&TransferHandler, &mut session, &records)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Cache { ref source } if source.is_contract_violation()));
        assert_eq!(session.store().row_count(&EntityName::from(TRANSFER)).await, 0);
    }

    #[test]
    fn missing_and_overflowing_accounts_are_distinct_errors() {
        let mut accounts = BTreeMap::new();
        let err = apply(&mut accounts, "0xnone", 1, |b| b.checked_add(dec!(1))).unwrap_err();
        assert!(matches!(err, ProcessorError::UnresolvedAccount { account } if account == "0xnone"));

        accounts.insert(
            "0xfull",
            AccountState {
                balance: Decimal::MAX,
                last_block: 0,
                known: true,
            },
        );
        let err = apply(&mut accounts, "0xfull", 1, |b| b.checked_add(dec!(1))).unwrap_err();
        assert!(matches!(err, ProcessorError::Overflow { account } if account == "0xfull"));
    }
}

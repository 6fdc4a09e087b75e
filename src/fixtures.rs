use walletd_core::{AccountId, JournalKind, LedgerStore, NewJournalEntry, StorageError};

use crate::config::AccountFixture;

/// Creates the fixture accounts that do not exist yet. A fixture balance is
/// booked as an opening deposit so the journal sums to the balance. Existing
/// accounts keep their current balance. Returns how many accounts were
/// created.
pub fn provision_accounts(
    store: &dyn LedgerStore,
    fixtures: &[AccountFixture],
) -> Result<usize, StorageError> {
    let mut created = 0;
    for fixture in fixtures {
        let account = match store.find_account(&fixture.username)? {
            Some(account) => {
                // Created by an earlier start that failed before its opening deposit.
                let unfunded = account.balance == 0.0 && store.history(account.id)?.is_empty();
                if !unfunded {
                    tracing::debug!(username = %fixture.username, "Account already provisioned");
                    continue;
                }
                account
            }
            None => match store.create_account(&fixture.username, 0.0) {
                Ok(account) => {
                    created += 1;
                    account
                }
                // Another instance provisioned it between the check and the insert.
                Err(StorageError::AccountExists(_)) => continue,
                Err(e) => return Err(e),
            },
        };

        if fixture.balance > 0.0 && !opening_deposit(store, account.id, fixture.balance)? {
            continue;
        }
        tracing::info!(
            username = %account.username,
            id = account.id,
            balance = fixture.balance,
            "Provisioned account"
        );
    }
    Ok(created)
}

/// Credits the opening balance and journals it in one unit of work. Returns
/// false if the account was funded concurrently.
fn opening_deposit(
    store: &dyn LedgerStore,
    id: AccountId,
    amount: f64,
) -> Result<bool, StorageError> {
    let mut uow = store.begin()?;
    match uow.lock_account(id)? {
        Some(account) if account.balance == 0.0 => {}
        _ => {
            uow.rollback()?;
            return Ok(false);
        }
    }
    uow.credit(id, amount)?;
    uow.append_journal(&NewJournalEntry {
        account_id: id,
        amount,
        kind: JournalKind::Deposit,
    })?;
    uow.commit()?;
    Ok(true)
}

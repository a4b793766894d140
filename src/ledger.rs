use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::store;
use crate::transport::UserId;

/// The economy ledger the games debit and credit. The real economy cog is
/// out of scope; this is its contract.
pub trait Bank: Send + Sync {
    fn account_exists(&self, user: &UserId) -> bool;
    fn balance(&self, user: &UserId) -> i64;
    fn can_spend(&self, user: &UserId, amount: i64) -> bool;
    fn open_account(&self, user: &UserId) -> Result<()>;
    fn deposit(&self, user: &UserId, amount: i64) -> Result<()>;
    fn withdraw(&self, user: &UserId, amount: i64) -> Result<()>;
    fn transfer(&self, from: &UserId, to: &UserId, amount: i64) -> Result<()>;
    fn set_balance(&self, user: &UserId, amount: i64) -> Result<()>;
}

/// File-backed ledger. Whole-document rewrite after every mutation, same as
/// the game saves.
pub struct JsonBank {
    path: PathBuf,
    accounts: Mutex<HashMap<UserId, i64>>,
}

impl JsonBank {
    pub fn new(path: PathBuf) -> Result<Self> {
        let accounts = store::load_or_default(&path, HashMap::new)?;
        Ok(JsonBank {
            path,
            accounts: Mutex::new(accounts),
        })
    }

    fn persist(&self, accounts: &HashMap<UserId, i64>) -> Result<()> {
        store::save(&self.path, accounts)
    }
}

impl Bank for JsonBank {
    fn account_exists(&self, user: &UserId) -> bool {
        self.accounts.lock().unwrap().contains_key(user)
    }

    fn balance(&self, user: &UserId) -> i64 {
        self.accounts.lock().unwrap().get(user).copied().unwrap_or(0)
    }

    fn can_spend(&self, user: &UserId, amount: i64) -> bool {
        self.balance(user) >= amount
    }

    fn open_account(&self, user: &UserId) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.entry(user.clone()).or_insert(0);
        self.persist(&accounts)
    }

    fn deposit(&self, user: &UserId, amount: i64) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        let balance = accounts
            .get_mut(user)
            .ok_or_else(|| anyhow!("no account for {}", user))?;
        *balance += amount;
        self.persist(&accounts)
    }

    fn withdraw(&self, user: &UserId, amount: i64) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        let balance = accounts
            .get_mut(user)
            .ok_or_else(|| anyhow!("no account for {}", user))?;
        if *balance < amount {
            return Err(anyhow!("insufficient funds for {}", user));
        }
        *balance -= amount;
        self.persist(&accounts)
    }

    fn transfer(&self, from: &UserId, to: &UserId, amount: i64) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        let from_balance = accounts
            .get(from)
            .copied()
            .ok_or_else(|| anyhow!("no account for {}", from))?;
        if from_balance < amount {
            return Err(anyhow!("insufficient funds for {}", from));
        }
        if !accounts.contains_key(to) {
            return Err(anyhow!("no account for {}", to));
        }
        *accounts.get_mut(from).unwrap() -= amount;
        *accounts.get_mut(to).unwrap() += amount;
        self.persist(&accounts)
    }

    fn set_balance(&self, user: &UserId, amount: i64) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.insert(user.clone(), amount);
        self.persist(&accounts)
    }
}

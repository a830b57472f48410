use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::errors::ApiError;

pub const INVALID_REQUEST_FORMAT_MESSAGE: &str = "Invalid request format";
pub const NON_POSITIVE_AMOUNT_MESSAGE: &str = "Amount must be positive";
pub const BLANK_DESCRIPTION_MESSAGE: &str = "Description must not be null or empty";
pub const INVALID_TYPE_MESSAGE: &str = "Invalid transaction type. Must be either EXPENSE or REVENUE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Expense,
    Revenue,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expense => "EXPENSE",
            Self::Revenue => "REVENUE",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "EXPENSE" => Ok(Self::Expense),
            "REVENUE" => Ok(Self::Revenue),
            _ => Err(ApiError::invalid_request(INVALID_TYPE_MESSAGE)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub amount: Number,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
}

/// A validated create request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub amount: Number,
    pub description: String,
    pub kind: TransactionType,
}

#[derive(Debug, Deserialize)]
struct CreateTransactionBody {
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl NewTransaction {
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let raw: CreateTransactionBody = serde_json::from_slice(body)
            .map_err(|_| ApiError::invalid_request(INVALID_REQUEST_FORMAT_MESSAGE))?;

        let amount = match raw.amount {
            Some(Value::Number(amount)) if amount.as_f64().is_some_and(|value| value > 0.0) => {
                amount
            }
            _ => return Err(ApiError::invalid_request(NON_POSITIVE_AMOUNT_MESSAGE)),
        };

        let description = match raw.description {
            Some(description) if !description.trim().is_empty() => description,
            _ => return Err(ApiError::invalid_request(BLANK_DESCRIPTION_MESSAGE)),
        };

        let kind = raw
            .kind
            .as_deref()
            .ok_or_else(|| ApiError::invalid_request(INVALID_TYPE_MESSAGE))?
            .parse::<TransactionType>()?;

        Ok(Self {
            amount,
            description,
            kind,
        })
    }
}

/// In-memory transaction repository; listing preserves insertion order.
#[derive(Debug, Default)]
pub struct LedgerDomain {
    transactions: Vec<Transaction>,
}

impl LedgerDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, request: NewTransaction) -> Transaction {
        let transaction = Transaction {
            id: Uuid::new_v4(),
            date: Utc::now(),
            amount: request.amount,
            description: request.description,
            kind: request.kind,
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    pub fn all(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }
}

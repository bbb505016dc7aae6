//! Secondary protocol: brokerage accounts and operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Date, DateTimeMilliOffset, encode};
use crate::invest::InvestExchange;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InvestAmount {
    pub currency: String,
    pub value:    f64,
}

// ─── operations/types ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct InvestOperationTypesIn;

impl InvestExchange for InvestOperationTypesIn {
    type Out = InvestOperationTypes;
    fn path(&self) -> &'static str { "/invest-gw/ca-operations/api/v1/operations/types" }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvestOperationType {
    pub category:       String,
    pub operation_name: String,
    pub operation_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvestOperationTypes {
    pub operations_types: Vec<InvestOperationType>,
}

// ─── portfolios/accounts ──────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct InvestAccountsIn {
    pub currency: String,
}

impl InvestAccountsIn {
    pub fn new(currency: impl Into<String>) -> Self {
        Self { currency: currency.into() }
    }
}

impl InvestExchange for InvestAccountsIn {
    type Out = InvestAccounts;
    fn path(&self) -> &'static str { "/invest-gw/invest-portfolio/portfolios/accounts" }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvestTotals {
    pub expected_yield:          InvestAmount,
    pub expected_yield_relative: f64,
    pub expected_yield_per_day:  InvestAmount,
    pub total_amount:            InvestAmount,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestAccount {
    pub broker_account_id:   String,
    #[serde(default)]
    pub broker_account_type: String,
    #[serde(default)]
    pub name:                String,
    #[serde(default)]
    pub status:              String,
    #[serde(default)]
    pub organization:        String,
    #[serde(default)]
    pub is_visible:          bool,
    pub opened_date:         Option<Date>,
    #[serde(flatten)]
    pub totals:              InvestTotals,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InvestAccountList {
    pub count: usize,
    pub list:  Vec<InvestAccount>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InvestAccounts {
    pub accounts: InvestAccountList,
    pub totals:   InvestTotals,
}

// ─── user/operations ──────────────────────────────────────────────────────────

/// One page of brokerage operations. Follow `next_cursor` via `cursor`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestOperationsIn {
    #[serde(serialize_with = "encode::opt_utc_millis", skip_serializing_if = "Option::is_none")]
    pub from:                Option<DateTime<Utc>>,
    #[serde(serialize_with = "encode::opt_utc_millis", skip_serializing_if = "Option::is_none")]
    pub to:                  Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_account_id:   Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overnights_disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit:               Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor:              Option<String>,
}

impl InvestExchange for InvestOperationsIn {
    type Out = InvestOperations;
    fn path(&self) -> &'static str { "/invest-gw/ca-operations/api/v1/user/operations" }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub date:     DateTimeMilliOffset,
    #[serde(default)]
    pub num:      String,
    #[serde(default)]
    pub price:    InvestAmount,
    #[serde(default)]
    pub quantity: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TradesInfo {
    pub trades:      Vec<Trade>,
    pub trades_size: usize,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestOperation {
    pub id:                String,
    pub date:              DateTimeMilliOffset,
    #[serde(rename = "type", default)]
    pub kind:              String,
    #[serde(default)]
    pub status:            String,
    #[serde(default)]
    pub description:       String,
    #[serde(default)]
    pub broker_account_id: String,
    #[serde(default)]
    pub account_name:      String,
    #[serde(default)]
    pub instrument_type:   String,
    #[serde(default)]
    pub ticker:            String,
    #[serde(default)]
    pub isin:              String,
    #[serde(default)]
    pub name:              String,
    #[serde(default)]
    pub payment:           InvestAmount,
    pub price:             Option<InvestAmount>,
    #[serde(default)]
    pub quantity:          i64,
    pub trades_info:       Option<TradesInfo>,
    #[serde(default)]
    pub cursor:            String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvestOperations {
    pub has_next:    bool,
    pub items:       Vec<InvestOperation>,
    pub next_cursor: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn operations_query_formats_utc_millis() {
        let q = InvestOperationsIn {
            from:  Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            limit: Some(50),
            ..Default::default()
        };
        assert_eq!(
            serde_urlencoded::to_string(&q).unwrap(),
            "from=2024-01-01T00%3A00%3A00.000Z&limit=50",
        );
    }

    #[test]
    fn accounts_flatten_totals() {
        let out: InvestAccounts = serde_json::from_value(serde_json::json!({
            "accounts": {
                "count": 1,
                "list": [{
                    "brokerAccountId": "2000",
                    "brokerAccountType": "Tinkoff",
                    "openedDate": "2020-02-03",
                    "totalAmount": { "currency": "RUB", "value": 1000.5 }
                }]
            },
            "totals": { "totalAmount": { "currency": "RUB", "value": 1000.5 } }
        })).unwrap();
        let account = &out.accounts.list[0];
        assert_eq!(account.totals.total_amount.value, 1000.5);
        assert!(account.opened_date.is_some());
    }

    #[test]
    fn operations_page() {
        let page: InvestOperations = serde_json::from_value(serde_json::json!({
            "hasNext": true,
            "nextCursor": "c2",
            "items": [{ "id": "1", "date": "2024-01-01T10:00:00.123+03:00", "type": "Buy" }]
        })).unwrap();
        assert!(page.has_next);
        assert_eq!(page.next_cursor, "c2");
        assert_eq!(page.items[0].kind, "Buy");
    }
}

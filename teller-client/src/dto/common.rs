//! Primary protocol: accounts, card operations and shopping receipts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Milliseconds, Seconds, encode};
use crate::exchange::{Auth, CommonExchange};
use crate::rate_limit::SHOPPING_RECEIPT_PATH;

// ─── Shared ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Currency {
    pub code:     i32,
    pub name:     String,
    pub str_code: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Amount {
    pub currency: Currency,
    pub value:    f64,
}

// ─── accounts_light_ib ────────────────────────────────────────────────────────

/// Lists every account with its cards.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct AccountsLightIbIn;

impl CommonExchange for AccountsLightIbIn {
    type Out = Vec<Account>;
    fn path(&self) -> &'static str { "/common/v1/accounts_light_ib" }
    fn auth(&self) -> Auth { Auth::Force }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id:               String,
    #[serde(default)]
    pub name:             String,
    #[serde(default)]
    pub value:            String,
    #[serde(default)]
    pub status:           String,
    #[serde(default)]
    pub payment_system:   String,
    #[serde(default)]
    pub primary:          bool,
    #[serde(default)]
    pub frozen_card:      bool,
    pub creation_date:    Option<Milliseconds>,
    pub expiration:       Option<Milliseconds>,
    #[serde(default)]
    pub ucid:             String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loyalty {
    #[serde(default)]
    pub program_code:            String,
    #[serde(default)]
    pub accrual_bonuses:         f64,
    #[serde(default)]
    pub available_bonuses:       f64,
    #[serde(default)]
    pub total_available_bonuses: f64,
    #[serde(default)]
    pub cashback_program:        bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id:                      String,
    #[serde(default)]
    pub name:                    String,
    #[serde(default)]
    pub account_type:            String,
    #[serde(default)]
    pub status:                  String,
    #[serde(default)]
    pub hidden:                  bool,
    #[serde(default)]
    pub currency:                Currency,
    pub money_amount:            Option<Amount>,
    pub credit_limit:            Option<Amount>,
    pub debt_amount:             Option<Amount>,
    pub current_minimal_payment: Option<Amount>,
    pub past_due_debt:           Option<Amount>,
    pub creation_date:           Option<Milliseconds>,
    pub due_date:                Option<Milliseconds>,
    pub last_statement_date:     Option<Milliseconds>,
    pub next_statement_date:     Option<Milliseconds>,
    pub loyalty:                 Option<Loyalty>,
    #[serde(default)]
    pub cards:                   Vec<Card>,
}

// ─── operations ───────────────────────────────────────────────────────────────

/// Card operations of `account` from `start` (optionally until `end`).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsIn {
    pub account: String,
    #[serde(serialize_with = "encode::unix_millis")]
    pub start:   DateTime<Utc>,
    #[serde(serialize_with = "encode::opt_unix_millis", skip_serializing_if = "Option::is_none")]
    pub end:     Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id:             Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tranche_creation_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loyalty_payment_program:  Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loyalty_payment_status:   Option<String>,
}

impl OperationsIn {
    pub fn new(account: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            account: account.into(),
            start,
            end: None,
            operation_id: None,
            tranche_creation_allowed: None,
            loyalty_payment_program: None,
            loyalty_payment_status: None,
        }
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }
}

impl CommonExchange for OperationsIn {
    type Out = Vec<Operation>;
    fn path(&self) -> &'static str { "/common/v1/operations" }
    fn auth(&self) -> Auth { Auth::Force }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Category {
    pub id:   String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Region {
    pub city:    String,
    pub country: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Merchant {
    pub name:   String,
    pub region: Option<Region>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Location {
    pub latitude:  f64,
    pub longitude: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id:                   String,
    #[serde(default)]
    pub account:              String,
    #[serde(default)]
    pub card:                 String,
    #[serde(default)]
    pub card_number:          String,
    #[serde(rename = "type", default)]
    pub kind:                 String,
    #[serde(default)]
    pub status:               String,
    #[serde(default)]
    pub group:                String,
    #[serde(default)]
    pub description:          String,
    #[serde(default)]
    pub amount:               Amount,
    #[serde(default)]
    pub account_amount:       Amount,
    #[serde(default)]
    pub cashback:             f64,
    #[serde(default)]
    pub category:             Category,
    #[serde(default)]
    pub mcc:                  i32,
    pub merchant:             Option<Merchant>,
    #[serde(default)]
    pub locations:            Vec<Location>,
    pub operation_time:       Milliseconds,
    pub debiting_time:        Option<Milliseconds>,
    #[serde(default)]
    pub id_source_type:       String,
    #[serde(default)]
    pub has_shopping_receipt: bool,
    #[serde(default)]
    pub is_dispute:           bool,
    #[serde(default)]
    pub is_suspicious:        bool,
    #[serde(default)]
    pub ucid:                 String,
}

// ─── shopping_receipt ─────────────────────────────────────────────────────────

/// Fiscal receipt of one operation. Rate-limited by the provider.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShoppingReceiptIn {
    pub operation_id:   String,
    #[serde(serialize_with = "encode::opt_unix_millis", skip_serializing_if = "Option::is_none")]
    pub operation_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account:        Option<String>,
}

impl ShoppingReceiptIn {
    /// The request for the receipt of `op`, as the web app sends it.
    pub fn for_operation(op: &Operation) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            operation_id:   op.id.clone(),
            operation_time: Some(op.operation_time.time()),
            id_source_type: non_empty(&op.id_source_type),
            account:        non_empty(&op.account),
        }
    }
}

impl CommonExchange for ShoppingReceiptIn {
    type Out = ShoppingReceipt;
    fn path(&self) -> &'static str { SHOPPING_RECEIPT_PATH }
    fn auth(&self) -> Auth { Auth::Force }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReceiptItem {
    pub name:     String,
    pub price:    f64,
    pub quantity: f64,
    pub sum:      f64,
    pub nds:      i32,
    #[serde(rename = "ndsRate")]
    pub nds_rate: i32,
    pub brand_id: Option<i64>,
    pub good_id:  Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub date_time:              Seconds,
    #[serde(default)]
    pub total_sum:              f64,
    #[serde(default)]
    pub cash_total_sum:         f64,
    #[serde(default)]
    pub ecash_total_sum:        f64,
    #[serde(default)]
    pub fiscal_document_number: i64,
    #[serde(default)]
    pub fiscal_drive_number:    i64,
    #[serde(default)]
    pub fiscal_sign:            i64,
    #[serde(default)]
    pub kkt_reg_id:             String,
    #[serde(default)]
    pub operation_type:         i32,
    #[serde(default)]
    pub operator:               String,
    #[serde(default)]
    pub retail_place:           String,
    #[serde(default)]
    pub retail_place_address:   String,
    #[serde(default)]
    pub user:                   String,
    #[serde(default)]
    pub user_inn:               String,
    #[serde(default)]
    pub items:                  Vec<ReceiptItem>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShoppingReceipt {
    pub operation_id:        String,
    pub operation_date_time: Option<Milliseconds>,
    pub receipt:             Receipt,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn operations_form_uses_unix_millis_and_omits_absent_fields() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let form  = serde_urlencoded::to_string(OperationsIn::new("5001", start)).unwrap();
        assert_eq!(form, "account=5001&start=1704067200000");

        let end  = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let form = serde_urlencoded::to_string(OperationsIn::new("5001", start).end(end)).unwrap();
        assert_eq!(form, "account=5001&start=1704067200000&end=1704153600000");
    }

    #[test]
    fn empty_request_encodes_to_empty_form() {
        assert_eq!(serde_urlencoded::to_string(AccountsLightIbIn).unwrap(), "");
    }

    #[test]
    fn operation_decodes_and_feeds_receipt_request() {
        let op: Operation = serde_json::from_value(serde_json::json!({
            "id": "op-1",
            "account": "5001",
            "type": "Debit",
            "amount": { "currency": { "code": 643, "name": "RUB", "strCode": "643" }, "value": 199.9 },
            "operationTime": { "milliseconds": 1704067200000i64 },
            "idSourceType": "Online",
            "hasShoppingReceipt": true,
            "someFieldWeDoNotModel": [1, 2, 3]
        })).unwrap();
        assert_eq!(op.kind, "Debit");
        assert_eq!(op.amount.currency.name, "RUB");
        assert!(op.has_shopping_receipt);

        let form = serde_urlencoded::to_string(ShoppingReceiptIn::for_operation(&op)).unwrap();
        assert_eq!(form, "operationId=op-1&operationTime=1704067200000&idSourceType=Online&account=5001");
    }

    #[test]
    fn receipt_uses_unix_seconds() {
        let r: ShoppingReceipt = serde_json::from_value(serde_json::json!({
            "operationId": "op-1",
            "receipt": {
                "dateTime": 1704067200,
                "totalSum": 199.9,
                "items": [{ "name": "Bread", "price": 99.95, "quantity": 2.0, "sum": 199.9, "ndsRate": 10 }]
            }
        })).unwrap();
        assert_eq!(r.receipt.date_time.time().timestamp(), 1_704_067_200);
        assert_eq!(r.receipt.items[0].nds_rate, 10);
    }
}

// =============================================================================
// Screener WS Protocol — request/response unions discriminated on `t`
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::screener::sql::{FilterExpr, JoinOp, SortField};

pub const NO_AUTH_TOKEN: &str = "no_auth";

fn default_token() -> String {
    NO_AUTH_TOKEN.to_string()
}

fn default_merge() -> JoinOp {
    JoinOp::Or
}

/// Everything a client may send over the screener socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t")]
pub enum ClientMessage {
    #[serde(rename = "AUTH")]
    Auth {
        #[serde(default = "default_token")]
        token: String,
    },

    #[serde(rename = "SCREENER_SUBSCRIBE")]
    Subscribe(SubscribeRequest),

    #[serde(rename = "SCREENER_PATCH")]
    Patch(PatchRequest),

    #[serde(rename = "SCREENER_UNSUBSCRIBE")]
    Unsubscribe { session_id: String },

    #[serde(rename = "SCREENER_SET_UNIVERSE")]
    SetUniverse {
        session_id: String,
        /// `None` means the full screener universe; a list is a watchlist.
        universe: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub session_id: String,
    #[serde(default)]
    pub filters: Vec<FilterExpr>,
    #[serde(default = "default_merge")]
    pub filter_merge: JoinOp,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub range: Vec<i64>,
    #[serde(default)]
    pub universe: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchRequest {
    pub session_id: String,
    #[serde(default)]
    pub filters: Option<Vec<FilterExpr>>,
    #[serde(default)]
    pub filter_merge: Option<JoinOp>,
    #[serde(default)]
    pub sort: Option<Vec<SortField>>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub range: Option<(i64, i64)>,
}

/// Everything the server sends back.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t")]
pub enum ServerMessage {
    #[serde(rename = "SCREENER_SUBSCRIBED")]
    Subscribed { session_id: String },

    #[serde(rename = "SCREENER_PATCHED")]
    Patched { session_id: String },

    #[serde(rename = "SCREENER_FULL_RESPONSE")]
    Full {
        session_id: String,
        c: Vec<String>,
        d: Vec<Vec<Json>>,
        range: (i64, i64),
        total: usize,
    },

    #[serde(rename = "SCREENER_PARTIAL_RESPONSE")]
    Partial { session_id: String, d: Vec<Json> },

    #[serde(rename = "SCREENER_DUPLICATE")]
    Duplicate { session_id: String },

    #[serde(rename = "SCREENER_ERROR")]
    Error { msg: String },
}

/// Parse one inbound frame. Distinguishes an unknown discriminator from a
/// malformed body so clients get the canonical "Unknown event type" error.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(e) => {
            let known = [
                "AUTH",
                "SCREENER_SUBSCRIBE",
                "SCREENER_PATCH",
                "SCREENER_UNSUBSCRIBE",
                "SCREENER_SET_UNIVERSE",
            ];
            let tag = serde_json::from_str::<Json>(text)
                .ok()
                .and_then(|v| v.get("t").and_then(Json::as_str).map(String::from));
            match tag {
                Some(t) if known.contains(&t.as_str()) => Err(e.to_string()),
                _ => Err("Unknown event type".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_with_defaults() {
        let msg = parse_client_message(
            r#"{"t": "SCREENER_SUBSCRIBE", "session_id": "s1"}"#,
        )
        .unwrap();
        let ClientMessage::Subscribe(req) = msg else {
            panic!("expected subscribe");
        };
        assert_eq!(req.session_id, "s1");
        assert!(req.filters.is_empty());
        assert_eq!(req.filter_merge, JoinOp::Or);
        assert!(req.columns.is_empty());
        assert!(req.range.is_empty());
        assert!(req.universe.is_none());
    }

    #[test]
    fn subscribe_with_full_payload() {
        let body = serde_json::json!({
            "t": "SCREENER_SUBSCRIBE",
            "session_id": "s2",
            "filters": [{"colId": "mcap", "type": "greaterThan", "filter": 100}],
            "filter_merge": "AND",
            "sort": [{"colId": "mcap", "sort": "DESC"}],
            "columns": ["ticker", "mcap"],
            "range": [0, 49],
            "universe": ["NSE:A", "NSE:B"]
        });
        let msg = parse_client_message(&body.to_string()).unwrap();
        let ClientMessage::Subscribe(req) = msg else {
            panic!("expected subscribe");
        };
        assert_eq!(req.filter_merge, JoinOp::And);
        assert_eq!(req.range, vec![0, 49]);
        assert_eq!(req.universe.as_deref().unwrap().len(), 2);
    }

    #[test]
    fn auth_defaults_to_no_auth() {
        let msg = parse_client_message(r#"{"t": "AUTH"}"#).unwrap();
        let ClientMessage::Auth { token } = msg else {
            panic!("expected auth");
        };
        assert_eq!(token, NO_AUTH_TOKEN);
    }

    #[test]
    fn patch_only_carries_present_fields() {
        let msg = parse_client_message(
            r#"{"t": "SCREENER_PATCH", "session_id": "s1", "range": [50, 99]}"#,
        )
        .unwrap();
        let ClientMessage::Patch(req) = msg else {
            panic!("expected patch");
        };
        assert_eq!(req.range, Some((50, 99)));
        assert!(req.filters.is_none());
        assert!(req.sort.is_none());
        assert!(req.columns.is_none());
    }

    #[test]
    fn unknown_discriminator_is_the_canonical_error() {
        let err = parse_client_message(r#"{"t": "SCREENER_EXPLODE"}"#).unwrap_err();
        assert_eq!(err, "Unknown event type");

        let err = parse_client_message("not json at all").unwrap_err();
        assert_eq!(err, "Unknown event type");
    }

    #[test]
    fn known_discriminator_with_bad_body_reports_the_parse_error() {
        let err =
            parse_client_message(r#"{"t": "SCREENER_SUBSCRIBE"}"#).unwrap_err();
        assert!(err.contains("session_id"));
    }

    #[test]
    fn server_messages_serialize_with_discriminator() {
        let msg = ServerMessage::Full {
            session_id: "s1".into(),
            c: vec!["ticker".into()],
            d: vec![vec![Json::from("NSE:A")]],
            range: (0, 49),
            total: 1,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["t"], "SCREENER_FULL_RESPONSE");
        assert_eq!(v["range"], serde_json::json!([0, 49]));

        let dup = serde_json::to_value(ServerMessage::Duplicate {
            session_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(dup["t"], "SCREENER_DUPLICATE");
    }
}

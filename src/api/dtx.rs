//! Distributed transaction inspection.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::server::AppState;
use crate::transaction::Xid;

#[derive(Debug, Serialize)]
pub struct XidView {
    pub xid: String,
    pub format: i32,
    pub recovered: bool,
}

#[derive(Debug, Serialize)]
pub struct InDoubtResponse {
    pub transactions: Vec<XidView>,
    pub total: usize,
}

/// GET /dtx/in-doubt
pub async fn in_doubt(State(state): State<AppState>) -> Json<InDoubtResponse> {
    let recovered = state.broker.recovered_xids();
    let mut transactions: Vec<XidView> = state
        .broker
        .in_doubt_xids()
        .into_iter()
        .map(|xid: Xid| XidView {
            recovered: recovered.contains(&xid),
            format: xid.format,
            xid: xid.to_string(),
        })
        .collect();
    transactions.sort_by(|a, b| a.xid.cmp(&b.xid));
    let total = transactions.len();
    Json(InDoubtResponse {
        transactions,
        total,
    })
}

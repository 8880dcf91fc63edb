use crate::state::AppState;
use axum::{extract::State, Json};
use relay_protocol::StatsData;

pub async fn get_stats(State(state): State<AppState>) -> Json<StatsData> {
    Json(state.registry.stats().await)
}

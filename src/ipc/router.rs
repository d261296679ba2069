use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::alunos::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::vinculos::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::etapas::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::notas::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::lancamentos::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backup_exchange::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

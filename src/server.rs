//! HTTP surface of the sync protocol.
//!
//! `GET /getaddr`, `GET /getlen`, `GET /getblock?index=N` and
//! `POST /newmsg`, all served on the node's single port.

use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::ledger::LedgerError;
use crate::node::{Node, NodeError};

/// Largest `/newmsg` body accepted.
pub const MAX_MESSAGE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
struct AddrQuery {
    format: Option<String>,
}

fn with_node(node: Arc<Node>) -> impl Filter<Extract = (Arc<Node>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&node))
}

pub fn routes(
    node: Arc<Node>,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let getaddr = warp::path("getaddr")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::addr::remote())
        .and(warp::query::<AddrQuery>())
        .and(with_node(Arc::clone(&node)))
        .map(get_addr);

    let getlen = warp::path("getlen")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_node(Arc::clone(&node)))
        .map(get_len);

    let getblock = warp::path("getblock")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_node(Arc::clone(&node)))
        .map(get_block);

    let newmsg = warp::path("newmsg")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_MESSAGE_BYTES))
        .and(warp::body::bytes())
        .and(with_node(node))
        .then(new_message);

    getaddr.or(getlen).unify().or(getblock).unify().or(newmsg).unify()
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    warp::reply::with_status(body.into(), status).into_response()
}

fn get_addr(remote: Option<SocketAddr>, query: AddrQuery, node: Arc<Node>) -> Response {
    if let Some(remote) = remote {
        node.peers().update_timestamp(&remote.to_string());
    }
    let snapshot = match node.peers().snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "failed to read peer registry");
            return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    if query.format.as_deref() == Some("bin") {
        return match bincode::serialize(&snapshot) {
            Ok(encoded) => warp::reply::with_header(
                encoded,
                "content-type",
                "application/octet-stream",
            )
            .into_response(),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }
    warp::reply::json(&snapshot).into_response()
}

fn get_len(node: Arc<Node>) -> Response {
    match node.ledger().length() {
        Ok(length) => text(StatusCode::OK, length.to_string()),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn get_block(query: HashMap<String, String>, node: Arc<Node>) -> Response {
    let Some(raw) = query.get("index") else {
        return text(StatusCode::BAD_REQUEST, "missing index");
    };
    let Ok(index) = raw.parse::<u64>() else {
        return text(StatusCode::BAD_REQUEST, format!("invalid index {raw:?}"));
    };

    match node.ledger().get_block_bytes(index) {
        Ok(encoded) => {
            warp::reply::with_header(encoded, "content-type", "application/json").into_response()
        }
        Err(e @ LedgerError::NotFound(_)) => text(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Signature checks and sled writes run on the blocking pool.
async fn new_message(body: Bytes, node: Arc<Node>) -> Response {
    let handler = Arc::clone(&node);
    let handled = match tokio::task::spawn_blocking(move || handler.handle_message(&body)).await {
        Ok(handled) => handled,
        Err(e) => {
            warn!(error = %e, "message handler task failed");
            return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    match handled {
        Ok(envelope) => {
            debug!(id = envelope.id, "relaying message");
            // Relayed without de-duplication
            node.broadcast(envelope);
            text(StatusCode::OK, "ok")
        }
        Err(e) => {
            let status = rejection_status(&e);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                warn!(error = %e, "failed to handle message");
            } else {
                debug!(error = %e, "rejected message");
            }
            text(status, e.to_string())
        }
    }
}

fn rejection_status(error: &NodeError) -> StatusCode {
    match error {
        NodeError::WireError(_)
        | NodeError::CryptoError(_)
        | NodeError::InvalidSignature
        | NodeError::BlockRejected { .. }
        | NodeError::ProofOfWorkRejected { .. }
        | NodeError::LedgerError(LedgerError::ValidationError(_))
        | NodeError::LedgerError(LedgerError::WireError(_))
        | NodeError::LedgerError(LedgerError::CryptoError(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::consensus::UncheckedWork;
    use crate::storage::Stores;
    use crate::sync::NoopSync;
    use crate::types::tests::signing_key;
    use crate::types::Transaction;
    use crate::wire::Envelope;
    use std::collections::BTreeMap;

    fn node() -> Arc<Node> {
        let config = NodeConfig {
            miner_address: Some("Dexmminer".to_string()),
            ..NodeConfig::default()
        };
        Node::with_parts(
            config,
            Stores::temporary().unwrap(),
            Arc::new(NoopSync),
            Arc::new(UncheckedWork),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn getaddr_registers_the_caller_and_lists_peers() {
        let node = node();
        let routes = routes(Arc::clone(&node));

        let response = warp::test::request()
            .path("/getaddr")
            .remote_addr("198.51.100.20:40000".parse().unwrap())
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let peers: BTreeMap<String, i64> = serde_json::from_slice(response.body()).unwrap();
        assert!(peers.contains_key("198.51.100.20"));

        let response = warp::test::request()
            .path("/getaddr?format=bin")
            .reply(&routes)
            .await;
        let peers: BTreeMap<String, i64> = bincode::deserialize(response.body()).unwrap();
        assert_eq!(peers.keys().collect::<Vec<_>>(), vec!["198.51.100.20"]);
    }

    #[tokio::test]
    async fn getlen_and_getblock_serve_the_chain() {
        let node = node();
        let routes = routes(Arc::clone(&node));

        let response = warp::test::request().path("/getlen").reply(&routes).await;
        assert_eq!(&response.body()[..], b"1");

        let response = warp::test::request()
            .path("/getblock?index=0")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            &response.body()[..],
            node.ledger().get_block_bytes(0).unwrap().as_slice()
        );

        let missing = warp::test::request()
            .path("/getblock?index=5")
            .reply(&routes)
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = warp::test::request()
            .path("/getblock?index=five")
            .reply(&routes)
            .await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn newmsg_queues_valid_transactions_and_rejects_forgeries() {
        let node = node();
        let routes = routes(Arc::clone(&node));
        let key = signing_key();
        let mut tx = Transaction::new(&key.verifying_key(), "Dexmrecipient", 10, 0, 1, 1);
        tx.sign(&key).unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/newmsg")
            .body(Envelope::transaction(&tx).unwrap().to_bytes().unwrap())
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(node.pending_transactions(), 1);

        tx.amount = 11;
        let response = warp::test::request()
            .method("POST")
            .path("/newmsg")
            .body(Envelope::transaction(&tx).unwrap().to_bytes().unwrap())
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(node.pending_transactions(), 1);
    }

    #[tokio::test]
    async fn newmsg_appends_a_linked_block() {
        let producer = node();
        let follower = node();
        let routes = routes(Arc::clone(&follower));
        let (block, _) = producer.mine_block().unwrap();
        let body = Envelope::block(&block).unwrap().to_bytes().unwrap();

        let response = warp::test::request()
            .method("POST")
            .path("/newmsg")
            .body(&body)
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let length = warp::test::request().path("/getlen").reply(&routes).await;
        assert_eq!(&length.body()[..], b"2");

        let replay = warp::test::request()
            .method("POST")
            .path("/newmsg")
            .body(&body)
            .reply(&routes)
            .await;
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    }
}

//! Byte-level proxy between the browser and the hypervisor VNC websocket.
//!
//! Both text and binary frames are forwarded in both directions concurrently;
//! the bridge closes as soon as either side disconnects. The ticket minted by
//! the lifecycle controller authenticates the hypervisor side.

use crate::api::{ApiError, RouterState};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};

#[derive(Deserialize)]
pub struct VncProxyQuery {
    pub node: String,
    pub vmid: u32,
    pub port: u16,
    pub ticket: String,
    /// Accepted for client compatibility; upstream auth uses the API token
    #[serde(default)]
    pub authticket: Option<String>,
}

pub async fn vnc_ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<VncProxyQuery>,
    State(state): State<RouterState>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state
        .db
        .get_node_by_name(&q.node)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "Node not found"))?;
    let cluster = state
        .db
        .get_cluster(node.cluster_id)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "Cluster not found"))?;

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = proxy_vnc(socket, cluster, q).await {
            error!("VNC proxy ended with error: {}", e);
        }
    }))
}

async fn proxy_vnc(
    client: WebSocket,
    cluster: vpsrent_db::Cluster,
    q: VncProxyQuery,
) -> anyhow::Result<()> {
    let host = reqwest::Url::parse(&cluster.host)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| cluster.host.clone());
    let target = format!(
        "wss://{}:8006/api2/json/nodes/{}/qemu/{}/vncwebsocket?port={}&vncticket={}",
        host,
        q.node,
        q.vmid,
        q.port,
        urlencoding::encode(&q.ticket)
    );

    let mut request = target.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("PVEAPIToken={}", cluster.api_token).parse()?,
    );

    let connector = if cluster.verify_tls {
        None
    } else {
        Some(Connector::NativeTls(
            native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
        ))
    };

    let (upstream, _) = connect_async_tls_with_config(request, None, false, connector).await?;
    info!("VNC proxy opened for VM {} on {}", q.vmid, q.node);

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let forward = match msg {
                    WsMessage::Binary(b) => TungMessage::binary(b),
                    WsMessage::Text(t) => TungMessage::text(t.to_string()),
                    WsMessage::Ping(p) => TungMessage::Ping(p),
                    WsMessage::Pong(p) => TungMessage::Pong(p),
                    WsMessage::Close(_) => break,
                };
                if upstream_tx.send(forward).await.is_err() {
                    break;
                }
            }
            msg = upstream_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let forward = match msg {
                    TungMessage::Binary(b) => WsMessage::Binary(b),
                    TungMessage::Text(t) => WsMessage::Text(t.to_string().into()),
                    TungMessage::Ping(p) => WsMessage::Ping(p),
                    TungMessage::Pong(p) => WsMessage::Pong(p),
                    TungMessage::Close(_) => break,
                    TungMessage::Frame(_) => continue,
                };
                if client_tx.send(forward).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!("VNC proxy closed for VM {}", q.vmid);
    Ok(())
}

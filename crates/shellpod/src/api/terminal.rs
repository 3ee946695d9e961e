//! Terminal WebSocket relay.
//!
//! Binary frames pass through untouched in both directions. Client text
//! frames must be control frames; anything else is dropped here so the
//! container never sees it.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use shellpod_protocol::ControlFrame;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::error::ApiResult;
use super::state::AppState;

/// WebSocket upgrade handler for one terminal of a session.
///
/// The container is started before the upgrade so start failures surface as
/// HTTP errors instead of an immediately closed socket.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path((session_id, terminal_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> ApiResult<impl IntoResponse> {
    let endpoint = state.session(&session_id)?.terminal_endpoint().await?;
    let target_url = terminal_url(&endpoint, &terminal_id);

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = relay_terminal(socket, target_url).await {
            error!("Terminal relay error for {}/{}: {:?}", session_id, terminal_id, e);
        }
    }))
}

pub(crate) fn terminal_url(endpoint: &str, terminal_id: &str) -> String {
    format!(
        "ws://{}/ws?terminal={}",
        endpoint,
        urlencoding::encode(terminal_id)
    )
}

/// Client frame as it should reach the container, or `None` to drop it.
fn client_to_upstream(msg: AxumMessage) -> Option<TungsteniteMessage> {
    let forward = match msg {
        AxumMessage::Text(text) => match ControlFrame::parse(text.as_str()) {
            Ok(frame) => TungsteniteMessage::Text(frame.to_json().into()),
            Err(err) => {
                warn!("Dropping terminal control frame: {}", err);
                return None;
            }
        },
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(frame) => {
            TungsteniteMessage::Close(frame.map(|f| TungsteniteCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().to_string().into(),
            }))
        }
    };
    Some(forward)
}

/// Container frame as it should reach the client. Close codes are kept so
/// the client can tell a clean exit from a dropped connection.
fn upstream_to_client(msg: TungsteniteMessage) -> Option<AxumMessage> {
    let forward = match msg {
        TungsteniteMessage::Text(text) => AxumMessage::Text(text.as_str().to_string().into()),
        TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
        TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
        TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
        TungsteniteMessage::Close(frame) => AxumMessage::Close(frame.map(|f| AxumCloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_string().into(),
        })),
        TungsteniteMessage::Frame(_) => return None,
    };
    Some(forward)
}

async fn relay_terminal(client_socket: WebSocket, target_url: String) -> anyhow::Result<()> {
    debug!("Relaying terminal WebSocket to {}", target_url);

    let (server_socket, _) = connect_async(target_url.as_str()).await?;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut server_tx, mut server_rx) = server_socket.split();

    let client_to_server = async {
        while let Some(msg) = client_rx.next().await {
            let Some(forward) = client_to_upstream(msg?) else {
                continue;
            };
            let closing = matches!(forward, TungsteniteMessage::Close(_));
            server_tx.send(forward).await?;
            if closing {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let server_to_client = async {
        while let Some(msg) = server_rx.next().await {
            let Some(forward) = upstream_to_client(msg?) else {
                continue;
            };
            let closing = matches!(forward, AxumMessage::Close(_));
            client_tx.send(forward).await?;
            if closing {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = client_to_server => result?,
        result = server_to_client => result?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_url_encodes_the_terminal_id() {
        assert_eq!(
            terminal_url("127.0.0.1:32768", "main tab"),
            "ws://127.0.0.1:32768/ws?terminal=main%20tab"
        );
    }

    #[test]
    fn malformed_control_frames_are_dropped() {
        assert!(client_to_upstream(AxumMessage::Text("hello".into())).is_none());
        assert!(
            client_to_upstream(AxumMessage::Text(r#"{"type":"resize","cols":0,"rows":1}"#.into()))
                .is_none()
        );

        let forwarded =
            client_to_upstream(AxumMessage::Text(r#"{"type":"resize","cols":80,"rows":24}"#.into()));
        match forwarded {
            Some(TungsteniteMessage::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"type":"resize","cols":80,"rows":24}"#)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn binary_and_close_codes_pass_through() {
        let bytes = bytes_of(b"ls\r");
        assert!(matches!(
            client_to_upstream(AxumMessage::Binary(bytes.clone())),
            Some(TungsteniteMessage::Binary(b)) if b == bytes
        ));

        let close = TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }));
        match upstream_to_client(close) {
            Some(AxumMessage::Close(Some(frame))) => assert_eq!(frame.code, 1000),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn bytes_of(data: &'static [u8]) -> axum::body::Bytes {
        axum::body::Bytes::from_static(data)
    }
}

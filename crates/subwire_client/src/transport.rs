#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};
use url::Url;

use crate::manager::Msg;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Injectable websocket connector; tests point this at a local server.
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

pub(crate) fn default_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.context("connect eventsub websocket")?;
			Ok(ws)
		}) as BoxFuture<'static, anyhow::Result<WsStream>>
	})
}

/// Events a transport posts into the manager mailbox, in receive order.
#[derive(Debug)]
pub(crate) enum TransportEvent {
	/// The underlying connection is open; the welcome timer is running.
	Opened,
	Frame(String),
	Closed { cause: String },
}

#[derive(Debug)]
enum TransportCmd {
	Send(String),
	SetWatchdog(Duration),
	Close,
}

/// Handle to one transport task. Dropping it does not close the connection;
/// use `close` for that.
#[derive(Debug, Clone)]
pub(crate) struct TransportHandle {
	cmd_tx: mpsc::UnboundedSender<TransportCmd>,
}

impl TransportHandle {
	#[allow(dead_code)]
	pub(crate) fn send_text(&self, text: String) {
		let _ = self.cmd_tx.send(TransportCmd::Send(text));
	}

	/// Replace the inactivity watchdog window; also resets the running deadline.
	pub(crate) fn set_watchdog(&self, window: Duration) {
		let _ = self.cmd_tx.send(TransportCmd::SetWatchdog(window));
	}

	/// Close the connection without emitting a `Closed` event.
	pub(crate) fn close(&self) {
		let _ = self.cmd_tx.send(TransportCmd::Close);
	}
}

/// Spawn the background task for one websocket connection.
///
/// `initial_watchdog` doubles as the welcome timeout: if nothing arrives
/// within it the connection is declared dead. The manager rearms the watchdog
/// with the keepalive window once the session is welcomed.
pub(crate) fn spawn(
	session: u32,
	url: Url,
	connector: WsConnector,
	initial_watchdog: Duration,
	events: mpsc::Sender<Msg>,
) -> TransportHandle {
	let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

	tokio::spawn(run(session, url, connector, initial_watchdog, events, cmd_rx));

	TransportHandle { cmd_tx }
}

async fn run(
	session: u32,
	url: Url,
	connector: WsConnector,
	initial_watchdog: Duration,
	events: mpsc::Sender<Msg>,
	mut cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
) {
	let post = |event: TransportEvent| {
		let events = events.clone();
		async move {
			let _ = events.send(Msg::Transport { session, event }).await;
		}
	};

	let mut ws = match (connector)(url.clone()).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(session, url = %url, error = %format!("{e:#}"), "websocket connect failed");
			post(TransportEvent::Closed {
				cause: format!("connect failed: {e:#}"),
			})
			.await;
			return;
		}
	};

	let mut watchdog = initial_watchdog;
	let mut deadline = Instant::now() + watchdog;

	post(TransportEvent::Opened).await;

	loop {
		tokio::select! {
			cmd = cmd_rx.recv() => match cmd {
				Some(TransportCmd::Send(text)) => {
					if let Err(e) = ws.send(Message::Text(text.into())).await {
						post(TransportEvent::Closed { cause: format!("send failed: {e}") }).await;
						return;
					}
				}
				Some(TransportCmd::SetWatchdog(window)) => {
					watchdog = window;
					deadline = Instant::now() + watchdog;
				}
				Some(TransportCmd::Close) | None => {
					let _ = ws.close(None).await;
					return;
				}
			},

			msg = ws.next() => {
				let Some(msg) = msg else {
					post(TransportEvent::Closed { cause: "socket ended".to_string() }).await;
					return;
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => {
						post(TransportEvent::Closed { cause: format!("read error: {e}") }).await;
						return;
					}
				};

				deadline = Instant::now() + watchdog;

				match msg {
					Message::Text(t) => {
						post(TransportEvent::Frame(t.to_string())).await;
					}
					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Close(frame) => {
						post(TransportEvent::Closed { cause: format!("server close: {frame:?}") }).await;
						return;
					}
					_ => {}
				}
			},

			_ = sleep_until(deadline) => {
				warn!(session, "watchdog expired after {watchdog:?} without traffic");
				let _ = ws.close(None).await;
				post(TransportEvent::Closed { cause: "keepalive watchdog expired".to_string() }).await;
				return;
			}
		}
	}
}

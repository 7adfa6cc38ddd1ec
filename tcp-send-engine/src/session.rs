//! Async event loop driving one connection.
//!
//! # Architecture
//!
//! ```text
//!  Application                     Receive path
//!      │ send(data) / close()          │ report_ack(AckReport)
//!      ▼                               ▼
//!  data_tx ──────┐           ┌────── ack_tx
//!                ▼           ▼
//!            ┌───────────────────────┐
//!            │   event_loop task     │──── sleep_until(next timer)
//!            └──────────┬────────────┘
//!                       │  Connection (lock → engine → unlock → Transmit)
//!                       ▼
//!                     link
//! ```
//!
//! The loop owns no send state of its own; it only turns channel messages
//! and timer wake-ups into [`Connection`] calls.  Data the send buffer cannot
//! take yet is held back, and the data channel is not polled until it fits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::EngineError;
use crate::timer::TimerToken;

const CHANNEL_CAPACITY: usize = 64;

/// One acknowledgement as seen by the receive path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckReport {
    pub ack: u32,
    pub window: u16,
    pub sack_ranges: Vec<(u32, u32)>,
    pub timestamp_echo: Option<u32>,
}

/// Handle returned by [`spawn`].
pub struct Session {
    /// Application data for the peer.
    pub data_tx: mpsc::Sender<Vec<u8>>,
    /// Acknowledgements from the receive path.
    pub ack_tx: mpsc::Sender<AckReport>,
    connection: Arc<Connection>,
    handle: JoinHandle<Result<(), EngineError>>,
}

impl Session {
    /// Queue application data (waits while the channel is full).
    pub async fn send(&self, data: Vec<u8>) -> Result<(), EngineError> {
        self.data_tx
            .send(data)
            .await
            .map_err(|_| EngineError::Reset) // channel closed means the loop died
    }

    /// Deliver an acknowledgement to the engine.
    pub async fn report_ack(&self, report: AckReport) -> Result<(), EngineError> {
        self.ack_tx.send(report).await.map_err(|_| EngineError::Reset)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Signal end-of-stream and wait for the event loop to finish.
    ///
    /// The loop ends once the FIN is acknowledged, so ACKs must keep flowing
    /// through a clone of [`ack_tx`](Self::ack_tx).  Without them the FIN is
    /// retransmitted until the retransmission limit resets the connection.
    pub async fn close(self) -> Result<(), EngineError> {
        let Session {
            data_tx,
            ack_tx,
            handle,
            ..
        } = self;
        drop(data_tx);
        let result = handle.await.unwrap_or(Err(EngineError::Reset));
        drop(ack_tx);
        result
    }
}

/// Spawn the event loop for `connection` on the current tokio runtime.
pub fn spawn(connection: Arc<Connection>) -> Session {
    let (data_tx, data_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (ack_tx, ack_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(event_loop(Arc::clone(&connection), data_rx, ack_rx));
    Session {
        data_tx,
        ack_tx,
        connection,
        handle,
    }
}

async fn event_loop(
    conn: Arc<Connection>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    mut ack_rx: mpsc::Receiver<AckReport>,
) -> Result<(), EngineError> {
    // A disarmed timer sleeps very far in the future.  The `armed` guard in
    // select! keeps it from being acted on.
    let far_future = Duration::from_secs(365 * 24 * 3600);
    let timer = tokio::time::sleep(far_future);
    tokio::pin!(timer);
    let mut armed: Option<TimerToken> = None;

    let mut backlog: Vec<u8> = Vec::new();
    let mut data_open = true;
    let mut close_sent = false;

    loop {
        if conn.is_finished() {
            log::debug!("[session] {}: FIN acknowledged, done", conn.id());
            return Ok(());
        }

        match conn.next_timer() {
            Some(event) => {
                if armed != Some(event.token) {
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::from_std(event.deadline));
                    armed = Some(event.token);
                }
            }
            None => {
                if armed.take().is_some() {
                    timer.as_mut().reset(tok_now() + far_future);
                }
            }
        }

        tokio::select! {
            // ── Branch 1: application data ───────────────────────────────
            maybe_data = data_rx.recv(), if data_open && backlog.is_empty() => {
                match maybe_data {
                    Some(bytes) => {
                        backlog = bytes;
                        flush_backlog(&conn, &mut backlog)?;
                    }
                    None => {
                        log::debug!("[session] {}: application closed", conn.id());
                        data_open = false;
                    }
                }
            }

            // ── Branch 2: ACK from the receive path ──────────────────────
            maybe_ack = ack_rx.recv() => {
                match maybe_ack {
                    Some(report) => {
                        conn.report_ack(
                            report.ack,
                            report.window,
                            &report.sack_ranges,
                            report.timestamp_echo,
                            now(),
                        )?;
                        flush_backlog(&conn, &mut backlog)?;
                    }
                    None if conn.is_finished() => return Ok(()),
                    None => {
                        log::warn!("[session] {}: receive path gone before FIN was acknowledged", conn.id());
                        return Err(EngineError::Closed);
                    }
                }
            }

            // ── Branch 3: retransmission / persist timer ─────────────────
            _ = &mut timer, if armed.is_some() => {
                if let Some(token) = armed.take() {
                    conn.on_timer(token, now())?;
                }
            }
        }

        if !data_open && backlog.is_empty() && !close_sent {
            conn.request_close(now())?;
            close_sent = true;
        }
    }
}

/// Move as much held-back data into the send buffer as fits.
fn flush_backlog(conn: &Connection, backlog: &mut Vec<u8>) -> Result<(), EngineError> {
    if backlog.is_empty() {
        return Ok(());
    }
    match conn.queue_data(backlog, now()) {
        Ok(accepted) => {
            backlog.drain(..accepted);
            Ok(())
        }
        Err(EngineError::Full(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Shorthand for `tokio::time::Instant::now()`.
#[inline]
fn tok_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// The engine clock: tokio's (pausable) clock as a std `Instant`.
fn now() -> std::time::Instant {
    tok_now().into_std()
}

use std::time::Duration;

use tokio::{
    select,
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::registry::PendingSubscribe;

/// Coalesces subscribe requests raised within one bundle window into a
/// single ordered batch, so a burst of N subscriptions (app startup, mass
/// resubscribe after reconnect) costs one flush instead of N round trips.
///
/// The flush is timer-driven: the window opens when the first request lands
/// in an empty buffer and everything buffered by the time it closes goes out
/// together, FIFO. A full buffer (`max_batch`) flushes early.
pub(crate) async fn run_bundler(
    window: Duration,
    max_batch: usize,
    mut requests_rx: mpsc::UnboundedReceiver<PendingSubscribe>,
    batches_tx: mpsc::UnboundedSender<Vec<PendingSubscribe>>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<PendingSubscribe> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_at = deadline.unwrap_or_else(Instant::now);
        select! {
            _ = cancel.cancelled() => break,
            maybe_request = requests_rx.recv() => match maybe_request {
                Some(request) => {
                    if buffer.is_empty() {
                        deadline = Some(Instant::now() + window);
                    }
                    buffer.push(request);
                    if buffer.len() >= max_batch {
                        flush(&mut buffer, &mut deadline, &batches_tx);
                    }
                }
                None => break,
            },
            _ = time::sleep_until(flush_at), if deadline.is_some() => {
                flush(&mut buffer, &mut deadline, &batches_tx);
            }
        }
    }
}

fn flush(
    buffer: &mut Vec<PendingSubscribe>,
    deadline: &mut Option<Instant>,
    batches_tx: &mpsc::UnboundedSender<Vec<PendingSubscribe>>,
) {
    *deadline = None;
    if buffer.is_empty() {
        return;
    }
    debug!("flushing bundle of {} subscribe request(s)", buffer.len());
    let _ = batches_tx.send(std::mem::take(buffer));
}

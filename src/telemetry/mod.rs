pub mod buffer;
pub mod realtime;
pub mod record;
pub mod sync;

pub use buffer::TelemetryBuffer;
pub use record::{BufferStats, TelemetryRecord};
pub use sync::SyncClient;

use crate::mavlink::StateDelta;
use crate::session::DropQueue;
use crate::shutdown::Shutdown;
use crate::state::now_epoch;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consume projection deltas from the hub, turn them into records, and feed
/// both the durable buffer and the fire-and-forget realtime channel.
pub async fn run_intake(
    deltas: Arc<DropQueue<StateDelta>>,
    buffer: Arc<TelemetryBuffer>,
    vehicle_id: String,
    realtime_tx: Option<mpsc::Sender<TelemetryRecord>>,
    mut shutdown: Shutdown,
) {
    info!("Telemetry intake started for vehicle {}", vehicle_id);

    loop {
        let delta = tokio::select! {
            _ = shutdown.recv() => break,
            delta = deltas.pop() => match delta {
                Some(delta) => delta,
                None => break,
            },
        };

        let record = TelemetryRecord::from_delta(&vehicle_id, &delta, now_epoch());

        if let Some(tx) = &realtime_tx {
            // Never block intake on the side channel; a full queue just
            // loses the realtime copy.
            let _ = tx.try_send(record.clone());
        }

        let checkpoint_due = buffer.push(record);
        if checkpoint_due {
            if let Err(e) = buffer.save() {
                warn!("Telemetry checkpoint failed: {}", e);
            } else {
                debug!("Telemetry checkpoint written");
            }
        }
    }

    info!("Telemetry intake stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn intake_buffers_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        let buffer = Arc::new(TelemetryBuffer::new(&path, 100, 3, 3));
        let deltas = Arc::new(DropQueue::new(16));
        let (trigger, shutdown) = crate::shutdown::channel();

        let intake = tokio::spawn(run_intake(
            Arc::clone(&deltas),
            Arc::clone(&buffer),
            "drone-1".to_string(),
            None,
            shutdown,
        ));

        for i in 0..4 {
            deltas.push(StateDelta {
                altitude: Some(f64::from(i)),
                ..Default::default()
            });
        }

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while buffer.memory_len() < 4 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The third record crossed the checkpoint interval.
        assert!(path.exists());
        assert_eq!(buffer.stats().pending_sync, 4);

        trigger.trigger();
        intake.await.unwrap();
    }

    #[tokio::test]
    async fn realtime_channel_receives_copies() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(TelemetryBuffer::new(dir.path().join("b.json"), 100, 3, 1000));
        let deltas = Arc::new(DropQueue::new(16));
        let (tx, mut rx) = mpsc::channel(4);
        let (_trigger, shutdown) = crate::shutdown::channel();

        tokio::spawn(run_intake(
            Arc::clone(&deltas),
            Arc::clone(&buffer),
            "drone-1".to_string(),
            Some(tx),
            shutdown,
        ));

        deltas.push(StateDelta {
            armed: Some(true),
            ..Default::default()
        });

        let record = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.vehicle_id, "drone-1");
        assert_eq!(record.payload["armed"], serde_json::json!(true));
    }
}

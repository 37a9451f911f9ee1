//! The read/write scheduler: the single task that owns all device handler
//! invocations. Each iteration drains a bounded number of queued writes,
//! fans reads out across the device registry, publishes the resulting
//! readings to the read channel, and then sleeps for the configured loop
//! delay. Because one task does all of this, handlers are never invoked
//! concurrently with themselves; plugin authors reason about one device at a
//! time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::device::Device;
use crate::errors::SdkError;
use crate::output::Outputs;
use crate::reading::{DeviceReadings, Reading};
use crate::transaction::{TransactionTracker, WriteData, WriteState};

/// A queued write, pairing a tracked transaction with its target and data.
#[derive(Debug, Clone)]
pub(crate) struct WriteItem {
    pub transaction_id: String,
    pub device_id: String,
    pub data: WriteData,
}

pub(crate) struct Scheduler {
    pub devices: Arc<HashMap<String, Arc<Device>>>,
    pub outputs: Arc<Outputs>,
    pub tracker: TransactionTracker,
    pub write_rx: mpsc::Receiver<WriteItem>,
    pub read_tx: mpsc::Sender<DeviceReadings>,
    pub writes_per_loop: usize,
    pub loop_delay: Duration,
}

impl Scheduler {
    /// Runs the scheduler loop until shutdown is signalled. In-flight
    /// handler calls are not interrupted, but nothing is published after the
    /// loop exits.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(
            writes_per_loop = %self.writes_per_loop,
            loop_delay_ms = %self.loop_delay.as_millis(),
            "scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.drain_writes().await;
            self.dispatch_reads().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.loop_delay) => {}
            }
        }
        debug!("scheduler stopped");
    }

    // Pops up to `writes_per_loop` writes off the queue, stopping early when
    // the queue is empty. Never blocks.
    async fn drain_writes(&mut self) {
        for _ in 0..self.writes_per_loop {
            let item = match self.write_rx.try_recv() {
                Ok(item) => item,
                Err(_) => break,
            };
            self.process_write(item).await;
        }
    }

    async fn process_write(&self, item: WriteItem) {
        let device = match self.devices.get(&item.device_id) {
            Some(device) => device.clone(),
            None => {
                self.tracker
                    .set_state(
                        &item.transaction_id,
                        WriteState::Error,
                        Some("unknown device".to_string()),
                    )
                    .await;
                return;
            }
        };

        self.tracker
            .set_state(&item.transaction_id, WriteState::Writing, None)
            .await;
        debug!(
            device = %device.id,
            transaction = %item.transaction_id,
            action = %item.data.action,
            "writing to device"
        );
        match device.handler.write(&device, &item.data).await {
            Ok(()) => {
                self.tracker
                    .set_state(&item.transaction_id, WriteState::Done, None)
                    .await
            }
            Err(err) => {
                let err = SdkError::HandlerError(err.to_string());
                error!(device = %device.id, error = %err, "device write failed");
                self.tracker
                    .set_state(&item.transaction_id, WriteState::Error, Some(err.to_string()))
                    .await
            }
        }
    }

    // Reads every readable device once. Devices are grouped under their
    // handler so a bulk-capable handler gets a single call per iteration;
    // bulk read wins over single-device read when a handler supports both.
    // Handler errors are logged and do not abort the iteration.
    async fn dispatch_reads(&self) {
        let mut groups: HashMap<(String, String), Vec<Arc<Device>>> = HashMap::new();
        for device in self.devices.values() {
            groups
                .entry((device.device_type.clone(), device.model.clone()))
                .or_default()
                .push(device.clone());
        }

        for devices in groups.values() {
            let handler = devices[0].handler.clone();
            if handler.supports_bulk_read() {
                match handler.bulk_read(devices).await {
                    Ok(mut by_device) => {
                        for device in devices {
                            if let Some(readings) = by_device.remove(&device.id) {
                                self.publish(device, readings).await;
                            }
                        }
                    }
                    Err(err) => error!(
                        device_type = %devices[0].device_type,
                        model = %devices[0].model,
                        error = %err,
                        "bulk read failed"
                    ),
                }
            } else if handler.supports_read() {
                for device in devices {
                    match handler.read(device).await {
                        Ok(readings) => self.publish(device, readings).await,
                        Err(err) => {
                            error!(device = %device.id, error = %err, "device read failed")
                        }
                    }
                }
            }
        }
    }

    // Stamps, applies outputs to, and publishes one device's readings. The
    // cache only wants latest values, so when the read channel is full the
    // new batch is dropped rather than backpressuring the handlers.
    async fn publish(&self, device: &Device, readings: Vec<Reading>) {
        let mut finalized = Vec::with_capacity(readings.len());
        for reading in readings {
            match self.finalize(device, reading) {
                Ok(reading) => finalized.push(reading),
                Err(err) => {
                    error!(device = %device.id, error = %err, "dropping unsupported reading")
                }
            }
        }
        if finalized.is_empty() {
            return;
        }

        let batch = DeviceReadings {
            device_id: device.id.clone(),
            readings: finalized,
        };
        match self.read_tx.try_send(batch) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                warn!(device = %device.id, "read channel is full, dropping readings")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(device = %device.id, "read channel is closed, dropping readings")
            }
        }
    }

    fn finalize(&self, device: &Device, mut reading: Reading) -> Result<Reading, SdkError> {
        if reading.timestamp.is_none() {
            reading.timestamp = Some(Utc::now());
        }

        let output = device
            .outputs
            .iter()
            .filter_map(|idx| self.outputs.by_index(*idx))
            .find(|output| {
                output.name == reading.output || output.type_name() == reading.output
            });
        match output {
            Some(output) => {
                reading.value = output.apply(reading.value.clone())?;
                if reading.unit.is_none() {
                    reading.unit = Some(output.unit.clone());
                }
            }
            None => debug!(
                device = %device.id,
                output = %reading.output,
                "reading does not match any configured output, passing through"
            ),
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{test_config, test_outputs, TestHandler};
    use crate::device::{default_identifier, handler_map, make_devices, DeviceHandler};
    use crate::output::{OutputType, Outputs, ENGLISH_TO_METRIC_TEMPERATURE};
    use crate::reading::Value;

    struct SlowWriteHandler {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl DeviceHandler for SlowWriteHandler {
        fn device_type(&self) -> &str {
            "temperature"
        }

        fn model(&self) -> &str {
            "temp2010"
        }

        fn supports_write(&self) -> bool {
            true
        }

        async fn write(&self, _device: &Device, data: &WriteData) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            if data.action == "explode" {
                anyhow::bail!("device caught fire");
            }
            Ok(())
        }
    }

    struct BulkHandler;

    #[async_trait::async_trait]
    impl DeviceHandler for BulkHandler {
        fn device_type(&self) -> &str {
            "temperature"
        }

        fn model(&self) -> &str {
            "temp2010"
        }

        // Both are supported; the scheduler must prefer bulk.
        fn supports_read(&self) -> bool {
            true
        }

        fn supports_bulk_read(&self) -> bool {
            true
        }

        async fn read(&self, _device: &Device) -> anyhow::Result<Vec<Reading>> {
            anyhow::bail!("single-device read should not be called when bulk is supported")
        }

        async fn bulk_read(
            &self,
            devices: &[Arc<Device>],
        ) -> anyhow::Result<HashMap<String, Vec<Reading>>> {
            Ok(devices
                .iter()
                .map(|d| {
                    (
                        d.id.clone(),
                        vec![Reading::new("temperature", Value::Int16(30))],
                    )
                })
                .collect())
        }
    }

    fn build_scheduler(
        handler: Arc<dyn DeviceHandler>,
        outputs: Outputs,
        capacity: usize,
        writes_per_loop: usize,
    ) -> (
        Scheduler,
        mpsc::Sender<WriteItem>,
        mpsc::Receiver<DeviceReadings>,
    ) {
        let handlers = handler_map(vec![handler]).unwrap();
        let identifier: Arc<crate::device::DeviceIdentifier> = Arc::new(default_identifier);
        let devices = make_devices(&test_config("42"), &handlers, &outputs, &identifier).unwrap();

        let (write_tx, write_rx) = mpsc::channel(capacity);
        let (read_tx, read_rx) = mpsc::channel(capacity);
        let scheduler = Scheduler {
            devices: Arc::new(devices),
            outputs: Arc::new(outputs),
            tracker: TransactionTracker::new(Duration::from_secs(300)),
            write_rx,
            read_tx,
            writes_per_loop,
            loop_delay: Duration::from_millis(0),
        };
        (scheduler, write_tx, read_rx)
    }

    #[tokio::test]
    async fn reads_are_published_with_timestamp_and_unit() {
        let (scheduler, _write_tx, mut read_rx) =
            build_scheduler(Arc::new(TestHandler), test_outputs(), 8, 5);

        scheduler.dispatch_reads().await;

        let batch = read_rx.recv().await.unwrap();
        assert_eq!(batch.readings.len(), 1);
        let reading = &batch.readings[0];
        // Identity output: the value keeps its dynamic type.
        assert_eq!(reading.value, Value::Int16(72));
        assert_eq!(reading.output, "temperature");
        assert!(reading.timestamp.is_some());
        assert_eq!(reading.unit.as_ref().unwrap().symbol, "C");
    }

    #[tokio::test]
    async fn reads_are_scaled_and_converted() {
        struct HotHandler;

        #[async_trait::async_trait]
        impl DeviceHandler for HotHandler {
            fn device_type(&self) -> &str {
                "temperature"
            }
            fn model(&self) -> &str {
                "temp2010"
            }
            fn supports_read(&self) -> bool {
                true
            }
            async fn read(&self, _device: &Device) -> anyhow::Result<Vec<Reading>> {
                // 150.0 degrees F, scaled by .1 below.
                Ok(vec![Reading::new("temperature", Value::Int16(1500))])
            }
        }

        let mut outputs = Outputs::new();
        outputs
            .register(
                OutputType::new("temperature")
                    .with_scaling_factor(".1")
                    .with_conversion(ENGLISH_TO_METRIC_TEMPERATURE),
            )
            .unwrap();

        let (scheduler, _write_tx, mut read_rx) =
            build_scheduler(Arc::new(HotHandler), outputs, 8, 5);
        scheduler.dispatch_reads().await;

        let batch = read_rx.recv().await.unwrap();
        assert_eq!(batch.readings[0].value, Value::Float64(65.55555555555556));
    }

    #[tokio::test]
    async fn bulk_read_is_preferred() {
        let (scheduler, _write_tx, mut read_rx) =
            build_scheduler(Arc::new(BulkHandler), test_outputs(), 8, 5);

        scheduler.dispatch_reads().await;

        let batch = read_rx.recv().await.unwrap();
        assert_eq!(batch.readings[0].value, Value::Int16(30));
    }

    #[tokio::test]
    async fn full_read_channel_drops_newest() {
        let (scheduler, _write_tx, mut read_rx) =
            build_scheduler(Arc::new(TestHandler), test_outputs(), 1, 5);

        // Two iterations without a consumer: the second batch is dropped.
        scheduler.dispatch_reads().await;
        scheduler.dispatch_reads().await;

        assert!(read_rx.recv().await.is_some());
        assert!(read_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_lifecycle_reaches_done() {
        let (mut scheduler, write_tx, _read_rx) = build_scheduler(
            Arc::new(SlowWriteHandler {
                delay: Duration::from_millis(0),
            }),
            test_outputs(),
            8,
            5,
        );

        let device_id = scheduler.devices.keys().next().unwrap().clone();
        let data = WriteData {
            action: "state".to_string(),
            data: "on".to_string(),
        };
        let txn = scheduler.tracker.create(&device_id, data.clone()).await;
        write_tx
            .send(WriteItem {
                transaction_id: txn.id.clone(),
                device_id,
                data,
            })
            .await
            .unwrap();

        scheduler.drain_writes().await;

        let after = scheduler.tracker.get(&txn.id).await.unwrap();
        assert_eq!(after.state, WriteState::Done);
        assert!(after.updated >= after.created);
    }

    #[tokio::test]
    async fn failed_write_records_the_error() {
        let (mut scheduler, write_tx, _read_rx) = build_scheduler(
            Arc::new(SlowWriteHandler {
                delay: Duration::from_millis(0),
            }),
            test_outputs(),
            8,
            5,
        );

        let device_id = scheduler.devices.keys().next().unwrap().clone();
        let data = WriteData {
            action: "explode".to_string(),
            data: String::new(),
        };
        let txn = scheduler.tracker.create(&device_id, data.clone()).await;
        write_tx
            .send(WriteItem {
                transaction_id: txn.id.clone(),
                device_id,
                data,
            })
            .await
            .unwrap();

        scheduler.drain_writes().await;

        let after = scheduler.tracker.get(&txn.id).await.unwrap();
        assert_eq!(after.state, WriteState::Error);
        assert!(after.message.contains("device caught fire"));
    }

    #[tokio::test]
    async fn unknown_device_write_errors_the_transaction() {
        let (mut scheduler, write_tx, _read_rx) =
            build_scheduler(Arc::new(TestHandler), test_outputs(), 8, 5);

        let data = WriteData::default();
        let txn = scheduler.tracker.create("no-such-device", data.clone()).await;
        write_tx
            .send(WriteItem {
                transaction_id: txn.id.clone(),
                device_id: "no-such-device".to_string(),
                data,
            })
            .await
            .unwrap();

        scheduler.drain_writes().await;

        let after = scheduler.tracker.get(&txn.id).await.unwrap();
        assert_eq!(after.state, WriteState::Error);
        assert_eq!(after.message, "unknown device");
    }

    #[tokio::test]
    async fn writes_per_loop_bounds_each_drain() {
        let (mut scheduler, write_tx, _read_rx) = build_scheduler(
            Arc::new(SlowWriteHandler {
                delay: Duration::from_millis(0),
            }),
            test_outputs(),
            8,
            2,
        );

        let device_id = scheduler.devices.keys().next().unwrap().clone();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let data = WriteData {
                action: "state".to_string(),
                data: "on".to_string(),
            };
            let txn = scheduler.tracker.create(&device_id, data.clone()).await;
            write_tx
                .send(WriteItem {
                    transaction_id: txn.id.clone(),
                    device_id: device_id.clone(),
                    data,
                })
                .await
                .unwrap();
            ids.push(txn.id);
        }

        scheduler.drain_writes().await;
        let states = futures::future::join_all(
            ids.iter().map(|id| scheduler.tracker.get(id)),
        )
        .await;
        let done = states
            .iter()
            .filter(|t| t.as_ref().unwrap().state == WriteState::Done)
            .count();
        assert_eq!(done, 2);

        scheduler.drain_writes().await;
        let last = scheduler.tracker.get(&ids[2]).await.unwrap();
        assert_eq!(last.state, WriteState::Done);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (mut scheduler, _write_tx, _read_rx) =
            build_scheduler(Arc::new(TestHandler), test_outputs(), 8, 5);
        scheduler.loop_delay = Duration::from_millis(5);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}

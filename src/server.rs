//! The gRPC surface of a plugin. This translates incoming requests into
//! registry lookups, reading cache queries, and enqueues onto the write
//! queue; it never talks to device handlers directly. Each request is
//! handled on its own task and never blocks the scheduler.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::api::v3 as api;
use crate::api::v3::plugin_server;
use crate::cache::ReadingCache;
use crate::device::Device;
use crate::errors::SdkError;
use crate::output::Outputs;
use crate::scheduler::WriteItem;
use crate::transaction::{TransactionTracker, WriteData};

/// The static identity a plugin reports through Metainfo.
#[derive(Debug, Clone, Default)]
pub(crate) struct PluginMeta {
    pub name: String,
    pub version: String,
    pub description: String,
    pub maintainer: String,
}

/// The implementation of the `synse.v3.Plugin` service.
#[derive(Clone)]
pub(crate) struct PluginService {
    pub devices: Arc<HashMap<String, Arc<Device>>>,
    pub outputs: Arc<Outputs>,
    pub cache: ReadingCache,
    pub tracker: TransactionTracker,
    pub write_tx: mpsc::Sender<WriteItem>,
    pub meta: PluginMeta,
}

#[async_trait::async_trait]
impl plugin_server::Plugin for PluginService {
    async fn test(
        &self,
        _request: Request<api::Empty>,
    ) -> Result<Response<api::TestStatus>, Status> {
        Ok(Response::new(api::TestStatus { ok: true }))
    }

    async fn metainfo(
        &self,
        _request: Request<api::Empty>,
    ) -> Result<Response<api::PluginMetadata>, Status> {
        Ok(Response::new(api::PluginMetadata {
            name: self.meta.name.clone(),
            version: self.meta.version.clone(),
            sdk_version: crate::SDK_VERSION.to_string(),
            description: self.meta.description.clone(),
            maintainer: self.meta.maintainer.clone(),
        }))
    }

    async fn health(
        &self,
        _request: Request<api::Empty>,
    ) -> Result<Response<api::PluginHealth>, Status> {
        Ok(Response::new(api::PluginHealth {
            status: api::plugin_health::Status::Ok as i32,
            timestamp: Utc::now().to_rfc3339(),
        }))
    }

    async fn capabilities(
        &self,
        _request: Request<api::Empty>,
    ) -> Result<Response<api::CapabilitiesResponse>, Status> {
        let mut by_kind: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for device in self.devices.values() {
            let outputs = by_kind.entry(device.kind.clone()).or_default();
            for idx in &device.outputs {
                if let Some(output) = self.outputs.by_index(*idx) {
                    if !outputs.contains(&output.name) {
                        outputs.push(output.name.clone());
                    }
                }
            }
        }
        Ok(Response::new(api::CapabilitiesResponse {
            capabilities: by_kind
                .into_iter()
                .map(|(kind, outputs)| api::DeviceCapability { kind, outputs })
                .collect(),
        }))
    }

    type DevicesStream =
        Pin<Box<dyn Stream<Item = Result<api::DeviceSummary, Status>> + Send + Sync + 'static>>;

    async fn devices(
        &self,
        request: Request<api::DeviceFilter>,
    ) -> Result<Response<Self::DevicesStream>, Status> {
        let filter = request.into_inner();
        let mut summaries: Vec<api::DeviceSummary> = self
            .devices
            .values()
            .filter(|device| filter.kind.is_empty() || device.kind == filter.kind)
            .map(|device| device.to_rpc(&self.outputs))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = %summaries.len(), "streaming devices");

        let (tx, rx) = mpsc::channel(std::cmp::max(summaries.len(), 1));
        tokio::spawn(async move {
            for summary in summaries {
                if tx.send(Ok(summary)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(Box::pin(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        )))
    }

    async fn read(
        &self,
        request: Request<api::ReadRequest>,
    ) -> Result<Response<api::ReadResponse>, Status> {
        let device_id = request.into_inner().device_id;
        if !self.devices.contains_key(&device_id) {
            return Err(Status::not_found(
                SdkError::UnknownDevice(device_id).to_string(),
            ));
        }
        let readings = self
            .cache
            .get(&device_id)
            .await
            .unwrap_or_default()
            .iter()
            .map(|reading| reading.to_rpc())
            .collect();
        Ok(Response::new(api::ReadResponse { readings }))
    }

    async fn write(
        &self,
        request: Request<api::WriteRequest>,
    ) -> Result<Response<api::WriteResponse>, Status> {
        let request = request.into_inner();
        if !self.devices.contains_key(&request.device_id) {
            return Err(Status::not_found(
                SdkError::UnknownDevice(request.device_id).to_string(),
            ));
        }

        // Reserve a queue slot for every datum before tracking anything, so
        // the request enqueues all of its writes or none of them. Without
        // this, a full queue partway through would strand already-enqueued
        // transactions: tracked, eventually executed, but with IDs the
        // caller never received.
        let mut permits = Vec::with_capacity(request.data.len());
        for _ in 0..request.data.len() {
            match self.write_tx.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(TrySendError::Full(())) => {
                    warn!(device = %request.device_id, "write queue is full, rejecting write");
                    return Err(Status::resource_exhausted(SdkError::QueueFull.to_string()));
                }
                Err(TrySendError::Closed(())) => {
                    return Err(Status::unavailable("plugin is shutting down"));
                }
            }
        }

        let mut transactions = Vec::with_capacity(request.data.len());
        for (data, permit) in request.data.into_iter().zip(permits) {
            let data = WriteData::from_rpc(data);
            let transaction = self.tracker.create(&request.device_id, data.clone()).await;
            transactions.push(transaction.to_rpc());
            permit.send(WriteItem {
                transaction_id: transaction.id,
                device_id: request.device_id.clone(),
                data,
            });
        }
        Ok(Response::new(api::WriteResponse { transactions }))
    }

    async fn transaction(
        &self,
        request: Request<api::TransactionFilter>,
    ) -> Result<Response<api::TransactionStatus>, Status> {
        let id = request.into_inner().id;
        match self.tracker.get(&id).await {
            Some(transaction) => Ok(Response::new(transaction.to_rpc())),
            None => Err(Status::not_found(format!("unknown transaction: {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v3::plugin_server::Plugin;
    use crate::device::tests::{test_config, test_outputs, TestHandler};
    use crate::device::{
        default_identifier, handler_map, make_devices, DeviceHandler, DeviceIdentifier,
    };
    use crate::reading::{DeviceReadings, Reading, Value};
    use futures::StreamExt;
    use std::time::Duration;

    fn service(
        write_capacity: usize,
    ) -> (PluginService, mpsc::Receiver<WriteItem>) {
        let handlers = handler_map(vec![Arc::new(TestHandler) as Arc<dyn DeviceHandler>]).unwrap();
        let identifier: Arc<DeviceIdentifier> = Arc::new(default_identifier);
        let outputs = test_outputs();
        let devices = make_devices(&test_config("42"), &handlers, &outputs, &identifier).unwrap();
        let (write_tx, write_rx) = mpsc::channel(write_capacity);
        let service = PluginService {
            devices: Arc::new(devices),
            outputs: Arc::new(outputs),
            cache: ReadingCache::new(),
            tracker: TransactionTracker::new(Duration::from_secs(300)),
            write_tx,
            meta: PluginMeta {
                name: "test-plugin".to_string(),
                version: "1.0".to_string(),
                description: "a plugin for tests".to_string(),
                maintainer: "vapor io".to_string(),
            },
        };
        (service, write_rx)
    }

    fn device_id(service: &PluginService) -> String {
        service.devices.keys().next().unwrap().clone()
    }

    #[tokio::test]
    async fn test_returns_ok() {
        let (service, _rx) = service(8);
        let status = service
            .test(Request::new(api::Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(status.ok);
    }

    #[tokio::test]
    async fn metainfo_reports_identity() {
        let (service, _rx) = service(8);
        let meta = service
            .metainfo(Request::new(api::Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(meta.name, "test-plugin");
        assert_eq!(meta.version, "1.0");
        assert_eq!(meta.sdk_version, crate::SDK_VERSION);
    }

    #[tokio::test]
    async fn capabilities_groups_outputs_by_kind() {
        let (service, _rx) = service(8);
        let caps = service
            .capabilities(Request::new(api::Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(caps.capabilities.len(), 1);
        assert_eq!(caps.capabilities[0].kind, "temperature");
        assert_eq!(caps.capabilities[0].outputs, vec!["temperature"]);
    }

    #[tokio::test]
    async fn devices_streams_the_registry() {
        let (service, _rx) = service(8);
        let stream = service
            .devices(Request::new(api::DeviceFilter::default()))
            .await
            .unwrap()
            .into_inner();
        let summaries: Vec<_> = stream.collect().await;
        assert_eq!(summaries.len(), 1);
        let summary = summaries[0].as_ref().unwrap();
        assert_eq!(summary.kind, "temperature");
        assert_eq!(summary.location.as_ref().unwrap().rack, "rack-1");
    }

    #[tokio::test]
    async fn devices_honors_the_kind_filter() {
        let (service, _rx) = service(8);
        let stream = service
            .devices(Request::new(api::DeviceFilter {
                kind: "humidity".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        let summaries: Vec<_> = stream.collect().await;
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn read_unknown_device_is_not_found() {
        let (service, _rx) = service(8);
        let err = service
            .read(Request::new(api::ReadRequest {
                device_id: "nope".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn read_returns_cached_readings() {
        let (service, _rx) = service(8);
        let id = device_id(&service);

        // Nothing cached yet: an empty response, not an error.
        let readings = service
            .read(Request::new(api::ReadRequest {
                device_id: id.clone(),
            }))
            .await
            .unwrap()
            .into_inner()
            .readings;
        assert!(readings.is_empty());

        service
            .cache
            .update(DeviceReadings {
                device_id: id.clone(),
                readings: vec![
                    Reading::new("temperature", Value::Int16(72)).with_timestamp(Utc::now())
                ],
            })
            .await;

        let readings = service
            .read(Request::new(api::ReadRequest { device_id: id }))
            .await
            .unwrap()
            .into_inner()
            .readings;
        assert_eq!(readings.len(), 1);
        assert_eq!(
            readings[0].value,
            Some(api::reading::Value::Int32Value(72))
        );
    }

    #[tokio::test]
    async fn write_enqueues_one_transaction_per_datum() {
        let (service, mut rx) = service(8);
        let id = device_id(&service);
        let response = service
            .write(Request::new(api::WriteRequest {
                device_id: id.clone(),
                data: vec![
                    api::WriteData {
                        action: "state".to_string(),
                        data: "on".to_string(),
                    },
                    api::WriteData {
                        action: "color".to_string(),
                        data: "ff0000".to_string(),
                    },
                ],
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.transactions.len(), 2);
        for transaction in &response.transactions {
            assert!(!transaction.id.is_empty());
            assert_eq!(transaction.status, api::WriteStatus::Pending as i32);
            assert!(service.tracker.get(&transaction.id).await.is_some());
        }

        // Writes for the same device drain in enqueue order.
        assert_eq!(rx.recv().await.unwrap().data.action, "state");
        assert_eq!(rx.recv().await.unwrap().data.action, "color");
    }

    #[tokio::test]
    async fn write_unknown_device_is_not_found() {
        let (service, _rx) = service(8);
        let err = service
            .write(Request::new(api::WriteRequest {
                device_id: "nope".to_string(),
                data: vec![api::WriteData::default()],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn write_full_queue_is_resource_exhausted() {
        let (service, mut rx) = service(1);
        let id = device_id(&service);
        let data = vec![
            api::WriteData {
                action: "state".to_string(),
                data: "on".to_string(),
            },
            api::WriteData {
                action: "state".to_string(),
                data: "off".to_string(),
            },
        ];
        let err = service
            .write(Request::new(api::WriteRequest {
                device_id: id.clone(),
                data,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);

        // The rejection is all-or-nothing: nothing from the oversized
        // request was enqueued, so the queue has room for a new write.
        assert!(rx.try_recv().is_err());
        let response = service
            .write(Request::new(api::WriteRequest {
                device_id: id,
                data: vec![api::WriteData {
                    action: "state".to_string(),
                    data: "on".to_string(),
                }],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.transactions.len(), 1);
        assert_eq!(rx.try_recv().unwrap().data.action, "state");
    }

    #[tokio::test]
    async fn transaction_lookup() {
        let (service, _rx) = service(8);
        let txn = service
            .tracker
            .create("dev-1", WriteData::default())
            .await;

        let status = service
            .transaction(Request::new(api::TransactionFilter {
                id: txn.id.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.id, txn.id);
        assert_eq!(status.status, api::WriteStatus::Pending as i32);

        let err = service
            .transaction(Request::new(api::TransactionFilter {
                id: "reaped-or-unknown".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}

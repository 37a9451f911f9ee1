//! The client side of a plugin's Unix socket, for tests and tooling that
//! talk to a plugin directly rather than through the Synse server. tonic
//! only dials TCP on its own, so connecting means handing the endpoint a
//! connector that opens the plugin's socket instead.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Returns a channel connected to the plugin socket at the given path. Pass
/// the channel to `PluginClient::new`.
pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref().to_owned();

    // The endpoint builder insists on a URI, but the connector below opens
    // the plugin socket and never looks at it.
    Endpoint::from_static("http://plugin.sock")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
}

/// Like [`connect`], but keeps retrying until the deadline passes. Useful
/// when the plugin is starting up concurrently and its socket may not exist
/// yet.
pub async fn connect_with_retry<P: AsRef<Path>>(
    path: P,
    timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match connect(path.as_ref()).await {
            Ok(channel) => return Ok(channel),
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(err);
                }
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

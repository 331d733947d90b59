use super::server::{EventRecorder, test_rpc_config};
use broker_remoting::*;
use std::sync::Arc;

pub fn test_client_config() -> ClientConfig {
    let mut rpc = test_rpc_config();
    rpc.oneway_permits = 65535;
    rpc.async_permits = 65535;
    ClientConfig { rpc }
}

pub fn init_client(config: ClientConfig, listener: Option<Arc<EventRecorder>>) -> RemotingClient {
    let client = RemotingClient::new(config);
    if let Some(listener) = listener {
        client.register_channel_event_listener(listener);
    }
    client.start();
    client
}

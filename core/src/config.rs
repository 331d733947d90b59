use std::time::Duration;

/// Settings shared by the server and the client engine.
#[derive(Clone, Debug)]
pub struct RemotingConfig {
    pub timeout: TimeoutSetting,
    /// How many one-way requests may be in flight (not yet written), 0 disables the gate.
    pub oneway_permits: usize,
    /// How many async requests may wait for their response, 0 disables the gate.
    pub async_permits: usize,
    /// How long an async/one-way call waits for a permit before failing with TooManyRequests.
    ///
    /// Zero means fail immediately. A non-zero wait is capped by the call's own timeout.
    pub permit_wait: Duration,
    /// Max in-flight jobs of the public executor, used by processors registered without one
    pub public_executor_capacity: usize,
    /// Max in-flight jobs of the executor running async callbacks
    pub callback_executor_capacity: usize,
    /// Connection events queued beyond this are dropped
    pub event_queue_capacity: usize,
    /// Upper bound of a single frame, in bytes
    pub max_frame_len: usize,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            oneway_permits: 256,
            async_permits: 64,
            permit_wait: Duration::ZERO,
            public_executor_capacity: 4096,
            callback_executor_capacity: 4096,
            event_queue_capacity: 10000,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeoutSetting {
    /// Channel without read or write traffic for this long is closed (IDLE then CLOSE).
    pub idle_timeout: Duration,
    /// Socket write timeout
    pub write_timeout: Duration,
    /// connect timeout, client only
    pub connect_timeout: Duration,
    /// Delay before the first response table scan
    pub scan_initial_delay: Duration,
    /// Period of the response table scan
    pub scan_interval: Duration,
    /// How long shutdown waits for executors to drain
    pub close_wait: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            scan_initial_delay: Duration::from_secs(3),
            scan_interval: Duration::from_secs(1),
            close_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on, port 0 picks a free port (see `local_listen_port()`)
    pub listen_addr: String,
    pub rpc: RemotingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: "0.0.0.0:8888".to_string(), rpc: RemotingConfig::default() }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub rpc: RemotingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut rpc = RemotingConfig::default();
        // The client side fans out to many servers, gate generously
        rpc.oneway_permits = 65535;
        rpc.async_permits = 65535;
        Self { rpc }
    }
}
